//! Transport-generic core of the btdirect stack: wire types for the kernel
//! MGMT control channel, raw HCI and ATT/GATT, plus the three protocol
//! engines driving them.
//!
//! Engines are written against the [mgmt::MgmtTransport], [hci::HciTransport]
//! and [gatt::AttBearer] traits; `btdirect_host` provides the socket-backed
//! implementations.

pub mod att;
pub mod gatt;
pub mod hci;
pub mod mgmt;
pub mod octets;
pub mod report;
pub mod ring;

pub use btdirect_shared::{Address, AddressType, BtUuid, RandomAddressType, UuidExt};
