//! Host side of the btdirect stack: raw `AF_BLUETOOTH` sockets for the
//! kernel's MGMT control, HCI raw and L2CAP channels, the socket-backed
//! transport implementations, and the adapter/device registry on top.

pub mod adapter;
pub mod device;
pub mod manager;
pub mod sock;
pub mod transport;

pub use adapter::{Adapter, AdapterError, AdapterStatusListener, DeviceFilter, DiscoveryPhase};
pub use device::{Device, DeviceError};
pub use manager::{Manager, ManagerConfig, ManagerError};
pub use btdirect_shared::{Address, AddressType};
