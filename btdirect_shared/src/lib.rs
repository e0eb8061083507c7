pub mod addr;
pub mod event;
pub mod uuid;

pub use addr::{Address, AddressType, InvalidAddressError, RandomAddressType};
pub use uuid::{BtUuid, UuidExt};
