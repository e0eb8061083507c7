use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    fmt::{self, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::{Display, EnumString};

/// Bluetooth device address.
///
/// Stored and formatted in big-endian textual order (high octet first);
/// the kernel wire order is the reverse of this.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// Reads an address from its little-endian wire representation.
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        let mut b = bytes;
        b.reverse();
        Self(b)
    }

    /// Returns the little-endian wire representation.
    pub fn to_le_bytes(self) -> [u8; 6] {
        let mut b = self.0;
        b.reverse();
        b
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddressError(pub String);

impl fmt::Display for InvalidAddressError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddressError {}

impl FromStr for Address {
    type Err = InvalidAddressError;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddressError> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddressError(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddressError>>()?;
        Ok(Self(
            fields
                .try_into()
                .map_err(|_| InvalidAddressError(s.to_string()))?,
        ))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Bluetooth device address kind.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive,
)]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[strum(serialize = "br/edr")]
    BrEdr = 0x00,
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = 0x01,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = 0x02,
    /// Address kind not known yet.
    #[strum(serialize = "undefined")]
    Undefined = 0xFF,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::Undefined
    }
}

/// Subtype of an LE random address, classified by the top two bits of the
/// most-significant octet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum RandomAddressType {
    #[strum(serialize = "unresolvable-private")]
    UnresolvablePrivate,
    #[strum(serialize = "resolvable-private")]
    ResolvablePrivate,
    #[strum(serialize = "reserved")]
    Reserved,
    #[strum(serialize = "static-public")]
    StaticPublic,
    /// Not an LE random address.
    #[strum(serialize = "undefined")]
    Undefined,
}

impl RandomAddressType {
    /// Classifies `addr` assuming it is of the given kind.
    pub fn of(addr: &Address, addr_type: AddressType) -> Self {
        if addr_type != AddressType::LeRandom {
            return Self::Undefined;
        }
        match addr.0[0] >> 6 {
            0b00 => Self::UnresolvablePrivate,
            0b01 => Self::ResolvablePrivate,
            0b10 => Self::Reserved,
            _ => Self::StaticPublic,
        }
    }
}
