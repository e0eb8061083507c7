use std::fmt::{self, Display, Formatter};
use thiserror::Error;

pub use uuid::Uuid;

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
pub const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

const BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// UUID extension trait to convert to and from Bluetooth short UUIDs.
pub trait UuidExt {
    /// 32-bit short form of Bluetooth UUID.
    fn as_u32(&self) -> Option<u32>;
    /// 16-bit short form of Bluetooth UUID.
    fn as_u16(&self) -> Option<u16>;
    /// Long form of 32-bit short form Bluetooth UUID.
    fn from_u32(v: u32) -> Uuid;
    /// Long form of 16-bit short form Bluetooth UUID.
    fn from_u16(v: u16) -> Uuid;
}

impl UuidExt for Uuid {
    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BASE_MASK_32 == BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BASE_MASK_16 == BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn from_u32(v: u32) -> Uuid {
        Uuid::from_u128(BASE_UUID | ((v as u128) << 96))
    }

    fn from_u16(v: u16) -> Uuid {
        Uuid::from_u128(BASE_UUID | ((v as u128) << 96))
    }
}

/// Error decoding a [BtUuid] from wire bytes.
#[derive(Clone, Debug, Error)]
pub enum UuidDecodeError {
    #[error("invalid uuid length: {0} (expected 2, 4 or 16)")]
    InvalidLength(usize),
}

/// A Bluetooth UUID in one of its three wire widths.
///
/// Equality is per width; compare across widths via [BtUuid::to_uuid128].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BtUuid {
    Uuid16(u16),
    Uuid32(u32),
    Uuid128(Uuid),
}

impl BtUuid {
    /// Number of octets of the wire representation.
    pub fn num_bytes(&self) -> usize {
        match self {
            Self::Uuid16(_) => 2,
            Self::Uuid32(_) => 4,
            Self::Uuid128(_) => 16,
        }
    }

    /// Decodes from little-endian wire bytes; the width is the slice length.
    pub fn from_le_slice(slice: &[u8]) -> Result<Self, UuidDecodeError> {
        match slice.len() {
            2 => Ok(Self::Uuid16(u16::from_le_bytes([slice[0], slice[1]]))),
            4 => Ok(Self::Uuid32(u32::from_le_bytes([
                slice[0], slice[1], slice[2], slice[3],
            ]))),
            16 => {
                let mut b: [u8; 16] = slice.try_into().unwrap();
                b.reverse();
                Ok(Self::Uuid128(Uuid::from_bytes(b)))
            }
            n => Err(UuidDecodeError::InvalidLength(n)),
        }
    }

    /// Writes the little-endian wire representation into `out`.
    ///
    /// `out` must be exactly [BtUuid::num_bytes] long.
    pub fn write_le(&self, out: &mut [u8]) {
        match self {
            Self::Uuid16(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::Uuid32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::Uuid128(v) => {
                let mut b = *v.as_bytes();
                b.reverse();
                out.copy_from_slice(&b);
            }
        }
    }

    /// Expands to the 128-bit form by substitution into the base UUID.
    ///
    /// The short value lands at octet index 12 of the little-endian wire
    /// layout, i.e. the leading field of the canonical textual form.
    pub fn to_uuid128(self) -> Uuid {
        match self {
            Self::Uuid16(v) => Uuid::from_u16(v),
            Self::Uuid32(v) => Uuid::from_u32(v),
            Self::Uuid128(v) => v,
        }
    }

    /// Narrows a 128-bit form back to the shortest width that represents it.
    pub fn shortest(self) -> Self {
        match self {
            Self::Uuid128(v) => {
                if let Some(v16) = v.as_u16() {
                    Self::Uuid16(v16)
                } else if let Some(v32) = v.as_u32() {
                    Self::Uuid32(v32)
                } else {
                    self
                }
            }
            _ => self,
        }
    }
}

impl From<u16> for BtUuid {
    fn from(v: u16) -> Self {
        Self::Uuid16(v)
    }
}

impl From<u32> for BtUuid {
    fn from(v: u32) -> Self {
        Self::Uuid32(v)
    }
}

impl From<Uuid> for BtUuid {
    fn from(v: Uuid) -> Self {
        Self::Uuid128(v)
    }
}

impl Display for BtUuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Uuid16(v) => write!(f, "{v:04x}"),
            Self::Uuid32(v) => write!(f, "{v:08x}"),
            Self::Uuid128(v) => write!(f, "{v}"),
        }
    }
}
