//! Bounds-checked octet buffers with little-endian accessors.
//!
//! Three views with distinct ownership: [Octets] borrows immutably,
//! [OctetsMut] borrows mutably, [OctetBuf] owns its storage.

use btdirect_shared::{uuid::UuidDecodeError, Address, BtUuid};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OctetsError {
    #[error("access of {count} octets at index {index} exceeds length {len}")]
    OutOfBounds {
        index: usize,
        count: usize,
        len: usize,
    },
    #[error("invalid uuid width: {0} octets")]
    InvalidUuidWidth(usize),
}

impl From<UuidDecodeError> for OctetsError {
    fn from(err: UuidDecodeError) -> Self {
        let UuidDecodeError::InvalidLength(n) = err;
        Self::InvalidUuidWidth(n)
    }
}

pub type Result<T> = std::result::Result<T, OctetsError>;

fn check(len: usize, index: usize, count: usize) -> Result<()> {
    if index.checked_add(count).map_or(true, |end| end > len) {
        Err(OctetsError::OutOfBounds { index, count, len })
    } else {
        Ok(())
    }
}

macro_rules! get_uint_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self, index: usize) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let slice = self.slice_at(index, N)?;
            Ok(<$ty>::from_le_bytes(slice.try_into().unwrap()))
        }
    };
}

/// Read-only view over caller-owned octets.
#[derive(Clone, Copy, Debug)]
pub struct Octets<'a> {
    data: &'a [u8],
}

impl<'a> Octets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    pub fn slice_at(&self, index: usize, count: usize) -> Result<&'a [u8]> {
        check(self.data.len(), index, count)?;
        Ok(&self.data[index..index + count])
    }

    pub fn u8_at(&self, index: usize) -> Result<u8> {
        check(self.data.len(), index, 1)?;
        Ok(self.data[index])
    }

    pub fn i8_at(&self, index: usize) -> Result<i8> {
        Ok(self.u8_at(index)? as i8)
    }

    get_uint_le!(u16_at, u16);
    get_uint_le!(u32_at, u32);
    get_uint_le!(u64_at, u64);
    get_uint_le!(u128_at, u128);

    /// Reads a 24-bit little-endian value, e.g. a device class.
    pub fn u24_at(&self, index: usize) -> Result<u32> {
        let slice = self.slice_at(index, 3)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], 0]))
    }

    /// Reads a BD address from its 6-octet little-endian wire form.
    pub fn address_at(&self, index: usize) -> Result<Address> {
        let slice = self.slice_at(index, 6)?;
        Ok(Address::from_le_bytes(slice.try_into().unwrap()))
    }

    /// Reads a UUID of the given wire width (2, 4 or 16 octets).
    pub fn uuid_at(&self, index: usize, width: usize) -> Result<BtUuid> {
        let slice = self.slice_at(index, width)?;
        Ok(BtUuid::from_le_slice(slice)?)
    }
}

/// Mutable view over caller-owned octets.
#[derive(Debug)]
pub struct OctetsMut<'a> {
    data: &'a mut [u8],
}

macro_rules! put_uint_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, index: usize, value: $ty) -> Result<()> {
            const N: usize = std::mem::size_of::<$ty>();
            check(self.data.len(), index, N)?;
            self.data[index..index + N].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    };
}

impl<'a> OctetsMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> Octets<'_> {
        Octets::new(self.data)
    }

    pub fn put_u8_at(&mut self, index: usize, value: u8) -> Result<()> {
        check(self.data.len(), index, 1)?;
        self.data[index] = value;
        Ok(())
    }

    put_uint_le!(put_u16_at, u16);
    put_uint_le!(put_u32_at, u32);
    put_uint_le!(put_u64_at, u64);
    put_uint_le!(put_u128_at, u128);

    pub fn put_slice_at(&mut self, index: usize, slice: &[u8]) -> Result<()> {
        check(self.data.len(), index, slice.len())?;
        self.data[index..index + slice.len()].copy_from_slice(slice);
        Ok(())
    }

    /// Writes a BD address in its little-endian wire form.
    pub fn put_address_at(&mut self, index: usize, addr: Address) -> Result<()> {
        self.put_slice_at(index, &addr.to_le_bytes())
    }

    /// Writes a UUID in its little-endian wire form.
    pub fn put_uuid_at(&mut self, index: usize, uuid: BtUuid) -> Result<()> {
        check(self.data.len(), index, uuid.num_bytes())?;
        uuid.write_le(&mut self.data[index..index + uuid.num_bytes()]);
        Ok(())
    }
}

/// Owned octet buffer with independent capacity and length.
#[derive(Clone, Debug, Default)]
pub struct OctetBuf {
    buf: BytesMut,
}

impl OctetBuf {
    pub fn new(len: usize) -> Self {
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        Self { buf }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(slice),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn resize(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    pub fn view(&self) -> Octets<'_> {
        Octets::new(&self.buf)
    }

    pub fn view_mut(&mut self) -> OctetsMut<'_> {
        OctetsMut::new(&mut self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
