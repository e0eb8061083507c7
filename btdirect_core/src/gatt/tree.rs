//! The discovered GATT forest of one connection.
//!
//! Parents own children; a child refers back to its parent by handle only,
//! so no descriptor keeps a dropped connection alive.

use bitflags::bitflags;
use btdirect_shared::BtUuid;
use bytes::Bytes;

/// Well-known 16-bit declaration types.
pub const TYPE_PRIMARY_SERVICE: u16 = 0x2800;
pub const TYPE_SECONDARY_SERVICE: u16 = 0x2801;
pub const TYPE_INCLUDE: u16 = 0x2802;
pub const TYPE_CHARACTERISTIC: u16 = 0x2803;

/// Well-known 16-bit descriptor types.
pub const TYPE_CHARACTERISTIC_EXT_PROPS: u16 = 0x2900;
pub const TYPE_USER_DESCRIPTION: u16 = 0x2901;
pub const TYPE_CLIENT_CHARACTERISTIC_CONFIG: u16 = 0x2902;

/// CCCD value bits.
pub const ENABLE_NOTIFICATION: u16 = 0x0001;
pub const ENABLE_INDICATION: u16 = 0x0002;

bitflags! {
    /// Characteristic property flags of the declaration attribute.
    pub struct CharProps: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_NO_ACK = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTH_SIGNED_WRITE = 0x40;
        const EXT_PROPS = 0x80;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattDescriptor {
    pub handle: u16,
    pub uuid: BtUuid,
    /// Last value read or written; empty until touched.
    pub value: Bytes,
    /// Handle of the owning characteristic's value attribute.
    pub characteristic_value_handle: u16,
}

impl GattDescriptor {
    pub fn is_cccd(&self) -> bool {
        self.uuid == BtUuid::Uuid16(TYPE_CLIENT_CHARACTERISTIC_CONFIG)
            || self.uuid.to_uuid128()
                == BtUuid::Uuid16(TYPE_CLIENT_CHARACTERISTIC_CONFIG).to_uuid128()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Start handle of the owning service.
    pub service_handle: u16,
    /// Handle of the declaration attribute.
    pub handle: u16,
    pub properties: CharProps,
    /// Handle of the value attribute.
    pub value_handle: u16,
    pub uuid: BtUuid,
    pub descriptors: Vec<GattDescriptor>,
    /// Index of the CCCD within `descriptors`, recorded at discovery for
    /// constant-time access.
    pub cccd_index: Option<usize>,
}

impl GattCharacteristic {
    pub fn cccd(&self) -> Option<&GattDescriptor> {
        self.cccd_index.and_then(|i| self.descriptors.get(i))
    }

    pub fn supports(&self, props: CharProps) -> bool {
        self.properties.contains(props)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattService {
    /// Start handle; the declaration attribute.
    pub handle: u16,
    pub end_handle: u16,
    pub primary: bool,
    pub uuid: BtUuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn contains(&self, handle: u16) -> bool {
        self.handle <= handle && handle <= self.end_handle
    }
}

/// Resolves a characteristic by its value handle; handles are unique per
/// server, so at most one match exists.
pub fn find_by_value_handle(
    services: &[GattService],
    value_handle: u16,
) -> Option<&GattCharacteristic> {
    services
        .iter()
        .filter(|s| s.contains(value_handle))
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.value_handle == value_handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<GattService> {
        vec![GattService {
            handle: 0x0001,
            end_handle: 0x0030,
            primary: true,
            uuid: BtUuid::Uuid16(0x180D),
            characteristics: vec![GattCharacteristic {
                service_handle: 0x0001,
                handle: 0x001F,
                properties: CharProps::READ | CharProps::NOTIFY,
                value_handle: 0x0020,
                uuid: BtUuid::Uuid16(0x2A37),
                descriptors: vec![GattDescriptor {
                    handle: 0x0021,
                    uuid: BtUuid::Uuid16(TYPE_CLIENT_CHARACTERISTIC_CONFIG),
                    value: Bytes::new(),
                    characteristic_value_handle: 0x0020,
                }],
                cccd_index: Some(0),
            }],
        }]
    }

    #[test]
    fn finds_characteristic_by_value_handle() {
        let services = sample();
        let found = find_by_value_handle(&services, 0x0020).unwrap();
        assert_eq!(found.uuid, BtUuid::Uuid16(0x2A37));
        assert!(find_by_value_handle(&services, 0x0022).is_none());
    }

    #[test]
    fn cccd_lookup_is_indexed() {
        let services = sample();
        let cccd = services[0].characteristics[0].cccd().unwrap();
        assert!(cccd.is_cccd());
        assert_eq!(cccd.handle, 0x0021);
    }
}
