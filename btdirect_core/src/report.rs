//! Parsed extended-inquiry-response / advertisement data.
//!
//! GAP AD structures are a sequence of `len(1) | type(1) | payload(len-1)`
//! records. The same layout arrives from LE advertising reports and from
//! BR/EDR inquiry responses; the source tag tells them apart.

use crate::octets::Octets;
use bitflags::bitflags;
use btdirect_shared::{Address, AddressType, BtUuid};
use bytes::Bytes;
use std::time::Instant;
use strum::Display;

const AD_FLAGS: u8 = 0x01;
const AD_UUID16_INCOMPLETE: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_INCOMPLETE: u8 = 0x04;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_INCOMPLETE: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_DEV_CLASS: u8 = 0x0D;
const AD_SSP_HASH_C192: u8 = 0x0E;
const AD_SSP_RANDOMIZER_R192: u8 = 0x0F;
const AD_DEVICE_ID: u8 = 0x10;
const AD_APPEARANCE: u8 = 0x19;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Where a report was learned from.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum ReportSource {
    /// HCI LE advertising report.
    #[strum(serialize = "ad")]
    Ad,
    /// Extended inquiry response.
    #[strum(serialize = "eir")]
    Eir,
}

bitflags! {
    /// Which optional fields a report carries.
    pub struct ReportFields: u32 {
        const EVT_TYPE = 1 << 0;
        const FLAGS = 1 << 1;
        const NAME = 1 << 2;
        const NAME_SHORT = 1 << 3;
        const RSSI = 1 << 4;
        const TX_POWER = 1 << 5;
        const MANUFACTURER_DATA = 1 << 6;
        const SERVICE_UUIDS = 1 << 7;
        const DEV_CLASS = 1 << 8;
        const APPEARANCE = 1 << 9;
        const SSP_HASH = 1 << 10;
        const SSP_RANDOMIZER = 1 << 11;
        const DEVICE_ID = 1 << 12;
    }
}

/// Device id quadruple of the `0x10` AD record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct DeviceId {
    pub source: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

/// One parsed advertisement / inquiry report.
#[derive(Clone, Debug)]
pub struct EirReport {
    pub source: ReportSource,
    pub timestamp: Instant,
    pub event_type: u8,
    pub address: Address,
    pub address_type: AddressType,
    pub fields: ReportFields,
    pub flags: Option<u8>,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub rssi: Option<i8>,
    pub tx_power: Option<i8>,
    pub manufacturer: Option<u16>,
    pub manufacturer_data: Option<Bytes>,
    pub services: Vec<BtUuid>,
    pub dev_class: Option<u32>,
    pub appearance: Option<u16>,
    pub ssp_hash: Option<[u8; 16]>,
    pub ssp_randomizer: Option<[u8; 16]>,
    pub device_id: Option<DeviceId>,
}

impl EirReport {
    pub fn new(source: ReportSource, address: Address, address_type: AddressType) -> Self {
        Self {
            source,
            timestamp: Instant::now(),
            event_type: 0,
            address,
            address_type,
            fields: ReportFields::empty(),
            flags: None,
            name: None,
            short_name: None,
            rssi: None,
            tx_power: None,
            manufacturer: None,
            manufacturer_data: None,
            services: Vec::new(),
            dev_class: None,
            appearance: None,
            ssp_hash: None,
            ssp_randomizer: None,
            device_id: None,
        }
    }

    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = Some(rssi);
        self.fields |= ReportFields::RSSI;
    }

    pub fn set_event_type(&mut self, event_type: u8) {
        self.event_type = event_type;
        self.fields |= ReportFields::EVT_TYPE;
    }

    /// Parses the AD-structure sequence, merging into this report.
    ///
    /// A record with a bad length ends the walk; everything parsed up to
    /// that point is kept.
    pub fn read_data(&mut self, data: &[u8]) {
        let mut offset = 0usize;
        while offset + 1 < data.len() {
            let len = data[offset] as usize;
            if len == 0 {
                break;
            }
            let Some(end) = offset.checked_add(1 + len) else {
                break;
            };
            if end > data.len() {
                tracing::debug!(target: "report", offset, len, "truncated ad structure, stopping");
                break;
            }
            let ad_type = data[offset + 1];
            let payload = &data[offset + 2..end];
            self.read_record(ad_type, payload);
            offset = end;
        }
    }

    fn read_record(&mut self, ad_type: u8, payload: &[u8]) {
        let view = Octets::new(payload);
        match ad_type {
            AD_FLAGS => {
                if let Ok(flags) = view.u8_at(0) {
                    self.flags = Some(flags);
                    self.fields |= ReportFields::FLAGS;
                }
            }
            AD_NAME_SHORT => {
                self.short_name = Some(String::from_utf8_lossy(payload).into_owned());
                self.fields |= ReportFields::NAME_SHORT;
            }
            AD_NAME_COMPLETE => {
                self.name = Some(String::from_utf8_lossy(payload).into_owned());
                self.fields |= ReportFields::NAME;
            }
            AD_TX_POWER => {
                if let Ok(power) = view.i8_at(0) {
                    self.tx_power = Some(power);
                    self.fields |= ReportFields::TX_POWER;
                }
            }
            AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => self.read_uuids(payload, 2),
            AD_UUID32_INCOMPLETE | AD_UUID32_COMPLETE => self.read_uuids(payload, 4),
            AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => self.read_uuids(payload, 16),
            AD_DEV_CLASS => {
                if let Ok(class) = view.u24_at(0) {
                    self.dev_class = Some(class);
                    self.fields |= ReportFields::DEV_CLASS;
                }
            }
            AD_APPEARANCE => {
                if let Ok(appearance) = view.u16_at(0) {
                    self.appearance = Some(appearance);
                    self.fields |= ReportFields::APPEARANCE;
                }
            }
            AD_SSP_HASH_C192 => {
                if let Ok(hash) = view.slice_at(0, 16) {
                    self.ssp_hash = Some(hash.try_into().unwrap());
                    self.fields |= ReportFields::SSP_HASH;
                }
            }
            AD_SSP_RANDOMIZER_R192 => {
                if let Ok(randomizer) = view.slice_at(0, 16) {
                    self.ssp_randomizer = Some(randomizer.try_into().unwrap());
                    self.fields |= ReportFields::SSP_RANDOMIZER;
                }
            }
            AD_DEVICE_ID => {
                if let (Ok(source), Ok(vendor), Ok(product), Ok(version)) = (
                    view.u16_at(0),
                    view.u16_at(2),
                    view.u16_at(4),
                    view.u16_at(6),
                ) {
                    self.device_id = Some(DeviceId {
                        source,
                        vendor,
                        product,
                        version,
                    });
                    self.fields |= ReportFields::DEVICE_ID;
                }
            }
            AD_MANUFACTURER_DATA => {
                if let Ok(company) = view.u16_at(0) {
                    self.manufacturer = Some(company);
                    self.manufacturer_data = Some(Bytes::copy_from_slice(&payload[2..]));
                    self.fields |= ReportFields::MANUFACTURER_DATA;
                }
            }
            other => {
                tracing::trace!(target: "report", ad_type = other, "skipping ad structure");
            }
        }
    }

    fn read_uuids(&mut self, payload: &[u8], width: usize) {
        let view = Octets::new(payload);
        let mut offset = 0;
        while offset + width <= payload.len() {
            if let Ok(uuid) = view.uuid_at(offset, width) {
                if !self.services.contains(&uuid) {
                    self.services.push(uuid);
                }
            }
            offset += width;
        }
        if !self.services.is_empty() {
            self.fields |= ReportFields::SERVICE_UUIDS;
        }
    }

    /// Merges a newer report for the same device, returning the set of
    /// fields that changed value.
    pub fn merge(&mut self, newer: &EirReport) -> ReportFields {
        let mut changed = ReportFields::empty();
        macro_rules! take {
            ($field:ident, $flag:expr) => {
                if newer.$field.is_some() && newer.$field != self.$field {
                    self.$field = newer.$field.clone();
                    changed |= $flag;
                }
            };
        }
        take!(flags, ReportFields::FLAGS);
        take!(name, ReportFields::NAME);
        take!(short_name, ReportFields::NAME_SHORT);
        take!(rssi, ReportFields::RSSI);
        take!(tx_power, ReportFields::TX_POWER);
        take!(dev_class, ReportFields::DEV_CLASS);
        take!(appearance, ReportFields::APPEARANCE);
        take!(ssp_hash, ReportFields::SSP_HASH);
        take!(ssp_randomizer, ReportFields::SSP_RANDOMIZER);
        take!(device_id, ReportFields::DEVICE_ID);
        take!(manufacturer_data, ReportFields::MANUFACTURER_DATA);
        if newer.manufacturer.is_some() {
            self.manufacturer = newer.manufacturer;
        }
        if !newer.services.is_empty() && newer.services != self.services {
            self.services = newer.services.clone();
            changed |= ReportFields::SERVICE_UUIDS;
        }
        if newer.fields.contains(ReportFields::EVT_TYPE) && newer.event_type != self.event_type {
            self.event_type = newer.event_type;
            changed |= ReportFields::EVT_TYPE;
        }
        self.timestamp = newer.timestamp;
        self.fields |= changed;
        changed
    }
}
