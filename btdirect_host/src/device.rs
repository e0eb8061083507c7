//! A remote device learned from scanning or connected to.

use crate::sock::l2cap::SeqPacket;
use crate::transport::L2capAttBearer;
use btdirect_core::gatt::{GattConfig, GattEngine, GattError, GattHandle};
use btdirect_core::report::{EirReport, ReportFields};
use btdirect_shared::{Address, AddressType, RandomAddressType};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use thiserror::Error;

/// Registry identity of a device: address plus kind, so rotating LE random
/// addresses do not conflate with public ones.
pub type DeviceKey = (Address, AddressType);

#[derive(Clone, Error, Debug)]
pub enum DeviceError {
    #[error("device is not connected")]
    NotConnected,
    #[error("gatt: {0}")]
    Gatt(#[from] GattError),
    #[error("internal error: {0}")]
    Internal(DeviceInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum DeviceInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(DeviceInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

pub struct Device {
    dev_id: u16,
    address: Address,
    address_type: AddressType,
    created: Instant,
    report: StdMutex<Option<EirReport>>,
    /// Controller connection handle; 0 means not connected.
    handle: AtomicU16,
    gatt: StdMutex<Option<(GattEngine, Arc<GattHandle>)>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("address_type", &self.address_type)
            .field("handle", &self.handle.load(Ordering::Relaxed))
            .finish()
    }
}

impl Device {
    pub(crate) fn new(dev_id: u16, address: Address, address_type: AddressType) -> Arc<Self> {
        Arc::new(Self {
            dev_id,
            address,
            address_type,
            created: Instant::now(),
            report: StdMutex::new(None),
            handle: AtomicU16::new(0),
            gatt: StdMutex::new(None),
        })
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn key(&self) -> DeviceKey {
        (self.address, self.address_type)
    }

    pub fn random_address_type(&self) -> RandomAddressType {
        RandomAddressType::of(&self.address, self.address_type)
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Most recent advertisement/inquiry data, if any.
    pub fn report(&self) -> Option<EirReport> {
        self.report.lock().unwrap().clone()
    }

    pub fn name(&self) -> Option<String> {
        let report = self.report.lock().unwrap();
        report
            .as_ref()
            .and_then(|r| r.name.clone().or_else(|| r.short_name.clone()))
    }

    pub fn rssi(&self) -> Option<i8> {
        self.report.lock().unwrap().as_ref().and_then(|r| r.rssi)
    }

    pub fn tx_power(&self) -> Option<i8> {
        self.report.lock().unwrap().as_ref().and_then(|r| r.tx_power)
    }

    /// Merges a newer report; returns the fields whose value changed.
    pub(crate) fn update_from_report(&self, newer: &EirReport) -> ReportFields {
        let mut report = self.report.lock().unwrap();
        match report.as_mut() {
            Some(current) => current.merge(newer),
            None => {
                *report = Some(newer.clone());
                newer.fields
            }
        }
    }

    pub fn connection_handle(&self) -> Option<u16> {
        match self.handle.load(Ordering::Relaxed) {
            0 => None,
            handle => Some(handle),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_handle().is_some()
    }

    pub(crate) fn set_connection_handle(&self, handle: u16) {
        self.handle.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn clear_connection(&self) {
        self.handle.store(0, Ordering::Relaxed);
        self.close_gatt();
    }

    /// Opens the ATT channel to this device, exchanges the MTU and runs a
    /// full discovery pass. Idempotent while the engine is alive.
    pub async fn connect_gatt(
        &self,
        local: Address,
        local_type: AddressType,
        config: GattConfig,
    ) -> Result<GattEngine, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if let Some((engine, _)) = self.gatt.lock().unwrap().as_ref() {
            if engine.is_open() {
                return Ok(engine.clone());
            }
        }
        let sock =
            SeqPacket::connect_att(local, local_type, self.address, self.address_type).await?;
        let bearer = Arc::new(L2capAttBearer::new(sock));
        let (engine, handle) = GattEngine::attach(bearer, config);
        engine.exchange_mtu().await?;
        engine.discover_all().await?;
        *self.gatt.lock().unwrap() = Some((engine.clone(), Arc::new(handle)));
        Ok(engine)
    }

    /// The live GATT engine, if one is attached.
    pub fn gatt(&self) -> Option<GattEngine> {
        self.gatt
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(engine, _)| engine.is_open())
            .map(|(engine, _)| engine.clone())
    }

    /// Drops the GATT engine; its reader stops and the channel closes.
    pub fn close_gatt(&self) {
        self.gatt.lock().unwrap().take();
    }
}
