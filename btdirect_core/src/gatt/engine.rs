//! The GATT client engine.
//!
//! One engine per connected peer. ATT permits a single outstanding request
//! per bearer; the write mutex is held for the full request/response
//! exchange, while notifications and indications bypass the ring and go
//! straight to listeners from the reader task.

use crate::att::{AttErrorCode, AttOpcode, AttPdu, ATT_MTU_MIN};
use crate::gatt::tree::{
    find_by_value_handle, CharProps, GattCharacteristic, GattDescriptor, GattService,
    ENABLE_INDICATION, ENABLE_NOTIFICATION, TYPE_CHARACTERISTIC, TYPE_PRIMARY_SERVICE,
};
use crate::octets::Octets;
use crate::ring::ReplyRing;
use async_trait::async_trait;
use btdirect_shared::BtUuid;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;
use tracing::Instrument;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RING_CAPACITY: usize = 256;
const DEFAULT_CLIENT_MAX_MTU: u16 = 512;

/// One ATT PDU per call, in both directions; the sequential-packet channel
/// preserves datagram boundaries.
#[async_trait]
pub trait AttBearer: fmt::Debug + Send + Sync + 'static {
    async fn send(&self, pdu: Bytes) -> std::io::Result<()>;
    async fn recv(&self) -> std::io::Result<BytesMut>;
}

#[derive(Clone, Error, Debug)]
pub enum GattError {
    #[error("att bearer disconnected")]
    Disconnected,
    #[error("no matching response within the configured timeout")]
    Timeout,
    #[error("server error 0x{code:02x} answering {opcode}")]
    Protocol { opcode: AttOpcode, code: u8 },
    #[error("no characteristic with value handle 0x{0:04x}")]
    NoSuchCharacteristic(u16),
    #[error("characteristic 0x{0:04x} has no client characteristic configuration descriptor")]
    NoCccd(u16),
    #[error("service range 0x{start:04x}..0x{end:04x} is invalid")]
    ServiceRangeInvalid { start: u16, end: u16 },
    #[error("service at 0x{start:04x} overlaps previous range ending 0x{prev_end:04x}")]
    ServiceRangeOverlap { prev_end: u16, start: u16 },
    #[error(
        "characteristic decl 0x{decl:04x} value 0x{value:04x} outside service 0x{start:04x}..0x{end:04x}"
    )]
    CharacteristicRangeInvalid {
        decl: u16,
        value: u16,
        start: u16,
        end: u16,
    },
    #[error("malformed {opcode} response: {reason}")]
    InvalidResponse {
        opcode: AttOpcode,
        reason: &'static str,
    },
    #[error("unexpected {0} pdu while awaiting a response")]
    UnexpectedPdu(AttOpcode),
    #[error("internal error: {0}")]
    Internal(GattInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum GattInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for GattError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(GattInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

/// Per-connection ATT engine state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttConnState {
    Connecting,
    MtuExchanging,
    Ready,
    RequestInFlight,
    Disconnected,
}

/// Value-change listener; callbacks run on the reader task and must not
/// block or issue requests back into this engine.
pub trait GattEventListener: Send + Sync {
    fn on_notification(&self, characteristic: &GattCharacteristic, value: &[u8], ts: Instant) {
        let _ = (characteristic, value, ts);
    }

    fn on_indication(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        confirmed: bool,
        ts: Instant,
    ) {
        let _ = (characteristic, value, confirmed, ts);
    }
}

#[derive(Debug)]
pub struct GattConfig {
    pub reply_timeout: Option<Duration>,
    pub ring_capacity: Option<usize>,
    pub client_max_mtu: Option<u16>,
    /// Answer every indication with a confirmation right after delivery.
    /// Leaving this off starves the server; on by default.
    pub auto_confirm_indications: bool,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            ring_capacity: None,
            client_max_mtu: None,
            auto_confirm_indications: true,
        }
    }
}

/// Handle keeping the reader task alive; dropping it stops the engine.
pub struct GattHandle {
    _close_rx: mpsc::Receiver<()>,
}

impl Drop for GattHandle {
    fn drop(&mut self) {
        // Required for drop order
    }
}

#[derive(Clone)]
pub struct GattEngine {
    inner: Arc<GattInner>,
}

impl fmt::Debug for GattEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GattEngine")
            .field("state", &self.state())
            .field("used_mtu", &self.used_mtu())
            .finish()
    }
}

struct ListenerEntry {
    /// Value handle the listener is scoped to; `None` receives all.
    scope: Option<u16>,
    listener: Arc<dyn GattEventListener>,
}

struct GattInner {
    bearer: Arc<dyn AttBearer>,
    reply_ring: ReplyRing<AttPdu>,
    write_lock: Mutex<()>,
    reply_timeout: Duration,
    state_tx: watch::Sender<AttConnState>,
    client_max_mtu: u16,
    server_mtu: AtomicU16,
    used_mtu: AtomicU16,
    auto_confirm: AtomicBool,
    services: StdMutex<Vec<GattService>>,
    listeners: StdMutex<Vec<ListenerEntry>>,
}

impl GattEngine {
    /// Attaches to an open ATT bearer and spawns the reader task.
    ///
    /// Callers follow up with [GattEngine::exchange_mtu] and a discovery
    /// pass before issuing attribute I/O.
    #[tracing::instrument(target = "gatt", skip_all)]
    pub fn attach(bearer: Arc<dyn AttBearer>, config: GattConfig) -> (Self, GattHandle) {
        tracing::info!("attaching gatt engine");
        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        let inner = Arc::new(GattInner {
            bearer,
            reply_ring: ReplyRing::new(config.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY)),
            write_lock: Mutex::new(()),
            reply_timeout: config.reply_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT),
            state_tx: watch::channel(AttConnState::Connecting).0,
            client_max_mtu: config
                .client_max_mtu
                .unwrap_or(DEFAULT_CLIENT_MAX_MTU)
                .max(ATT_MTU_MIN),
            server_mtu: AtomicU16::new(0),
            used_mtu: AtomicU16::new(ATT_MTU_MIN),
            auto_confirm: AtomicBool::new(config.auto_confirm_indications),
            services: StdMutex::new(Vec::new()),
            listeners: StdMutex::new(Vec::new()),
        });
        tokio::spawn({
            let inner = inner.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = close_tx.closed() => break,
                        frame = inner.bearer.recv() => match frame {
                            Ok(frame) => {
                                if !inner.handle_pdu(&frame).await {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::error!("att bearer read failed: {err}");
                                break;
                            }
                        },
                    }
                }
                inner.shut_down();
            }
            .instrument(tracing::info_span!("gatt_reader"))
        });
        (Self { inner }, GattHandle { _close_rx: close_rx })
    }

    pub fn state(&self) -> AttConnState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() != AttConnState::Disconnected
    }

    /// Effective ATT MTU; 23 until the exchange completed.
    pub fn used_mtu(&self) -> u16 {
        self.inner.used_mtu.load(Ordering::Relaxed)
    }

    /// The server's announced MTU; 0 until the exchange completed.
    pub fn server_mtu(&self) -> u16 {
        self.inner.server_mtu.load(Ordering::Relaxed)
    }

    pub fn set_auto_confirm(&self, enabled: bool) {
        self.inner.auto_confirm.store(enabled, Ordering::Relaxed);
    }

    /// Snapshot of the discovered forest.
    pub fn services(&self) -> Vec<GattService> {
        self.inner.services.lock().unwrap().clone()
    }

    /// Registers a listener for every characteristic. Registration is
    /// deduplicated; returns false if already present.
    pub fn add_listener(&self, listener: Arc<dyn GattEventListener>) -> bool {
        self.inner.add_listener(None, listener)
    }

    /// Registers a listener scoped to one characteristic's value handle.
    pub fn add_listener_for(
        &self,
        value_handle: u16,
        listener: Arc<dyn GattEventListener>,
    ) -> bool {
        self.inner.add_listener(Some(value_handle), listener)
    }

    /// Removes every registration of `listener`; returns false if none.
    pub fn remove_listener(&self, listener: &Arc<dyn GattEventListener>) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|entry| !Arc::ptr_eq(&entry.listener, listener));
        listeners.len() != before
    }

    /// Negotiates the ATT MTU: effective is `min(client, server)`, never
    /// below 23.
    #[tracing::instrument(target = "gatt", skip(self))]
    pub async fn exchange_mtu(&self) -> Result<u16, GattError> {
        let inner = &self.inner;
        inner.set_state(AttConnState::MtuExchanging);
        let req = AttPdu::ExchangeMtuReq {
            mtu: inner.client_max_mtu,
        };
        let rsp = self.request(req, AttOpcode::ExchangeMtuRsp).await?;
        let used = match rsp {
            AttPdu::ExchangeMtuRsp { mtu } => {
                inner.server_mtu.store(mtu, Ordering::Relaxed);
                inner.client_max_mtu.min(mtu).max(ATT_MTU_MIN)
            }
            ref err @ AttPdu::ErrorRsp { .. } => {
                if err.error_code() == Some(AttErrorCode::RequestNotSupported) {
                    // Pre-4.2 server; the default applies.
                    ATT_MTU_MIN
                } else {
                    return Err(GattError::from_error_rsp(err, AttOpcode::ExchangeMtuReq));
                }
            }
            other => return Err(GattError::UnexpectedPdu(other.opcode())),
        };
        inner.used_mtu.store(used, Ordering::Relaxed);
        tracing::debug!(target: "gatt", used, server = self.server_mtu(), "mtu exchanged");
        Ok(used)
    }

    /// Discovers the primary services, replacing the stored forest.
    #[tracing::instrument(target = "gatt", skip(self))]
    pub async fn discover_primary_services(&self) -> Result<Vec<GattService>, GattError> {
        let mut services: Vec<GattService> = Vec::new();
        let mut start: u16 = 0x0001;
        loop {
            let req = AttPdu::ReadByGroupTypeReq {
                start,
                end: 0xFFFF,
                group_type: BtUuid::Uuid16(TYPE_PRIMARY_SERVICE),
            };
            let rsp = self.request(req, AttOpcode::ReadByGroupTypeRsp).await?;
            match rsp {
                AttPdu::ReadByGroupTypeRsp { element_len, data } => {
                    let el = element_len as usize;
                    let uuid_width = el.checked_sub(4).filter(|w| *w == 2 || *w == 16).ok_or(
                        GattError::InvalidResponse {
                            opcode: AttOpcode::ReadByGroupTypeRsp,
                            reason: "bad element length",
                        },
                    )?;
                    if data.is_empty() || data.len() % el != 0 {
                        return Err(GattError::InvalidResponse {
                            opcode: AttOpcode::ReadByGroupTypeRsp,
                            reason: "data not a whole number of elements",
                        });
                    }
                    let view = Octets::new(&data);
                    for i in (0..data.len()).step_by(el) {
                        let s = view.u16_at(i).unwrap();
                        let e = view.u16_at(i + 2).unwrap();
                        let uuid =
                            view.uuid_at(i + 4, uuid_width)
                                .map_err(|_| GattError::InvalidResponse {
                                    opcode: AttOpcode::ReadByGroupTypeRsp,
                                    reason: "truncated element",
                                })?;
                        if s > e {
                            return Err(GattError::ServiceRangeInvalid { start: s, end: e });
                        }
                        if let Some(prev) = services.last() {
                            if s <= prev.end_handle {
                                return Err(GattError::ServiceRangeOverlap {
                                    prev_end: prev.end_handle,
                                    start: s,
                                });
                            }
                        }
                        services.push(GattService {
                            handle: s,
                            end_handle: e,
                            primary: true,
                            uuid,
                            characteristics: Vec::new(),
                        });
                    }
                    let last_end = services.last().map(|s| s.end_handle).unwrap_or(0xFFFF);
                    if last_end == 0xFFFF {
                        break;
                    }
                    start = last_end + 1;
                }
                ref err @ AttPdu::ErrorRsp { .. } => {
                    if err.error_code() == Some(AttErrorCode::AttributeNotFound) {
                        break;
                    }
                    return Err(GattError::from_error_rsp(err, AttOpcode::ReadByGroupTypeReq));
                }
                other => return Err(GattError::UnexpectedPdu(other.opcode())),
            }
        }
        *self.inner.services.lock().unwrap() = services.clone();
        Ok(services)
    }

    /// Discovers the characteristics of one service.
    pub async fn discover_characteristics(
        &self,
        service: &mut GattService,
    ) -> Result<(), GattError> {
        service.characteristics.clear();
        let mut start = service.handle;
        loop {
            if start > service.end_handle {
                break;
            }
            let req = AttPdu::ReadByTypeReq {
                start,
                end: service.end_handle,
                attr_type: BtUuid::Uuid16(TYPE_CHARACTERISTIC),
            };
            let rsp = self.request(req, AttOpcode::ReadByTypeRsp).await?;
            match rsp {
                AttPdu::ReadByTypeRsp { element_len, data } => {
                    let el = element_len as usize;
                    let uuid_width = el.checked_sub(5).filter(|w| *w == 2 || *w == 16).ok_or(
                        GattError::InvalidResponse {
                            opcode: AttOpcode::ReadByTypeRsp,
                            reason: "bad element length",
                        },
                    )?;
                    if data.is_empty() || data.len() % el != 0 {
                        return Err(GattError::InvalidResponse {
                            opcode: AttOpcode::ReadByTypeRsp,
                            reason: "data not a whole number of elements",
                        });
                    }
                    let view = Octets::new(&data);
                    let mut last_decl = start;
                    for i in (0..data.len()).step_by(el) {
                        let decl = view.u16_at(i).unwrap();
                        let properties =
                            CharProps::from_bits_truncate(view.u8_at(i + 2).unwrap());
                        let value_handle = view.u16_at(i + 3).unwrap();
                        let uuid =
                            view.uuid_at(i + 5, uuid_width)
                                .map_err(|_| GattError::InvalidResponse {
                                    opcode: AttOpcode::ReadByTypeRsp,
                                    reason: "truncated element",
                                })?;
                        if decl < service.handle
                            || value_handle <= decl
                            || value_handle > service.end_handle
                        {
                            return Err(GattError::CharacteristicRangeInvalid {
                                decl,
                                value: value_handle,
                                start: service.handle,
                                end: service.end_handle,
                            });
                        }
                        service.characteristics.push(GattCharacteristic {
                            service_handle: service.handle,
                            handle: decl,
                            properties,
                            value_handle,
                            uuid,
                            descriptors: Vec::new(),
                            cccd_index: None,
                        });
                        last_decl = decl;
                    }
                    if last_decl == u16::MAX {
                        break;
                    }
                    start = last_decl + 1;
                }
                ref err @ AttPdu::ErrorRsp { .. } => {
                    if err.error_code() == Some(AttErrorCode::AttributeNotFound) {
                        break;
                    }
                    return Err(GattError::from_error_rsp(err, AttOpcode::ReadByTypeReq));
                }
                other => return Err(GattError::UnexpectedPdu(other.opcode())),
            }
        }
        Ok(())
    }

    /// Discovers the descriptors of every characteristic in `service`.
    ///
    /// A characteristic's descriptor range runs from its value handle + 1
    /// to the next declaration - 1, or to the service end for the last one.
    pub async fn discover_descriptors(&self, service: &mut GattService) -> Result<(), GattError> {
        let ranges: Vec<(u16, u16)> = service
            .characteristics
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let range_end = service
                    .characteristics
                    .get(i + 1)
                    .map(|next| next.handle - 1)
                    .unwrap_or(service.end_handle);
                (c.value_handle.saturating_add(1), range_end)
            })
            .collect();
        for (characteristic, (desc_start, desc_end)) in
            service.characteristics.iter_mut().zip(ranges)
        {
            characteristic.descriptors.clear();
            characteristic.cccd_index = None;
            if desc_start > desc_end {
                continue;
            }
            let mut start = desc_start;
            'range: loop {
                let req = AttPdu::FindInformationReq {
                    start,
                    end: desc_end,
                };
                let rsp = self.request(req, AttOpcode::FindInformationRsp).await?;
                match rsp {
                    AttPdu::FindInformationRsp { format, data } => {
                        let pair_len = match format {
                            0x01 => 4usize,
                            0x02 => 18,
                            _ => {
                                return Err(GattError::InvalidResponse {
                                    opcode: AttOpcode::FindInformationRsp,
                                    reason: "unknown format",
                                })
                            }
                        };
                        if data.is_empty() || data.len() % pair_len != 0 {
                            return Err(GattError::InvalidResponse {
                                opcode: AttOpcode::FindInformationRsp,
                                reason: "data not a whole number of pairs",
                            });
                        }
                        let view = Octets::new(&data);
                        let mut last_handle = start;
                        for i in (0..data.len()).step_by(pair_len) {
                            let handle = view.u16_at(i).unwrap();
                            let uuid = view.uuid_at(i + 2, pair_len - 2).map_err(|_| {
                                GattError::InvalidResponse {
                                    opcode: AttOpcode::FindInformationRsp,
                                    reason: "truncated pair",
                                }
                            })?;
                            let descriptor = GattDescriptor {
                                handle,
                                uuid,
                                value: Bytes::new(),
                                characteristic_value_handle: characteristic.value_handle,
                            };
                            if descriptor.is_cccd() {
                                characteristic.cccd_index =
                                    Some(characteristic.descriptors.len());
                            }
                            characteristic.descriptors.push(descriptor);
                            last_handle = handle;
                        }
                        if last_handle >= desc_end {
                            break 'range;
                        }
                        start = last_handle + 1;
                    }
                    ref err @ AttPdu::ErrorRsp { .. } => {
                        if err.error_code() == Some(AttErrorCode::AttributeNotFound) {
                            break 'range;
                        }
                        return Err(GattError::from_error_rsp(
                            err,
                            AttOpcode::FindInformationReq,
                        ));
                    }
                    other => return Err(GattError::UnexpectedPdu(other.opcode())),
                }
            }
        }
        Ok(())
    }

    /// Full discovery pass: services, characteristics, descriptors.
    #[tracing::instrument(target = "gatt", skip(self))]
    pub async fn discover_all(&self) -> Result<Vec<GattService>, GattError> {
        let mut services = self.discover_primary_services().await?;
        for service in &mut services {
            self.discover_characteristics(service).await?;
            self.discover_descriptors(service).await?;
        }
        *self.inner.services.lock().unwrap() = services.clone();
        tracing::info!(target: "gatt", services = services.len(), "gatt discovery complete");
        Ok(services)
    }

    /// Reads an attribute value, following up with blob reads while the
    /// responses stay full-sized.
    ///
    /// `expected_length`: 0 reads a single round; negative reads until a
    /// short response; positive reads until the total meets the hint or a
    /// response is short.
    pub async fn read_value(
        &self,
        handle: u16,
        expected_length: i32,
    ) -> Result<Bytes, GattError> {
        let full = (self.used_mtu() - 1) as usize;
        let mut out = BytesMut::new();
        let rsp = self.request(AttPdu::ReadReq { handle }, AttOpcode::ReadRsp).await?;
        match rsp {
            AttPdu::ReadRsp { value } => out.extend_from_slice(&value),
            ref err @ AttPdu::ErrorRsp { .. } => {
                return Err(GattError::from_error_rsp(err, AttOpcode::ReadReq))
            }
            other => return Err(GattError::UnexpectedPdu(other.opcode())),
        }
        let mut last_len = out.len();
        loop {
            let want_more = match expected_length {
                0 => false,
                n if n < 0 => last_len == full,
                n => last_len == full && out.len() < n as usize,
            };
            if !want_more {
                break;
            }
            let req = AttPdu::ReadBlobReq {
                handle,
                offset: out.len() as u16,
            };
            let rsp = self.request(req, AttOpcode::ReadBlobRsp).await?;
            match rsp {
                AttPdu::ReadBlobRsp { value } => {
                    last_len = value.len();
                    out.extend_from_slice(&value);
                    if last_len == 0 {
                        break;
                    }
                }
                ref err @ AttPdu::ErrorRsp { .. } => {
                    // The value ended exactly on a full response.
                    if matches!(
                        err.error_code(),
                        Some(AttErrorCode::AttributeNotFound | AttErrorCode::InvalidOffset)
                    ) {
                        break;
                    }
                    return Err(GattError::from_error_rsp(err, AttOpcode::ReadBlobReq));
                }
                other => return Err(GattError::UnexpectedPdu(other.opcode())),
            }
        }
        Ok(out.freeze())
    }

    /// Short read: one round, up to MTU-1 octets.
    pub async fn read(&self, handle: u16) -> Result<Bytes, GattError> {
        self.read_value(handle, 0).await
    }

    /// Writes a value, awaiting the write response.
    pub async fn write_value(&self, handle: u16, value: &[u8]) -> Result<(), GattError> {
        let req = AttPdu::WriteReq {
            handle,
            value: Bytes::copy_from_slice(value),
        };
        let rsp = self.request(req, AttOpcode::WriteRsp).await?;
        match rsp {
            AttPdu::WriteRsp => Ok(()),
            ref err @ AttPdu::ErrorRsp { .. } => {
                Err(GattError::from_error_rsp(err, AttOpcode::WriteReq))
            }
            other => Err(GattError::UnexpectedPdu(other.opcode())),
        }
    }

    /// Fire-and-forget write; no reply is expected or consumed.
    pub async fn write_value_no_response(
        &self,
        handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;
        inner.check_open()?;
        let pdu = AttPdu::WriteCmd {
            handle,
            value: Bytes::copy_from_slice(value),
        };
        inner.bearer.send(pdu.encode()).await?;
        Ok(())
    }

    /// Enables/disables notifications and indications via the CCCD.
    ///
    /// The request is intersected with the characteristic's properties; the
    /// returned pair is the effective `(notify, indicate)` mask written.
    #[tracing::instrument(target = "gatt", skip(self))]
    pub async fn config_indication_notification(
        &self,
        value_handle: u16,
        enable_notification: bool,
        enable_indication: bool,
    ) -> Result<(bool, bool), GattError> {
        let (cccd_handle, properties) = {
            let services = self.inner.services.lock().unwrap();
            let characteristic = find_by_value_handle(&services, value_handle)
                .ok_or(GattError::NoSuchCharacteristic(value_handle))?;
            let cccd = characteristic
                .cccd()
                .ok_or(GattError::NoCccd(value_handle))?;
            (cccd.handle, characteristic.properties)
        };
        let notify = enable_notification && properties.contains(CharProps::NOTIFY);
        let indicate = enable_indication && properties.contains(CharProps::INDICATE);
        let mut mask: u16 = 0;
        if notify {
            mask |= ENABLE_NOTIFICATION;
        }
        if indicate {
            mask |= ENABLE_INDICATION;
        }
        self.write_value(cccd_handle, &mask.to_le_bytes()).await?;
        // Refresh the cached descriptor value.
        let mut services = self.inner.services.lock().unwrap();
        if let Some(characteristic) = services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.value_handle == value_handle)
        {
            if let Some(i) = characteristic.cccd_index {
                characteristic.descriptors[i].value =
                    Bytes::copy_from_slice(&mask.to_le_bytes());
            }
        }
        Ok((notify, indicate))
    }

    /// Sends one request and waits for its response, enforcing the
    /// single-outstanding-request rule.
    async fn request(&self, req: AttPdu, expected: AttOpcode) -> Result<AttPdu, GattError> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock().await;
        inner.check_open()?;
        inner.set_state(AttConnState::RequestInFlight);
        let result = self.request_locked(&req, expected).await;
        if *inner.state_tx.borrow() == AttConnState::RequestInFlight {
            inner.set_state(AttConnState::Ready);
        }
        result
    }

    async fn request_locked(&self, req: &AttPdu, expected: AttOpcode) -> Result<AttPdu, GattError> {
        let inner = &self.inner;
        let req_opcode = req.opcode();
        inner.bearer.send(req.encode()).await?;
        let mut state_rx = inner.state_tx.subscribe();
        let mut retries = inner.reply_ring.capacity();
        let deadline = tokio::time::Instant::now() + inner.reply_timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(GattError::Timeout);
            }
            let pdu = tokio::select! {
                pdu = inner.reply_ring.pop_timeout(deadline - now) => pdu,
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == AttConnState::Disconnected {
                        return Err(GattError::Disconnected);
                    }
                    continue;
                }
            };
            match pdu {
                None => return Err(GattError::Timeout),
                Some(pdu) if pdu.opcode() == expected => return Ok(pdu),
                Some(pdu) if pdu.is_error_for(req_opcode) => return Ok(pdu),
                Some(stale) => {
                    retries -= 1;
                    tracing::debug!(target: "gatt", ?stale, retries, "discarding uncorrelated pdu");
                    if retries == 0 {
                        return Err(GattError::Timeout);
                    }
                }
            }
        }
    }
}

impl GattError {
    fn from_error_rsp(pdu: &AttPdu, opcode: AttOpcode) -> Self {
        match pdu {
            AttPdu::ErrorRsp { error, .. } => Self::Protocol {
                opcode,
                code: *error,
            },
            other => Self::UnexpectedPdu(other.opcode()),
        }
    }
}

impl GattInner {
    fn check_open(&self) -> Result<(), GattError> {
        if *self.state_tx.borrow() == AttConnState::Disconnected {
            Err(GattError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: AttConnState) {
        self.state_tx.send_replace(state);
    }

    fn add_listener(&self, scope: Option<u16>, listener: Arc<dyn GattEventListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners
            .iter()
            .any(|e| e.scope == scope && Arc::ptr_eq(&e.listener, &listener))
        {
            return false;
        }
        listeners.push(ListenerEntry { scope, listener });
        true
    }

    /// Routes one inbound PDU; returns false when the reader must stop.
    async fn handle_pdu(&self, frame: &[u8]) -> bool {
        let pdu = match AttPdu::parse(frame) {
            Ok(pdu) => pdu,
            Err(err) => {
                tracing::warn!(target: "gatt", "dropping malformed pdu: {err}");
                return true;
            }
        };
        match pdu {
            AttPdu::HandleValueNtf { handle, value } => {
                self.deliver(handle, &value, false, false);
                true
            }
            AttPdu::HandleValueInd { handle, value } => {
                let confirm = self.auto_confirm.load(Ordering::Relaxed);
                self.deliver(handle, &value, true, confirm);
                if confirm {
                    if let Err(err) = self.bearer.send(AttPdu::HandleValueCfm.encode()).await {
                        tracing::error!(target: "gatt", "indication confirm failed: {err}");
                        return false;
                    }
                }
                true
            }
            other => {
                let dropped = self.reply_ring.push(other);
                if dropped > 0 {
                    tracing::warn!(target: "gatt", dropped, "att pdu ring overflow");
                }
                true
            }
        }
    }

    fn deliver(&self, value_handle: u16, value: &[u8], indication: bool, confirmed: bool) {
        let characteristic = {
            let services = self.services.lock().unwrap();
            match find_by_value_handle(&services, value_handle) {
                Some(c) => c.clone(),
                None => {
                    tracing::debug!(
                        target: "gatt",
                        value_handle,
                        "value event for unknown characteristic, dropping"
                    );
                    return;
                }
            }
        };
        let ts = Instant::now();
        // Snapshot so listeners may mutate the registry from the callback.
        let snapshot: Vec<(Option<u16>, Arc<dyn GattEventListener>)> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.scope, e.listener.clone()))
            .collect();
        for (scope, listener) in snapshot {
            if scope.map_or(true, |s| s == value_handle) {
                if indication {
                    listener.on_indication(&characteristic, value, confirmed, ts);
                } else {
                    listener.on_notification(&characteristic, value, ts);
                }
            }
        }
    }

    fn shut_down(&self) {
        tracing::info!(target: "gatt", "att reader stopped");
        self.set_state(AttConnState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as SyncMutex;

    type Log = Arc<SyncMutex<Vec<String>>>;

    struct MockBearer {
        sent: SyncMutex<Vec<AttPdu>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: SyncMutex<Option<mpsc::UnboundedSender<Bytes>>>,
        #[allow(clippy::type_complexity)]
        replier: SyncMutex<Option<Box<dyn Fn(&AttPdu) -> Vec<AttPdu> + Send>>>,
        log: Log,
    }

    impl fmt::Debug for MockBearer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockBearer")
                .field("sent", &self.sent)
                .field("rx", &self.rx)
                .field("tx", &self.tx)
                .field("log", &self.log)
                .finish()
        }
    }

    impl MockBearer {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: SyncMutex::new(Vec::new()),
                rx: tokio::sync::Mutex::new(rx),
                tx: SyncMutex::new(Some(tx)),
                replier: SyncMutex::new(None),
                log: Arc::new(SyncMutex::new(Vec::new())),
            })
        }

        fn set_replier(&self, replier: impl Fn(&AttPdu) -> Vec<AttPdu> + Send + 'static) {
            *self.replier.lock().unwrap() = Some(Box::new(replier));
        }

        fn inject(&self, pdu: AttPdu) {
            self.tx
                .lock()
                .unwrap()
                .as_ref()
                .unwrap()
                .send(pdu.encode())
                .unwrap();
        }

        fn close(&self) {
            self.tx.lock().unwrap().take();
        }

        fn sent(&self) -> Vec<AttPdu> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttBearer for MockBearer {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            let pdu = AttPdu::parse(&frame).unwrap();
            if pdu == AttPdu::HandleValueCfm {
                self.log.lock().unwrap().push("cfm".into());
            }
            self.sent.lock().unwrap().push(pdu.clone());
            let replies = self
                .replier
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r(&pdu))
                .unwrap_or_default();
            let tx = self.tx.lock().unwrap();
            for reply in replies {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(reply.encode());
                }
            }
            Ok(())
        }

        async fn recv(&self) -> std::io::Result<BytesMut> {
            match self.rx.lock().await.recv().await {
                Some(frame) => Ok(BytesMut::from(&frame[..])),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "bearer closed",
                )),
            }
        }
    }

    /// Replier modelling a small GATT database:
    /// one primary service 0x0001..0x0030 with
    ///   c1: decl 0x001F, props READ|NOTIFY, value 0x0020, CCCD 0x0021
    ///   c2: decl 0x0025, props READ|WRITE,  value 0x0026, desc 0x0027
    fn database_replier(pdu: &AttPdu) -> Vec<AttPdu> {
        let not_found = |req: AttOpcode, handle: u16| AttPdu::ErrorRsp {
            req_opcode: req as u8,
            handle,
            error: AttErrorCode::AttributeNotFound as u8,
        };
        match pdu {
            AttPdu::ExchangeMtuReq { .. } => vec![AttPdu::ExchangeMtuRsp { mtu: 185 }],
            AttPdu::ReadByGroupTypeReq { start, .. } => {
                if *start <= 0x0001 {
                    let mut data = BytesMut::new();
                    data.extend_from_slice(&0x0001u16.to_le_bytes());
                    data.extend_from_slice(&0x0030u16.to_le_bytes());
                    data.extend_from_slice(&0x180Du16.to_le_bytes());
                    vec![AttPdu::ReadByGroupTypeRsp {
                        element_len: 6,
                        data: data.freeze(),
                    }]
                } else {
                    vec![not_found(AttOpcode::ReadByGroupTypeReq, *start)]
                }
            }
            AttPdu::ReadByTypeReq { start, .. } => {
                if *start <= 0x001F {
                    let mut data = BytesMut::new();
                    for (decl, props, value, uuid) in [
                        (0x001Fu16, 0x12u8, 0x0020u16, 0x2A37u16),
                        (0x0025, 0x0A, 0x0026, 0x2A38),
                    ] {
                        data.extend_from_slice(&decl.to_le_bytes());
                        data.extend_from_slice(&[props]);
                        data.extend_from_slice(&value.to_le_bytes());
                        data.extend_from_slice(&uuid.to_le_bytes());
                    }
                    vec![AttPdu::ReadByTypeRsp {
                        element_len: 7,
                        data: data.freeze(),
                    }]
                } else {
                    vec![not_found(AttOpcode::ReadByTypeReq, *start)]
                }
            }
            AttPdu::FindInformationReq { start, .. } => {
                let pair = |handle: u16, uuid: u16| {
                    let mut data = BytesMut::new();
                    data.extend_from_slice(&handle.to_le_bytes());
                    data.extend_from_slice(&uuid.to_le_bytes());
                    AttPdu::FindInformationRsp {
                        format: 0x01,
                        data: data.freeze(),
                    }
                };
                match *start {
                    0x0021 => vec![pair(0x0021, 0x2902)],
                    0x0027 => vec![pair(0x0027, 0x2901)],
                    s => vec![not_found(AttOpcode::FindInformationReq, s)],
                }
            }
            AttPdu::WriteReq { .. } => vec![AttPdu::WriteRsp],
            _ => vec![],
        }
    }

    async fn engine_with_database() -> (GattEngine, GattHandle, Arc<MockBearer>) {
        let bearer = MockBearer::new();
        bearer.set_replier(database_replier);
        let (engine, handle) = GattEngine::attach(bearer.clone(), GattConfig::default());
        engine.exchange_mtu().await.unwrap();
        engine.discover_all().await.unwrap();
        (engine, handle, bearer)
    }

    #[tokio::test]
    async fn mtu_exchange_clamps_to_min() {
        let bearer = MockBearer::new();
        bearer.set_replier(|pdu| match pdu {
            AttPdu::ExchangeMtuReq { .. } => vec![AttPdu::ExchangeMtuRsp { mtu: 185 }],
            _ => vec![],
        });
        let (engine, _handle) = GattEngine::attach(bearer.clone(), GattConfig::default());
        assert_eq!(engine.exchange_mtu().await.unwrap(), 185);
        assert_eq!(engine.used_mtu(), 185);
        assert_eq!(engine.server_mtu(), 185);

        // A client maximum of 23 pins the effective MTU regardless of offer.
        let bearer = MockBearer::new();
        bearer.set_replier(|pdu| match pdu {
            AttPdu::ExchangeMtuReq { .. } => vec![AttPdu::ExchangeMtuRsp { mtu: 185 }],
            _ => vec![],
        });
        let (engine, _handle) = GattEngine::attach(
            bearer,
            GattConfig {
                client_max_mtu: Some(23),
                ..Default::default()
            },
        );
        assert_eq!(engine.exchange_mtu().await.unwrap(), 23);
    }

    #[tokio::test]
    async fn discovers_the_database() {
        let (engine, _handle, _bearer) = engine_with_database().await;
        let services = engine.services();
        assert_eq!(services.len(), 1);
        let service = &services[0];
        assert_eq!((service.handle, service.end_handle), (0x0001, 0x0030));
        assert_eq!(service.uuid, BtUuid::Uuid16(0x180D));
        assert_eq!(service.characteristics.len(), 2);
        let c1 = &service.characteristics[0];
        assert_eq!(c1.handle, 0x001F);
        assert_eq!(c1.value_handle, 0x0020);
        assert!(c1.supports(CharProps::NOTIFY));
        assert!(!c1.supports(CharProps::INDICATE));
        assert_eq!(c1.cccd().unwrap().handle, 0x0021);
        let c2 = &service.characteristics[1];
        assert_eq!(c2.descriptors.len(), 1);
        assert_eq!(c2.cccd_index, None);
    }

    #[tokio::test]
    async fn long_read_accumulates() {
        let value = vec![0xA5u8; 350];
        let bearer = MockBearer::new();
        {
            let value = value.clone();
            bearer.set_replier(move |pdu| match pdu {
                AttPdu::ExchangeMtuReq { .. } => vec![AttPdu::ExchangeMtuRsp { mtu: 185 }],
                AttPdu::ReadReq { handle: 0x0010 } => vec![AttPdu::ReadRsp {
                    value: Bytes::copy_from_slice(&value[..184]),
                }],
                AttPdu::ReadBlobReq {
                    handle: 0x0010,
                    offset,
                } => {
                    let offset = *offset as usize;
                    if offset >= value.len() {
                        vec![AttPdu::ErrorRsp {
                            req_opcode: AttOpcode::ReadBlobReq as u8,
                            handle: 0x0010,
                            error: AttErrorCode::InvalidOffset as u8,
                        }]
                    } else {
                        let end = value.len().min(offset + 184);
                        vec![AttPdu::ReadBlobRsp {
                            value: Bytes::copy_from_slice(&value[offset..end]),
                        }]
                    }
                }
                _ => vec![],
            });
        }
        let (engine, _handle) = GattEngine::attach(bearer.clone(), GattConfig::default());
        engine.exchange_mtu().await.unwrap();
        let read = engine.read_value(0x0010, -1).await.unwrap();
        assert_eq!(read.len(), 350);
        assert!(read.iter().all(|b| *b == 0xA5));
        // Two exchanges: READ_REQ then one READ_BLOB_REQ at offset 184.
        let reads: Vec<AttPdu> = bearer
            .sent()
            .into_iter()
            .filter(|p| !matches!(p, AttPdu::ExchangeMtuReq { .. }))
            .collect();
        assert_eq!(
            reads,
            vec![
                AttPdu::ReadReq { handle: 0x0010 },
                AttPdu::ReadBlobReq {
                    handle: 0x0010,
                    offset: 184
                },
            ]
        );
    }

    #[tokio::test]
    async fn short_first_response_completes_in_one_round() {
        let bearer = MockBearer::new();
        bearer.set_replier(|pdu| match pdu {
            AttPdu::ReadReq { .. } => vec![AttPdu::ReadRsp {
                value: Bytes::from_static(&[1, 2, 3]),
            }],
            _ => vec![],
        });
        let (engine, _handle) = GattEngine::attach(bearer.clone(), GattConfig::default());
        let read = engine.read_value(0x0010, -1).await.unwrap();
        assert_eq!(&read[..], &[1, 2, 3]);
        assert_eq!(bearer.sent().len(), 1);
    }

    #[tokio::test]
    async fn read_until_expected_length() {
        let value = vec![0x42u8; 100];
        let bearer = MockBearer::new();
        {
            let value = value.clone();
            bearer.set_replier(move |pdu| match pdu {
                AttPdu::ExchangeMtuReq { .. } => vec![AttPdu::ExchangeMtuRsp { mtu: 23 }],
                AttPdu::ReadReq { .. } => vec![AttPdu::ReadRsp {
                    value: Bytes::copy_from_slice(&value[..22]),
                }],
                AttPdu::ReadBlobReq { offset, .. } => {
                    let offset = *offset as usize;
                    let end = value.len().min(offset + 22);
                    vec![AttPdu::ReadBlobRsp {
                        value: Bytes::copy_from_slice(&value[offset..end]),
                    }]
                }
                _ => vec![],
            });
        }
        let (engine, _handle) = GattEngine::attach(bearer.clone(), GattConfig::default());
        engine.exchange_mtu().await.unwrap();
        // Hint of 44: stop once the total reaches it.
        let read = engine.read_value(0x0010, 44).await.unwrap();
        assert_eq!(read.len(), 44);
        // Hint of 0: a single round even though the response was full.
        let read = engine.read_value(0x0010, 0).await.unwrap();
        assert_eq!(read.len(), 22);
    }

    #[tokio::test]
    async fn cccd_config_intersects_properties() {
        let (engine, _handle, bearer) = engine_with_database().await;
        // c1 supports Notify but not Indicate: the indicate bit is dropped.
        let (notify, indicate) = engine
            .config_indication_notification(0x0020, true, true)
            .await
            .unwrap();
        assert!(notify);
        assert!(!indicate);
        let writes: Vec<AttPdu> = bearer
            .sent()
            .into_iter()
            .filter(|p| matches!(p, AttPdu::WriteReq { .. }))
            .collect();
        assert_eq!(
            writes,
            vec![AttPdu::WriteReq {
                handle: 0x0021,
                value: Bytes::from_static(&[0x01, 0x00]),
            }]
        );
        let services = engine.services();
        assert_eq!(
            services[0].characteristics[0].cccd().unwrap().value.as_ref(),
            &[0x01, 0x00]
        );
    }

    #[tokio::test]
    async fn cccd_config_without_cccd_fails() {
        let (engine, _handle, _bearer) = engine_with_database().await;
        let err = engine
            .config_indication_notification(0x0026, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GattError::NoCccd(0x0026)));
        let err = engine
            .config_indication_notification(0x0099, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GattError::NoSuchCharacteristic(0x0099)));
    }

    #[derive(Default)]
    struct RecordingListener {
        notifications: SyncMutex<Vec<(u16, Vec<u8>)>>,
        indications: SyncMutex<Vec<(u16, Vec<u8>, bool)>>,
        log: Option<Log>,
    }

    impl GattEventListener for RecordingListener {
        fn on_notification(&self, c: &GattCharacteristic, value: &[u8], _ts: Instant) {
            self.notifications
                .lock()
                .unwrap()
                .push((c.value_handle, value.to_vec()));
        }

        fn on_indication(
            &self,
            c: &GattCharacteristic,
            value: &[u8],
            confirmed: bool,
            _ts: Instant,
        ) {
            if let Some(log) = &self.log {
                log.lock().unwrap().push("deliver".into());
            }
            self.indications
                .lock()
                .unwrap()
                .push((c.value_handle, value.to_vec(), confirmed));
        }
    }

    #[tokio::test]
    async fn notification_reaches_matching_listeners_once() {
        let (engine, _handle, bearer) = engine_with_database().await;
        let scoped = Arc::new(RecordingListener::default());
        let global = Arc::new(RecordingListener::default());
        let elsewhere = Arc::new(RecordingListener::default());
        assert!(engine.add_listener_for(0x0020, scoped.clone()));
        assert!(engine.add_listener(global.clone()));
        assert!(engine.add_listener_for(0x0026, elsewhere.clone()));
        // Re-registration keeps exactly one entry.
        assert!(!engine.add_listener_for(0x0020, scoped.clone()));
        bearer.inject(AttPdu::HandleValueNtf {
            handle: 0x0020,
            value: Bytes::from_static(&[0x01, 0x02, 0x03]),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            scoped.notifications.lock().unwrap().as_slice(),
            &[(0x0020, vec![1, 2, 3])]
        );
        assert_eq!(
            global.notifications.lock().unwrap().as_slice(),
            &[(0x0020, vec![1, 2, 3])]
        );
        assert!(elsewhere.notifications.lock().unwrap().is_empty());
        let scoped_dyn: Arc<dyn GattEventListener> = scoped;
        assert!(engine.remove_listener(&scoped_dyn));
    }

    #[tokio::test]
    async fn indication_delivers_then_confirms() {
        let (engine, _handle, bearer) = engine_with_database().await;
        let listener = Arc::new(RecordingListener {
            log: Some(bearer.log.clone()),
            ..Default::default()
        });
        engine.add_listener(listener.clone());
        bearer.inject(AttPdu::HandleValueInd {
            handle: 0x0020,
            value: Bytes::from_static(&[0xFF]),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            listener.indications.lock().unwrap().as_slice(),
            &[(0x0020, vec![0xFF], true)]
        );
        // Delivery first, confirmation on the wire before the next read.
        assert_eq!(bearer.log.lock().unwrap().as_slice(), &["deliver", "cfm"]);
    }

    #[tokio::test]
    async fn indication_confirm_can_be_disabled() {
        let (engine, _handle, bearer) = engine_with_database().await;
        engine.set_auto_confirm(false);
        bearer.inject(AttPdu::HandleValueInd {
            handle: 0x0020,
            value: Bytes::from_static(&[0x01]),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!bearer.sent().contains(&AttPdu::HandleValueCfm));
    }

    #[tokio::test]
    async fn server_errors_propagate_verbatim() {
        let bearer = MockBearer::new();
        bearer.set_replier(|pdu| match pdu {
            AttPdu::ReadReq { handle } => vec![AttPdu::ErrorRsp {
                req_opcode: AttOpcode::ReadReq as u8,
                handle: *handle,
                error: AttErrorCode::InsufficientAuthentication as u8,
            }],
            _ => vec![],
        });
        let (engine, _handle) = GattEngine::attach(bearer, GattConfig::default());
        let err = engine.read(0x0010).await.unwrap_err();
        assert!(matches!(
            err,
            GattError::Protocol {
                opcode: AttOpcode::ReadReq,
                code: 0x05
            }
        ));
        // A protocol error fails the request, not the channel.
        assert!(engine.is_open());
    }

    #[tokio::test]
    async fn bearer_loss_tears_down() {
        let bearer = MockBearer::new();
        let (engine, _handle) = GattEngine::attach(
            bearer.clone(),
            GattConfig {
                reply_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        bearer.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.state(), AttConnState::Disconnected);
        let err = engine.read(0x0010).await.unwrap_err();
        assert!(matches!(err, GattError::Disconnected));
    }
}
