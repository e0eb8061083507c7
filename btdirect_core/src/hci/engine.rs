//! The HCI event engine.
//!
//! Owns the raw channel of one adapter, correlates command replies and
//! translates the remaining controller events into normalized MGMT-shaped
//! events for subscribers. A `(handle -> peer)` side table supplies the
//! address a bare `DisconnComplete` does not carry.

use crate::hci::types::{
    create_conn_param, disconnect_param, le_create_conn_param, HciCommand, HciEvent,
    HciMetaEventCode, HciOpcode, HciParseError, HciStatus, LeConnParams, MetaEventMask,
};
use crate::mgmt::{MgmtEvent, MgmtEventCode};
use crate::ring::ReplyRing;
use async_trait::async_trait;
use btdirect_shared::event::EventSubs;
use btdirect_shared::{Address, AddressType};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Duration, Instant};
use tracing::Instrument;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RING_CAPACITY: usize = 64;

/// One raw-channel frame per call, in both directions.
#[async_trait]
pub trait HciTransport: fmt::Debug + Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> std::io::Result<()>;
    async fn recv(&self) -> std::io::Result<BytesMut>;
}

#[derive(Clone, Error, Debug)]
pub enum HciError {
    #[error("hci channel is closed")]
    Closed,
    #[error("no matching reply within the configured timeout")]
    Timeout,
    #[error("command failed with status {0}")]
    Command(HciStatus),
    #[error("parse: {0}")]
    Parse(HciParseError),
    #[error("internal error: {0}")]
    Internal(HciInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum HciInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for HciError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(HciInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct HciConfig {
    pub reply_timeout: Option<Duration>,
    pub ring_capacity: Option<usize>,
    pub meta_mask: Option<MetaEventMask>,
}

/// Handle keeping the reader task alive; dropping it stops the engine.
pub struct HciHandle {
    _close_rx: mpsc::Receiver<()>,
}

impl Drop for HciHandle {
    fn drop(&mut self) {
        // Required for drop order
    }
}

#[derive(Clone)]
pub struct HciEngine {
    inner: Arc<HciInner>,
}

impl fmt::Debug for HciEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HciEngine")
            .field("dev_id", &self.inner.dev_id)
            .field("open", &self.is_open())
            .finish()
    }
}

struct HciInner {
    dev_id: u16,
    transport: Arc<dyn HciTransport>,
    reply_ring: ReplyRing<HciEvent>,
    subs: EventSubs<MgmtEvent>,
    send_lock: Mutex<()>,
    reply_timeout: Duration,
    running_tx: watch::Sender<bool>,
    meta_mask: MetaEventMask,
    conn_table: StdMutex<HashMap<u16, (Address, AddressType)>>,
}

impl HciEngine {
    /// Attaches to an open raw channel and spawns the reader task.
    ///
    /// The transport is expected to carry the [crate::hci::HciFilter::standard]
    /// socket filter.
    #[tracing::instrument(target = "hci", skip(transport, config))]
    pub fn attach(
        transport: Arc<dyn HciTransport>,
        dev_id: u16,
        config: HciConfig,
    ) -> (Self, HciHandle) {
        tracing::info!("attaching hci engine");
        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        let inner = Arc::new(HciInner {
            dev_id,
            transport,
            reply_ring: ReplyRing::new(config.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY)),
            subs: EventSubs::new(),
            send_lock: Mutex::new(()),
            reply_timeout: config.reply_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT),
            running_tx: watch::channel(true).0,
            meta_mask: config.meta_mask.unwrap_or_default(),
            conn_table: StdMutex::new(HashMap::new()),
        });
        tokio::spawn({
            let inner = inner.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = close_tx.closed() => break,
                        frame = inner.transport.recv() => match frame {
                            Ok(frame) => inner.handle_frame(&frame),
                            Err(err) => {
                                tracing::error!("hci socket read failed: {err}");
                                break;
                            }
                        },
                    }
                }
                inner.shut_down();
            }
            .instrument(tracing::info_span!("hci_reader"))
        });
        (Self { inner }, HciHandle { _close_rx: close_rx })
    }

    pub fn dev_id(&self) -> u16 {
        self.inner.dev_id
    }

    pub fn is_open(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    /// Registers a subscriber for normalized events.
    pub fn subscribe(
        &self,
        code: Option<MgmtEventCode>,
    ) -> mpsc::UnboundedReceiver<MgmtEvent> {
        self.inner.subs.subscribe_filtered(Box::new(move |event| {
            code.map_or(true, |c| event.event_code() == Some(c))
        }))
    }

    /// Resets the controller.
    pub async fn reset(&self) -> HciStatus {
        match self.send_with_complete(HciCommand::new(HciOpcode::Reset)).await {
            Ok((status, _)) => status,
            Err(err) => err_status(err),
        }
    }

    /// Reads the controller's version record; an attach-time liveness probe.
    pub async fn read_local_version(&self) -> Result<LocalVersion, HciError> {
        let (status, data) = self
            .send_with_complete(HciCommand::new(HciOpcode::ReadLocalVersion))
            .await?;
        if !status.is_success() {
            return Err(HciError::Command(status));
        }
        LocalVersion::parse(&data)
    }

    /// Issues an LE connection request.
    ///
    /// A success status only confirms acceptance; the connection itself
    /// arrives as a normalized `DeviceConnected` event.
    #[tracing::instrument(target = "hci", skip(self, params))]
    pub async fn le_create_conn(
        &self,
        peer: Address,
        peer_kind: AddressType,
        params: LeConnParams,
    ) -> HciStatus {
        let cmd = HciCommand::with_param(
            HciOpcode::LeCreateConn,
            le_create_conn_param(peer, peer_kind, &params),
        );
        match self.send_with_status(cmd).await {
            Ok(status) => status,
            Err(err) => err_status(err),
        }
    }

    /// Issues a BR/EDR connection request.
    #[tracing::instrument(target = "hci", skip(self))]
    pub async fn create_conn(
        &self,
        peer: Address,
        packet_type: u16,
        clock_offset: u16,
        role_switch: bool,
    ) -> HciStatus {
        let cmd = HciCommand::with_param(
            HciOpcode::CreateConn,
            create_conn_param(peer, packet_type, clock_offset, role_switch),
        );
        match self.send_with_status(cmd).await {
            Ok(status) => status,
            Err(err) => err_status(err),
        }
    }

    /// Requests disconnection of `handle`, remembering the peer so the
    /// eventual `DisconnComplete` can be normalized.
    #[tracing::instrument(target = "hci", skip(self))]
    pub async fn disconnect(
        &self,
        handle: u16,
        peer: Address,
        peer_kind: AddressType,
        reason: HciStatus,
    ) -> HciStatus {
        self.inner
            .conn_table
            .lock()
            .unwrap()
            .insert(handle, (peer, peer_kind));
        let cmd = HciCommand::with_param(HciOpcode::Disconnect, disconnect_param(handle, reason));
        match self.send_with_status(cmd).await {
            Ok(status) => status,
            Err(err) => err_status(err),
        }
    }

    /// Sends a command expecting `CmdComplete`; a non-success `CmdStatus`
    /// completes the call early with that status.
    async fn send_with_complete(&self, cmd: HciCommand) -> Result<(HciStatus, Bytes), HciError> {
        self.send_correlated(cmd, true).await
    }

    /// Sends a command expecting only `CmdStatus` acceptance.
    async fn send_with_status(&self, cmd: HciCommand) -> Result<HciStatus, HciError> {
        self.send_correlated(cmd, false).await.map(|(status, _)| status)
    }

    async fn send_correlated(
        &self,
        cmd: HciCommand,
        want_complete: bool,
    ) -> Result<(HciStatus, Bytes), HciError> {
        let inner = &self.inner;
        let _guard = inner.send_lock.lock().await;
        if !*inner.running_tx.borrow() {
            return Err(HciError::Closed);
        }
        tracing::debug!(target: "hci", opcode = %cmd.opcode, "sending command");
        let opcode = cmd.opcode as u16;
        inner.transport.send(cmd.encode()).await?;
        let mut running_rx = inner.running_tx.subscribe();
        let mut retries = inner.reply_ring.capacity();
        let deadline = Instant::now() + inner.reply_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(HciError::Timeout);
            }
            let event = tokio::select! {
                event = inner.reply_ring.pop_timeout(deadline - now) => event,
                changed = running_rx.changed() => {
                    if changed.is_err() || !*running_rx.borrow() {
                        return Err(HciError::Closed);
                    }
                    continue;
                }
            };
            match event {
                None => return Err(HciError::Timeout),
                Some(HciEvent::CmdComplete {
                    opcode: reply_opcode,
                    return_param,
                    ..
                }) if reply_opcode == opcode => {
                    let status = return_param
                        .first()
                        .map(|b| HciStatus::from_raw(*b))
                        .unwrap_or(HciStatus::Success);
                    return Ok((status, return_param));
                }
                Some(HciEvent::CmdStatus {
                    status,
                    opcode: reply_opcode,
                    ..
                }) if reply_opcode == opcode => {
                    if !want_complete || !status.is_success() {
                        return Ok((status, Bytes::new()));
                    }
                    // Accepted; the matching CmdComplete is still pending.
                }
                Some(stale) => {
                    retries -= 1;
                    tracing::debug!(target: "hci", ?stale, retries, "discarding uncorrelated reply");
                    if retries == 0 {
                        return Err(HciError::Timeout);
                    }
                }
            }
        }
    }
}

fn err_status(err: HciError) -> HciStatus {
    match err {
        HciError::Timeout => HciStatus::InternalTimeout,
        HciError::Command(status) => status,
        _ => HciStatus::InternalFailure,
    }
}

impl HciInner {
    fn handle_frame(&self, frame: &[u8]) {
        let event = match HciEvent::parse(frame) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(target: "hci", "dropping malformed frame: {err}");
                return;
            }
        };
        if event.is_reply() {
            let dropped = self.reply_ring.push(event);
            if dropped > 0 {
                tracing::warn!(target: "hci", dropped, "reply ring overflow");
            }
        } else if let Some(normalized) = self.translate(event) {
            self.subs.dispatch(&normalized);
        }
    }

    /// Maps controller events onto normalized MGMT-shaped events.
    fn translate(&self, event: HciEvent) -> Option<MgmtEvent> {
        match event {
            HciEvent::LeConnComplete {
                status,
                handle,
                peer_address_type,
                peer_address,
                ..
            } => {
                if !self.meta_mask.test(HciMetaEventCode::LeConnComplete) {
                    return None;
                }
                if status.is_success() {
                    self.conn_table
                        .lock()
                        .unwrap()
                        .insert(handle, (peer_address, peer_address_type));
                    Some(MgmtEvent::DeviceConnected {
                        dev_id: self.dev_id,
                        address: peer_address,
                        address_type: peer_address_type,
                        handle,
                        eir: Bytes::new(),
                    })
                } else {
                    Some(MgmtEvent::ConnectFailed {
                        dev_id: self.dev_id,
                        address: peer_address,
                        address_type: peer_address_type,
                        status: status as u8,
                    })
                }
            }
            HciEvent::ConnComplete {
                status,
                handle,
                address,
                ..
            } => {
                if status.is_success() {
                    self.conn_table
                        .lock()
                        .unwrap()
                        .insert(handle, (address, AddressType::BrEdr));
                    Some(MgmtEvent::DeviceConnected {
                        dev_id: self.dev_id,
                        address,
                        address_type: AddressType::BrEdr,
                        handle,
                        eir: Bytes::new(),
                    })
                } else {
                    Some(MgmtEvent::ConnectFailed {
                        dev_id: self.dev_id,
                        address,
                        address_type: AddressType::BrEdr,
                        status: status as u8,
                    })
                }
            }
            HciEvent::DisconnComplete { handle, reason, .. } => {
                match self.conn_table.lock().unwrap().remove(&handle) {
                    Some((address, address_type)) => Some(MgmtEvent::DeviceDisconnected {
                        dev_id: self.dev_id,
                        address,
                        address_type,
                        reason,
                    }),
                    None => {
                        tracing::debug!(target: "hci", handle, "disconnect for unknown handle, dropping");
                        None
                    }
                }
            }
            HciEvent::HardwareError { code } => {
                tracing::error!(target: "hci", code, "controller hardware error");
                None
            }
            other => {
                tracing::trace!(target: "hci", ?other, "discarding unhandled event");
                None
            }
        }
    }

    fn shut_down(&self) {
        tracing::info!(target: "hci", dev_id = self.dev_id, "hci reader stopped");
        self.running_tx.send_replace(false);
        self.subs.clear();
    }
}

/// Reply payload of `ReadLocalVersion`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

impl LocalVersion {
    fn parse(data: &[u8]) -> Result<Self, HciError> {
        let view = crate::octets::Octets::new(data);
        let truncated = |source| {
            HciError::Parse(HciParseError::Truncated { code: 0x0E, source })
        };
        Ok(Self {
            hci_version: view.u8_at(1).map_err(truncated)?,
            hci_revision: view.u16_at(2).map_err(truncated)?,
            lmp_version: view.u8_at(4).map_err(truncated)?,
            manufacturer: view.u16_at(5).map_err(truncated)?,
            lmp_subversion: view.u16_at(7).map_err(truncated)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as SyncMutex;

    struct MockTransport {
        sent: SyncMutex<Vec<Bytes>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: SyncMutex<Option<mpsc::UnboundedSender<Bytes>>>,
        #[allow(clippy::type_complexity)]
        replier: SyncMutex<Option<Box<dyn Fn(u16, &[u8]) -> Vec<HciEvent> + Send>>>,
    }

    impl fmt::Debug for MockTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockTransport")
                .field("sent", &self.sent)
                .field("rx", &self.rx)
                .field("tx", &self.tx)
                .finish()
        }
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: SyncMutex::new(Vec::new()),
                rx: tokio::sync::Mutex::new(rx),
                tx: SyncMutex::new(Some(tx)),
                replier: SyncMutex::new(None),
            })
        }

        fn set_replier(&self, replier: impl Fn(u16, &[u8]) -> Vec<HciEvent> + Send + 'static) {
            *self.replier.lock().unwrap() = Some(Box::new(replier));
        }

        fn inject(&self, event: HciEvent) {
            self.tx
                .lock()
                .unwrap()
                .as_ref()
                .unwrap()
                .send(event.encode())
                .unwrap();
        }

        /// Simulates a socket error: the reader sees EOF on its next read.
        fn close(&self) {
            self.tx.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl HciTransport for MockTransport {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            let opcode = u16::from_le_bytes([frame[1], frame[2]]);
            let param = frame[4..].to_vec();
            self.sent.lock().unwrap().push(frame);
            let replies = self
                .replier
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r(opcode, &param))
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
                    "transport closed",
                )),
            }
        }
    }

    fn status_reply(opcode: u16, status: HciStatus) -> HciEvent {
        HciEvent::CmdStatus {
            status,
            num_hci_cmd_pkts: 1,
            opcode,
        }
    }

    #[tokio::test]
    async fn reset_correlates_cmd_complete() {
        let transport = MockTransport::new();
        transport.set_replier(|opcode, _| {
            vec![HciEvent::CmdComplete {
                num_hci_cmd_pkts: 1,
                opcode,
                return_param: Bytes::from_static(&[0x00]),
            }]
        });
        let (engine, _handle) = HciEngine::attach(transport.clone(), 0, HciConfig::default());
        assert_eq!(engine.reset().await, HciStatus::Success);
    }

    #[tokio::test]
    async fn le_connect_then_disconnect_normalizes() {
        let peer: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let transport = MockTransport::new();
        transport.set_replier(|opcode, _| vec![status_reply(opcode, HciStatus::Success)]);
        let (engine, _handle) = HciEngine::attach(transport.clone(), 0, HciConfig::default());
        let mut events = engine.subscribe(None);

        let status = engine
            .le_create_conn(peer, AddressType::LePublic, LeConnParams::default())
            .await;
        assert_eq!(status, HciStatus::Success);
        transport.inject(HciEvent::LeConnComplete {
            status: HciStatus::Success,
            handle: 0x0040,
            role: 0,
            peer_address_type: AddressType::LePublic,
            peer_address: peer,
            conn_interval: 0x000F,
            conn_latency: 0,
            supervision_timeout: 0x0C80,
        });
        let connected = events.recv().await.unwrap();
        assert_eq!(
            connected,
            MgmtEvent::DeviceConnected {
                dev_id: 0,
                address: peer,
                address_type: AddressType::LePublic,
                handle: 0x0040,
                eir: Bytes::new(),
            }
        );

        let status = engine
            .disconnect(
                0x0040,
                peer,
                AddressType::LePublic,
                HciStatus::RemoteUserTerminatedConnection,
            )
            .await;
        assert_eq!(status, HciStatus::Success);
        transport.inject(HciEvent::DisconnComplete {
            status: HciStatus::Success,
            handle: 0x0040,
            reason: 0x13,
        });
        let disconnected = events.recv().await.unwrap();
        assert_eq!(
            disconnected,
            MgmtEvent::DeviceDisconnected {
                dev_id: 0,
                address: peer,
                address_type: AddressType::LePublic,
                reason: 0x13,
            }
        );
    }

    #[tokio::test]
    async fn failed_le_conn_normalizes_to_connect_failed() {
        let peer: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let transport = MockTransport::new();
        let (engine, _handle) = HciEngine::attach(transport.clone(), 2, HciConfig::default());
        let mut events = engine.subscribe(Some(MgmtEventCode::ConnectFailed));
        transport.inject(HciEvent::LeConnComplete {
            status: HciStatus::ConnectionTimeout,
            handle: 0,
            role: 0,
            peer_address_type: AddressType::LeRandom,
            peer_address: peer,
            conn_interval: 0,
            conn_latency: 0,
            supervision_timeout: 0,
        });
        let failed = events.recv().await.unwrap();
        assert_eq!(
            failed,
            MgmtEvent::ConnectFailed {
                dev_id: 2,
                address: peer,
                address_type: AddressType::LeRandom,
                status: HciStatus::ConnectionTimeout as u8,
            }
        );
    }

    #[tokio::test]
    async fn unknown_disconnect_handle_is_dropped() {
        let transport = MockTransport::new();
        let (engine, _handle) = HciEngine::attach(transport.clone(), 0, HciConfig::default());
        let mut events = engine.subscribe(None);
        transport.inject(HciEvent::DisconnComplete {
            status: HciStatus::Success,
            handle: 0x0099,
            reason: 0x13,
        });
        // Follow with a resolvable event to prove the first was dropped.
        transport.inject(HciEvent::HardwareError { code: 1 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_success_cmd_status_completes_early() {
        let transport = MockTransport::new();
        transport.set_replier(|opcode, _| {
            vec![status_reply(opcode, HciStatus::CommandDisallowed)]
        });
        let (engine, _handle) = HciEngine::attach(transport.clone(), 0, HciConfig::default());
        assert_eq!(engine.reset().await, HciStatus::CommandDisallowed);
    }

    #[tokio::test]
    async fn send_after_reader_stop_is_internal_failure() {
        let transport = MockTransport::new();
        let (engine, _handle) = HciEngine::attach(
            transport.clone(),
            0,
            HciConfig {
                reply_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        // Timeouts are non-fatal.
        assert_eq!(engine.reset().await, HciStatus::InternalTimeout);
        assert!(engine.is_open());
        // A socket error stops the reader; further sends fail terminally.
        transport.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!engine.is_open());
        assert_eq!(engine.reset().await, HciStatus::InternalFailure);
    }
}
