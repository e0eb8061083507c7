//! The MGMT control channel client.
//!
//! Owns the transport, runs the reader task, correlates command replies and
//! fans every other event out to subscribers.

use crate::mgmt::types::{
    parse_command_list, parse_index_list, AdapterInfo, AdapterSetting, BtMode, MgmtCommand,
    MgmtEvent, MgmtEventCode, MgmtOpcode, MgmtParseError, MgmtStatus, MgmtVersion, ScanType,
    WhitelistConnectType, MGMT_INDEX_NONE,
};
use crate::ring::ReplyRing;
use async_trait::async_trait;
use btdirect_shared::event::EventSubs;
use btdirect_shared::{Address, AddressType};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Duration, Instant};
use tracing::Instrument;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RING_CAPACITY: usize = 256;

/// One MGMT frame per call, in both directions.
#[async_trait]
pub trait MgmtTransport: fmt::Debug + Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> std::io::Result<()>;
    async fn recv(&self) -> std::io::Result<BytesMut>;
}

#[derive(Clone, Error, Debug)]
pub enum MgmtError {
    #[error("control channel is closed")]
    Closed,
    #[error("no matching reply within the configured timeout")]
    Timeout,
    #[error("{opcode} failed with status {status}")]
    CommandFailed {
        opcode: MgmtOpcode,
        status: MgmtStatus,
    },
    #[error("parse: {0}")]
    Parse(MgmtParseError),
    #[error("internal error: {0}")]
    Internal(MgmtInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum MgmtInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for MgmtError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(MgmtInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<MgmtParseError> for MgmtError {
    fn from(err: MgmtParseError) -> Self {
        Self::Parse(err)
    }
}

/// Correlated reply to a single command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MgmtReply {
    Complete { status: MgmtStatus, data: Bytes },
    Status { status: MgmtStatus },
}

impl MgmtReply {
    pub fn status(&self) -> MgmtStatus {
        match self {
            Self::Complete { status, .. } | Self::Status { status } => *status,
        }
    }
}

#[derive(Debug, Default)]
pub struct MgmtConfig {
    pub reply_timeout: Option<Duration>,
    pub ring_capacity: Option<usize>,
}

/// Handle keeping the reader task alive; dropping it stops the client.
pub struct MgmtHandle {
    _close_rx: mpsc::Receiver<()>,
}

impl Drop for MgmtHandle {
    fn drop(&mut self) {
        // Required for drop order
    }
}

#[derive(Clone)]
pub struct MgmtClient {
    inner: Arc<MgmtInner>,
}

impl fmt::Debug for MgmtClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MgmtClient")
            .field("open", &self.is_open())
            .finish()
    }
}

struct MgmtInner {
    transport: Arc<dyn MgmtTransport>,
    reply_ring: ReplyRing<MgmtEvent>,
    subs: EventSubs<MgmtEvent>,
    send_lock: Mutex<()>,
    reply_timeout: Duration,
    running_tx: watch::Sender<bool>,
}

impl MgmtClient {
    /// Attaches to an open control channel and spawns the reader task.
    #[tracing::instrument(target = "mgmt", skip_all)]
    pub fn attach(transport: Arc<dyn MgmtTransport>, config: MgmtConfig) -> (Self, MgmtHandle) {
        tracing::info!("attaching mgmt control channel client");
        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        let inner = Arc::new(MgmtInner {
            transport,
            reply_ring: ReplyRing::new(config.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY)),
            subs: EventSubs::new(),
            send_lock: Mutex::new(()),
            reply_timeout: config.reply_timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT),
            running_tx: watch::channel(true).0,
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
                                tracing::error!("control socket read failed: {err}");
                                break;
                            }
                        },
                    }
                }
                inner.shut_down();
            }
            .instrument(tracing::info_span!("mgmt_reader"))
        });
        (Self { inner }, MgmtHandle { _close_rx: close_rx })
    }

    pub fn is_open(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    /// Registers a subscriber for non-reply events.
    ///
    /// `code` of `None` receives every event; `dev_id` of `None` receives
    /// all adapters.
    pub fn subscribe(
        &self,
        code: Option<MgmtEventCode>,
        dev_id: Option<u16>,
    ) -> mpsc::UnboundedReceiver<MgmtEvent> {
        self.inner.subs.subscribe_filtered(Box::new(move |event| {
            code.map_or(true, |c| event.event_code() == Some(c))
                && dev_id.map_or(true, |d| event.dev_id() == d)
        }))
    }

    /// Sends one command and waits for its correlated reply.
    pub async fn send_command(&self, cmd: MgmtCommand) -> Result<MgmtReply, MgmtError> {
        let inner = &self.inner;
        let _guard = inner.send_lock.lock().await;
        if !*inner.running_tx.borrow() {
            return Err(MgmtError::Closed);
        }
        tracing::debug!(target: "mgmt", opcode = %cmd.opcode, dev_id = cmd.dev_id, "sending command");
        inner.transport.send(cmd.encode()).await?;
        let mut running_rx = inner.running_tx.subscribe();
        let mut retries = inner.reply_ring.capacity();
        let deadline = Instant::now() + inner.reply_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(MgmtError::Timeout);
            }
            let event = tokio::select! {
                event = inner.reply_ring.pop_timeout(deadline - now) => event,
                changed = running_rx.changed() => {
                    if changed.is_err() || !*running_rx.borrow() {
                        return Err(MgmtError::Closed);
                    }
                    continue;
                }
            };
            match event {
                None => return Err(MgmtError::Timeout),
                Some(MgmtEvent::CmdComplete {
                    dev_id,
                    req_opcode,
                    status,
                    data,
                }) if dev_id == cmd.dev_id && req_opcode == cmd.opcode as u16 => {
                    return Ok(MgmtReply::Complete { status, data });
                }
                Some(MgmtEvent::CmdStatus {
                    dev_id,
                    req_opcode,
                    status,
                }) if dev_id == cmd.dev_id && req_opcode == cmd.opcode as u16 => {
                    return Ok(MgmtReply::Status { status });
                }
                Some(stale) => {
                    // Late reply of a previously timed-out call; bounded by
                    // ring capacity.
                    retries -= 1;
                    tracing::debug!(target: "mgmt", ?stale, retries, "discarding uncorrelated reply");
                    if retries == 0 {
                        return Err(MgmtError::Timeout);
                    }
                }
            }
        }
    }

    fn expect_complete(
        &self,
        opcode: MgmtOpcode,
        reply: MgmtReply,
    ) -> Result<Bytes, MgmtError> {
        match reply {
            MgmtReply::Complete {
                status: MgmtStatus::Success,
                data,
            } => Ok(data),
            other => Err(MgmtError::CommandFailed {
                opcode,
                status: other.status(),
            }),
        }
    }

    pub async fn read_version(&self) -> Result<MgmtVersion, MgmtError> {
        let reply = self
            .send_command(MgmtCommand::new(MgmtOpcode::ReadVersion, MGMT_INDEX_NONE))
            .await?;
        let data = self.expect_complete(MgmtOpcode::ReadVersion, reply)?;
        Ok(MgmtVersion::parse(&data)?)
    }

    pub async fn read_commands(&self) -> Result<(Vec<u16>, Vec<u16>), MgmtError> {
        let reply = self
            .send_command(MgmtCommand::new(MgmtOpcode::ReadCommands, MGMT_INDEX_NONE))
            .await?;
        let data = self.expect_complete(MgmtOpcode::ReadCommands, reply)?;
        Ok(parse_command_list(&data)?)
    }

    pub async fn read_index_list(&self) -> Result<Vec<u16>, MgmtError> {
        let reply = self
            .send_command(MgmtCommand::new(MgmtOpcode::ReadIndexList, MGMT_INDEX_NONE))
            .await?;
        let data = self.expect_complete(MgmtOpcode::ReadIndexList, reply)?;
        Ok(parse_index_list(&data)?)
    }

    pub async fn read_info(&self, dev_id: u16) -> Result<AdapterInfo, MgmtError> {
        let reply = self
            .send_command(MgmtCommand::new(MgmtOpcode::ReadInfo, dev_id))
            .await?;
        let data = self.expect_complete(MgmtOpcode::ReadInfo, reply)?;
        Ok(AdapterInfo::parse(dev_id, &data)?)
    }

    /// Flips one boolean adapter mode, returning the resulting settings.
    pub async fn set_mode(
        &self,
        dev_id: u16,
        opcode: MgmtOpcode,
        enable: bool,
    ) -> Result<AdapterSetting, MgmtError> {
        let param = Bytes::copy_from_slice(&[u8::from(enable)]);
        let reply = self
            .send_command(MgmtCommand::with_param(opcode, dev_id, param))
            .await?;
        let data = self.expect_complete(opcode, reply)?;
        let raw = crate::octets::Octets::new(&data)
            .u32_at(0)
            .map_err(|source| MgmtParseError::Truncated {
                opcode: opcode as u16,
                source,
            })?;
        Ok(AdapterSetting::from_bits_truncate(raw))
    }

    pub async fn set_local_name(
        &self,
        dev_id: u16,
        name: &str,
        short_name: &str,
    ) -> Result<(), MgmtError> {
        let mut param = BytesMut::with_capacity(260);
        put_name(&mut param, name, 249);
        put_name(&mut param, short_name, 11);
        let reply = self
            .send_command(MgmtCommand::with_param(
                MgmtOpcode::SetLocalName,
                dev_id,
                param.freeze(),
            ))
            .await?;
        self.expect_complete(MgmtOpcode::SetLocalName, reply)?;
        Ok(())
    }

    /// Brings one adapter into the requested mode and powers it up.
    #[tracing::instrument(target = "mgmt", skip(self))]
    pub async fn initialize_adapter(
        &self,
        dev_id: u16,
        mode: BtMode,
    ) -> Result<AdapterInfo, MgmtError> {
        let info = self.read_info(dev_id).await?;
        tracing::info!(address = %info.address, "initializing adapter for {mode} mode");
        let modes: [(MgmtOpcode, bool); 3] = match mode {
            BtMode::Dual => [
                (MgmtOpcode::SetSsp, true),
                (MgmtOpcode::SetBredr, true),
                (MgmtOpcode::SetLe, true),
            ],
            BtMode::BrEdr => [
                (MgmtOpcode::SetSsp, true),
                (MgmtOpcode::SetBredr, true),
                (MgmtOpcode::SetLe, false),
            ],
            BtMode::Le => [
                (MgmtOpcode::SetSsp, false),
                (MgmtOpcode::SetBredr, false),
                (MgmtOpcode::SetLe, true),
            ],
        };
        for (opcode, enable) in modes {
            self.set_mode_lenient(dev_id, opcode, enable).await;
        }
        self.set_mode_lenient(dev_id, MgmtOpcode::SetConnectable, false)
            .await;
        self.set_mode_lenient(dev_id, MgmtOpcode::SetFastConnectable, false)
            .await;
        self.set_mode_lenient(dev_id, MgmtOpcode::SetPowered, true)
            .await;
        Ok(info)
    }

    /// Reverses the power-up sequence of [MgmtClient::initialize_adapter].
    #[tracing::instrument(target = "mgmt", skip(self))]
    pub async fn shutdown_adapter(&self, dev_id: u16) {
        self.set_mode_lenient(dev_id, MgmtOpcode::SetConnectable, false)
            .await;
        self.set_mode_lenient(dev_id, MgmtOpcode::SetFastConnectable, false)
            .await;
        self.set_mode_lenient(dev_id, MgmtOpcode::SetDiscoverable, false)
            .await;
        self.set_mode_lenient(dev_id, MgmtOpcode::SetPowered, false)
            .await;
    }

    async fn set_mode_lenient(&self, dev_id: u16, opcode: MgmtOpcode, enable: bool) {
        if let Err(err) = self.set_mode(dev_id, opcode, enable).await {
            tracing::warn!(target: "mgmt", %opcode, enable, "mode change failed: {err}");
        }
    }

    /// Starts discovery; the kernel echoes the accepted scan type, which may
    /// be a subset of the request.
    pub async fn start_discovery(
        &self,
        dev_id: u16,
        scan_type: ScanType,
    ) -> Result<ScanType, MgmtError> {
        let param = Bytes::copy_from_slice(&[scan_type.bits()]);
        let reply = self
            .send_command(MgmtCommand::with_param(
                MgmtOpcode::StartDiscovery,
                dev_id,
                param,
            ))
            .await?;
        let data = self.expect_complete(MgmtOpcode::StartDiscovery, reply)?;
        let accepted = data
            .first()
            .map(|b| ScanType::from_bits_truncate(*b))
            .unwrap_or(scan_type);
        Ok(accepted)
    }

    /// Stops discovery of the currently-active scan type.
    pub async fn stop_discovery(&self, dev_id: u16, scan_type: ScanType) -> Result<(), MgmtError> {
        let param = Bytes::copy_from_slice(&[scan_type.bits()]);
        let reply = self
            .send_command(MgmtCommand::with_param(
                MgmtOpcode::StopDiscovery,
                dev_id,
                param,
            ))
            .await?;
        self.expect_complete(MgmtOpcode::StopDiscovery, reply)?;
        Ok(())
    }

    pub async fn add_device_whitelist(
        &self,
        dev_id: u16,
        address: Address,
        address_type: AddressType,
        connect_type: WhitelistConnectType,
    ) -> Result<(), MgmtError> {
        let reply = self
            .send_command(MgmtCommand::with_param(
                MgmtOpcode::AddDeviceWhitelist,
                dev_id,
                whitelist_param(address, address_type, Some(connect_type)),
            ))
            .await?;
        match reply {
            MgmtReply::Complete {
                status: MgmtStatus::Success,
                ..
            } => Ok(()),
            // A second add of the same device leaves a single entry.
            MgmtReply::Complete {
                status: MgmtStatus::AlreadyPaired,
                ..
            } => Ok(()),
            other => Err(MgmtError::CommandFailed {
                opcode: MgmtOpcode::AddDeviceWhitelist,
                status: other.status(),
            }),
        }
    }

    pub async fn remove_device_whitelist(
        &self,
        dev_id: u16,
        address: Address,
        address_type: AddressType,
    ) -> Result<(), MgmtError> {
        let reply = self
            .send_command(MgmtCommand::with_param(
                MgmtOpcode::RemoveDeviceWhitelist,
                dev_id,
                whitelist_param(address, address_type, None),
            ))
            .await?;
        self.expect_complete(MgmtOpcode::RemoveDeviceWhitelist, reply)?;
        Ok(())
    }
}

fn whitelist_param(
    address: Address,
    address_type: AddressType,
    action: Option<WhitelistConnectType>,
) -> Bytes {
    let mut param = BytesMut::with_capacity(8);
    param.put_slice(&address.to_le_bytes());
    param.put_u8(address_type as u8);
    if let Some(action) = action {
        param.put_u8(action as u8);
    }
    param.freeze()
}

fn put_name(buf: &mut BytesMut, name: &str, len: usize) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(len - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

impl MgmtInner {
    fn handle_frame(&self, frame: &[u8]) {
        let event = match MgmtEvent::parse(frame) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(target: "mgmt", "dropping malformed frame: {err}");
                return;
            }
        };
        if event.is_reply() {
            let dropped = self.reply_ring.push(event);
            if dropped > 0 {
                tracing::warn!(target: "mgmt", dropped, "reply ring overflow");
            }
        } else {
            self.subs.dispatch(&event);
        }
    }

    fn shut_down(&self) {
        tracing::info!(target: "mgmt", "control channel reader stopped");
        self.running_tx.send_replace(false);
        self.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Transport fed by a test: scripted replies plus injected events.
    struct MockTransport {
        sent: StdMutex<Vec<Bytes>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: mpsc::UnboundedSender<Bytes>,
        #[allow(clippy::type_complexity)]
        replier: StdMutex<Option<Box<dyn Fn(&MgmtCommand) -> Vec<MgmtEvent> + Send>>>,
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
                sent: StdMutex::new(Vec::new()),
                rx: tokio::sync::Mutex::new(rx),
                tx,
                replier: StdMutex::new(None),
            })
        }

        fn set_replier(
            &self,
            replier: impl Fn(&MgmtCommand) -> Vec<MgmtEvent> + Send + 'static,
        ) {
            *self.replier.lock().unwrap() = Some(Box::new(replier));
        }

        fn inject(&self, event: MgmtEvent) {
            self.tx.send(event.encode()).unwrap();
        }

        fn sent_commands(&self) -> Vec<MgmtCommand> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|f| MgmtCommand::parse(f).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl MgmtTransport for MockTransport {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            let cmd = MgmtCommand::parse(&frame).unwrap();
            self.sent.lock().unwrap().push(frame);
            let replies = self
                .replier
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r(&cmd))
                .unwrap_or_default();
            for reply in replies {
                let _ = self.tx.send(reply.encode());
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

    fn complete(cmd: &MgmtCommand, data: &[u8]) -> MgmtEvent {
        MgmtEvent::CmdComplete {
            dev_id: cmd.dev_id,
            req_opcode: cmd.opcode as u16,
            status: MgmtStatus::Success,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[tokio::test]
    async fn correlates_command_replies() {
        let transport = MockTransport::new();
        transport.set_replier(|cmd| match cmd.opcode {
            MgmtOpcode::ReadVersion => vec![complete(cmd, &[0x01, 0x0E, 0x00])],
            _ => vec![],
        });
        let (client, _handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        let version = client.read_version().await.unwrap();
        assert_eq!(version, MgmtVersion { version: 1, revision: 14 });
    }

    #[tokio::test]
    async fn discards_mismatched_replies() {
        let transport = MockTransport::new();
        transport.set_replier(|cmd| match cmd.opcode {
            MgmtOpcode::ReadIndexList => vec![
                // Stale reply from an earlier timed-out call arrives first.
                MgmtEvent::CmdComplete {
                    dev_id: MGMT_INDEX_NONE,
                    req_opcode: MgmtOpcode::ReadVersion as u16,
                    status: MgmtStatus::Success,
                    data: Bytes::from_static(&[0x01, 0x00, 0x00]),
                },
                complete(cmd, &[0x01, 0x00, 0x00, 0x00]),
            ],
            _ => vec![],
        });
        let (client, _handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        assert_eq!(client.read_index_list().await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn non_success_status_completes_call() {
        let transport = MockTransport::new();
        transport.set_replier(|cmd| {
            vec![MgmtEvent::CmdStatus {
                dev_id: cmd.dev_id,
                req_opcode: cmd.opcode as u16,
                status: MgmtStatus::NotPowered,
            }]
        });
        let (client, _handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        let err = client.start_discovery(0, ScanType::LE).await.unwrap_err();
        assert!(matches!(
            err,
            MgmtError::CommandFailed {
                opcode: MgmtOpcode::StartDiscovery,
                status: MgmtStatus::NotPowered,
            }
        ));
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let transport = MockTransport::new();
        let (client, _handle) = MgmtClient::attach(
            transport.clone(),
            MgmtConfig {
                reply_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let err = client.read_version().await.unwrap_err();
        assert!(matches!(err, MgmtError::Timeout));
    }

    #[tokio::test]
    async fn dispatches_events_to_matching_subscribers() {
        let transport = MockTransport::new();
        let (client, _handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        let mut any = client.subscribe(None, None);
        let mut found_dev1 = client.subscribe(Some(MgmtEventCode::DeviceFound), Some(1));
        let addr_a: Address = "11:22:33:44:55:66".parse().unwrap();
        let addr_b: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        transport.inject(MgmtEvent::DeviceFound {
            dev_id: 0,
            address: addr_a,
            address_type: AddressType::LePublic,
            rssi: -55,
            flags: 0,
            eir: Bytes::new(),
        });
        transport.inject(MgmtEvent::DeviceFound {
            dev_id: 1,
            address: addr_b,
            address_type: AddressType::LePublic,
            rssi: -70,
            flags: 0,
            eir: Bytes::new(),
        });
        let first = any.recv().await.unwrap();
        let second = any.recv().await.unwrap();
        assert!(matches!(first, MgmtEvent::DeviceFound { address, rssi, .. } if address == addr_a && rssi == -55));
        assert!(matches!(second, MgmtEvent::DeviceFound { address, rssi, .. } if address == addr_b && rssi == -70));
        let only = found_dev1.recv().await.unwrap();
        assert_eq!(only.dev_id(), 1);
        assert!(found_dev1.try_recv().is_err());
    }

    #[tokio::test]
    async fn init_sequence_is_ordered() {
        let transport = MockTransport::new();
        transport.set_replier(|cmd| match cmd.opcode {
            MgmtOpcode::ReadInfo => {
                let mut data = vec![0u8; 280];
                let supported = AdapterSetting::all().bits();
                data[9..13].copy_from_slice(&supported.to_le_bytes());
                data[13..17].copy_from_slice(&AdapterSetting::POWERED.bits().to_le_bytes());
                vec![complete(cmd, &data)]
            }
            _ => vec![complete(cmd, &0u32.to_le_bytes())],
        });
        let (client, _handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        client.initialize_adapter(0, BtMode::Le).await.unwrap();
        let opcodes: Vec<MgmtOpcode> = transport
            .sent_commands()
            .iter()
            .map(|c| c.opcode)
            .collect();
        assert_eq!(
            opcodes,
            vec![
                MgmtOpcode::ReadInfo,
                MgmtOpcode::SetSsp,
                MgmtOpcode::SetBredr,
                MgmtOpcode::SetLe,
                MgmtOpcode::SetConnectable,
                MgmtOpcode::SetFastConnectable,
                MgmtOpcode::SetPowered,
            ]
        );
    }
}
