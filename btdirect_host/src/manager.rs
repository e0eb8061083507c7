//! Stack entry point: opens the control channel, enumerates and
//! initializes adapters, and hands out [Adapter] handles.

use crate::adapter::Adapter;
use crate::sock::{hci::HciSocket, mgmt::MgmtSocket};
use crate::transport::{HciSocketTransport, MgmtSocketTransport};
use btdirect_core::hci::{HciConfig, HciEngine, HciFilter};
use btdirect_core::mgmt::{
    BtMode, MgmtClient, MgmtConfig, MgmtError, MgmtHandle, MgmtTransport, MgmtVersion,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Clone, Error, Debug)]
pub enum ManagerError {
    #[error("no usable bluetooth adapter")]
    NoAdapters,
    #[error("kernel mgmt version {version}.{revision} is too old")]
    UnsupportedVersion { version: u8, revision: u16 },
    #[error("mgmt: {0}")]
    Mgmt(#[from] MgmtError),
    #[error("internal error: {0}")]
    Internal(ManagerInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum ManagerInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(ManagerInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct ManagerConfig {
    /// Bluetooth operation mode every adapter is initialized into.
    pub mode: BtMode,
    /// MGMT reply timeout; engine default when unset.
    pub reply_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mode: BtMode::Le,
            reply_timeout: None,
        }
    }
}

pub struct Manager {
    mgmt: MgmtClient,
    _mgmt_handle: MgmtHandle,
    version: MgmtVersion,
    adapters: Vec<Adapter>,
    mode: BtMode,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("version", &self.version)
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl Manager {
    /// Opens the kernel control channel and initializes every adapter.
    pub async fn open(config: ManagerConfig) -> Result<Manager, ManagerError> {
        let sock = MgmtSocket::open()?;
        Self::with_transport(Arc::new(MgmtSocketTransport::new(sock)), config).await
    }

    /// Same as [Manager::open] over a caller-provided transport.
    #[tracing::instrument(target = "manager", skip_all)]
    pub async fn with_transport(
        transport: Arc<dyn MgmtTransport>,
        config: ManagerConfig,
    ) -> Result<Manager, ManagerError> {
        let (mgmt, mgmt_handle) = MgmtClient::attach(
            transport,
            MgmtConfig {
                reply_timeout: config.reply_timeout,
                ..Default::default()
            },
        );
        let version = mgmt.read_version().await?;
        tracing::info!(
            "kernel mgmt version {}.{}",
            version.version,
            version.revision
        );
        if version.version < 1 {
            return Err(ManagerError::UnsupportedVersion {
                version: version.version,
                revision: version.revision,
            });
        }
        match mgmt.read_commands().await {
            Ok((commands, events)) => {
                tracing::debug!(
                    commands = commands.len(),
                    events = events.len(),
                    "mgmt introspection"
                );
            }
            Err(err) => tracing::warn!("mgmt command introspection failed: {err}"),
        }
        let indices = mgmt.read_index_list().await?;
        let mut adapters = Vec::with_capacity(indices.len());
        for dev_id in indices {
            match mgmt.initialize_adapter(dev_id, config.mode).await {
                Ok(info) => {
                    tracing::info!(dev_id, address = %info.address, "adapter initialized");
                    adapters.push(Adapter::new(mgmt.clone(), info, config.mode));
                }
                Err(err) => {
                    tracing::warn!(dev_id, "skipping adapter: {err}");
                }
            }
        }
        if adapters.is_empty() {
            return Err(ManagerError::NoAdapters);
        }
        Ok(Manager {
            mgmt,
            _mgmt_handle: mgmt_handle,
            version,
            adapters,
            mode: config.mode,
        })
    }

    pub fn version(&self) -> MgmtVersion {
        self.version
    }

    pub fn mode(&self) -> BtMode {
        self.mode
    }

    pub fn mgmt(&self) -> &MgmtClient {
        &self.mgmt
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn adapter(&self, dev_id: u16) -> Option<&Adapter> {
        self.adapters.iter().find(|a| a.dev_id() == dev_id)
    }

    pub fn default_adapter(&self) -> Option<&Adapter> {
        self.adapters.first()
    }

    /// Opens the raw HCI channel of `adapter`, installs the standard event
    /// filter and attaches the engine.
    pub fn attach_hci(&self, adapter: &Adapter) -> Result<HciEngine, ManagerError> {
        let sock = HciSocket::open(adapter.dev_id())?;
        sock.set_filter(&HciFilter::standard())?;
        Ok(adapter.attach_hci(Arc::new(HciSocketTransport::new(sock)), HciConfig::default()))
    }

    /// Powers every adapter down, reversing the initialization sequence.
    #[tracing::instrument(target = "manager", skip(self))]
    pub async fn shutdown(&self) {
        for adapter in &self.adapters {
            if let Err(err) = adapter.stop_discovery().await {
                tracing::debug!(dev_id = adapter.dev_id(), "stop discovery: {err}");
            }
            self.mgmt.shutdown_adapter(adapter.dev_id()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use btdirect_core::mgmt::{
        AdapterSetting, MgmtCommand, MgmtEvent, MgmtOpcode, MgmtStatus, MGMT_INDEX_NONE,
    };
    use bytes::{BufMut, Bytes, BytesMut};
    use std::sync::Mutex as SyncMutex;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct KernelMock {
        sent: SyncMutex<Vec<MgmtCommand>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: mpsc::UnboundedSender<Bytes>,
        indices: Vec<u16>,
    }

    impl KernelMock {
        fn new(indices: Vec<u16>) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: SyncMutex::new(Vec::new()),
                rx: tokio::sync::Mutex::new(rx),
                tx,
                indices,
            })
        }

        fn reply_data(&self, cmd: &MgmtCommand) -> Bytes {
            match cmd.opcode {
                MgmtOpcode::ReadVersion => Bytes::from_static(&[0x01, 0x0E, 0x00]),
                MgmtOpcode::ReadCommands => Bytes::from_static(&[0x00, 0x00, 0x00, 0x00]),
                MgmtOpcode::ReadIndexList => {
                    let mut data = BytesMut::new();
                    data.put_u16_le(self.indices.len() as u16);
                    for index in &self.indices {
                        data.put_u16_le(*index);
                    }
                    data.freeze()
                }
                MgmtOpcode::ReadInfo => {
                    let mut data = vec![0u8; 280];
                    data[9..13].copy_from_slice(&AdapterSetting::all().bits().to_le_bytes());
                    data[13..17].copy_from_slice(&AdapterSetting::LE.bits().to_le_bytes());
                    Bytes::from(data)
                }
                _ => Bytes::copy_from_slice(&AdapterSetting::all().bits().to_le_bytes()),
            }
        }
    }

    #[async_trait]
    impl MgmtTransport for KernelMock {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            let cmd = MgmtCommand::parse(&frame).unwrap();
            let reply = MgmtEvent::CmdComplete {
                dev_id: cmd.dev_id,
                req_opcode: cmd.opcode as u16,
                status: MgmtStatus::Success,
                data: self.reply_data(&cmd),
            };
            self.sent.lock().unwrap().push(cmd);
            let _ = self.tx.send(reply.encode());
            Ok(())
        }

        async fn recv(&self) -> std::io::Result<BytesMut> {
            match self.rx.lock().await.recv().await {
                Some(frame) => Ok(BytesMut::from(&frame[..])),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed",
                )),
            }
        }
    }

    #[tokio::test]
    async fn enumerates_and_initializes_adapters() {
        let kernel = KernelMock::new(vec![0, 1]);
        let manager = Manager::with_transport(kernel.clone(), ManagerConfig::default())
            .await
            .unwrap();
        assert_eq!(manager.adapters().len(), 2);
        assert!(manager.adapter(1).is_some());
        assert!(manager.adapter(2).is_none());
        let sent = kernel.sent.lock().unwrap();
        assert_eq!(sent[0].opcode, MgmtOpcode::ReadVersion);
        assert_eq!(sent[0].dev_id, MGMT_INDEX_NONE);
        // Per-adapter init ends in powering up.
        assert!(sent
            .iter()
            .any(|c| c.opcode == MgmtOpcode::SetPowered && c.dev_id == 1));
    }

    #[tokio::test]
    async fn no_adapters_is_an_error() {
        let kernel = KernelMock::new(vec![]);
        let err = Manager::with_transport(kernel, ManagerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoAdapters));
    }

    #[tokio::test]
    async fn shutdown_reverses_power_sequence() {
        let kernel = KernelMock::new(vec![0]);
        let manager = Manager::with_transport(kernel.clone(), ManagerConfig::default())
            .await
            .unwrap();
        manager.shutdown().await;
        let opcodes: Vec<MgmtOpcode> = kernel
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.opcode)
            .collect();
        let tail = &opcodes[opcodes.len() - 4..];
        assert_eq!(
            tail,
            &[
                MgmtOpcode::SetConnectable,
                MgmtOpcode::SetFastConnectable,
                MgmtOpcode::SetDiscoverable,
                MgmtOpcode::SetPowered,
            ]
        );
    }
}
