//! One controller: its MGMT-backed state, its HCI engine, the device
//! tables and the status listener registry.

use crate::device::{Device, DeviceKey};
use btdirect_core::hci::{HciConfig, HciEngine, HciHandle, HciStatus, HciTransport, LeConnParams};
use btdirect_core::mgmt::{
    AdapterInfo, AdapterSetting, BtMode, MgmtClient, MgmtError, MgmtEvent, ScanType,
    WhitelistConnectType,
};
use btdirect_core::report::{EirReport, ReportFields, ReportSource};
use btdirect_shared::{Address, AddressType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use strum::Display;
use thiserror::Error;
use tracing::Instrument;

#[derive(Clone, Error, Debug)]
pub enum AdapterError {
    #[error("no hci engine attached to this adapter")]
    HciNotAttached,
    #[error("device is not connected")]
    NotConnected,
    #[error("mgmt: {0}")]
    Mgmt(#[from] MgmtError),
}

/// Per-listener device filter; a rejected device produces no events for
/// that listener.
pub type DeviceFilter = Box<dyn Fn(&Device) -> bool + Send + Sync>;

/// Adapter status callbacks.
///
/// Callbacks run on the adapter's event pump task: they must not block and
/// must not issue request operations back into the stack; hand off to
/// another task for follow-up work.
pub trait AdapterStatusListener: Send + Sync {
    fn on_settings_changed(&self, old: AdapterSetting, new: AdapterSetting, ts: Instant) {
        let _ = (old, new, ts);
    }

    fn on_discovering_changed(&self, scan_type: ScanType, enabled: bool, keep_alive: bool, ts: Instant) {
        let _ = (scan_type, enabled, keep_alive, ts);
    }

    fn on_device_found(&self, device: &Arc<Device>, ts: Instant) {
        let _ = (device, ts);
    }

    fn on_device_updated(&self, device: &Arc<Device>, changed: ReportFields, ts: Instant) {
        let _ = (device, changed, ts);
    }

    fn on_device_connected(&self, device: &Arc<Device>, handle: u16, ts: Instant) {
        let _ = (device, handle, ts);
    }

    fn on_device_disconnected(&self, device: &Arc<Device>, reason: u8, ts: Instant) {
        let _ = (device, reason, ts);
    }
}

/// Discovery state machine, independent per adapter.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DiscoveryPhase {
    #[strum(serialize = "idle")]
    Idle,
    #[strum(serialize = "starting")]
    Starting,
    #[strum(serialize = "running")]
    Running,
    #[strum(serialize = "stopping")]
    Stopping,
}

struct DiscoveryState {
    phase: DiscoveryPhase,
    keep_alive: bool,
    current_type: ScanType,
}

struct ListenerEntry {
    listener: Arc<dyn AdapterStatusListener>,
    filter: Option<DeviceFilter>,
}

#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = self.inner.info.lock().unwrap();
        f.debug_struct("Adapter")
            .field("dev_id", &info.dev_id)
            .field("address", &info.address)
            .finish()
    }
}

struct AdapterInner {
    dev_id: u16,
    mode: BtMode,
    info: StdMutex<AdapterInfo>,
    mgmt: MgmtClient,
    hci: StdMutex<Option<(HciEngine, Arc<HciHandle>)>>,
    discovery: StdMutex<DiscoveryState>,
    /// Every device ever seen by this adapter.
    scanned: StdMutex<HashMap<DeviceKey, Arc<Device>>>,
    /// Devices seen during the current/most recent discovery run.
    discovered: StdMutex<HashMap<DeviceKey, Arc<Device>>>,
    connected: StdMutex<HashMap<DeviceKey, Arc<Device>>>,
    /// Authoritative owner of device lifetimes; the other tables hold
    /// shares.
    shared: StdMutex<HashMap<DeviceKey, Arc<Device>>>,
    listeners: StdMutex<Vec<ListenerEntry>>,
}

impl Adapter {
    /// Builds the adapter and spawns its MGMT event pump.
    pub fn new(mgmt: MgmtClient, info: AdapterInfo, mode: BtMode) -> Self {
        let dev_id = info.dev_id;
        let inner = Arc::new(AdapterInner {
            dev_id,
            mode,
            info: StdMutex::new(info),
            mgmt: mgmt.clone(),
            hci: StdMutex::new(None),
            discovery: StdMutex::new(DiscoveryState {
                phase: DiscoveryPhase::Idle,
                keep_alive: false,
                current_type: ScanType::empty(),
            }),
            scanned: StdMutex::new(HashMap::new()),
            discovered: StdMutex::new(HashMap::new()),
            connected: StdMutex::new(HashMap::new()),
            shared: StdMutex::new(HashMap::new()),
            listeners: StdMutex::new(Vec::new()),
        });
        let mut events = mgmt.subscribe(None, Some(dev_id));
        tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = events.recv().await {
                    AdapterInner::handle_event(&inner, event);
                }
                tracing::debug!(target: "adapter", dev_id, "mgmt event pump stopped");
            }
            .instrument(tracing::info_span!("adapter_pump", dev_id))
        });
        Self { inner }
    }

    /// Attaches an HCI engine over the given transport and pumps its
    /// normalized events into this adapter.
    pub fn attach_hci(&self, transport: Arc<dyn HciTransport>, config: HciConfig) -> HciEngine {
        let (engine, handle) = HciEngine::attach(transport, self.inner.dev_id, config);
        let mut events = engine.subscribe(None);
        tokio::spawn({
            let inner = self.inner.clone();
            let dev_id = self.inner.dev_id;
            async move {
                while let Some(event) = events.recv().await {
                    AdapterInner::handle_event(&inner, event);
                }
                // The engine is gone; every connection it tracked is dead.
                tracing::debug!(target: "adapter", dev_id, "hci event pump stopped");
                inner.drop_all_connections();
            }
            .instrument(tracing::info_span!("adapter_hci_pump"))
        });
        *self.inner.hci.lock().unwrap() = Some((engine.clone(), Arc::new(handle)));
        engine
    }

    pub fn dev_id(&self) -> u16 {
        self.inner.dev_id
    }

    pub fn address(&self) -> Address {
        self.inner.info.lock().unwrap().address
    }

    pub fn info(&self) -> AdapterInfo {
        self.inner.info.lock().unwrap().clone()
    }

    pub fn mode(&self) -> BtMode {
        self.inner.mode
    }

    pub fn is_powered(&self) -> bool {
        self.inner
            .info
            .lock()
            .unwrap()
            .current_settings
            .contains(AdapterSetting::POWERED)
    }

    pub fn hci(&self) -> Option<HciEngine> {
        self.inner
            .hci
            .lock()
            .unwrap()
            .as_ref()
            .map(|(engine, _)| engine.clone())
    }

    pub fn discovery_phase(&self) -> DiscoveryPhase {
        self.inner.discovery.lock().unwrap().phase
    }

    /// Registers a status listener; deduplicated, returns false when
    /// already present.
    pub fn add_status_listener(
        &self,
        listener: Arc<dyn AdapterStatusListener>,
        filter: Option<DeviceFilter>,
    ) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if listeners
            .iter()
            .any(|e| Arc::ptr_eq(&e.listener, &listener))
        {
            return false;
        }
        listeners.push(ListenerEntry { listener, filter });
        true
    }

    /// Removes a listener; returns false when it was not registered.
    pub fn remove_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        listeners.len() != before
    }

    /// Starts discovery in the adapter's mode.
    ///
    /// With `keep_alive`, discovery is re-issued whenever the controller
    /// flips it off while the desired state is running.
    #[tracing::instrument(target = "adapter", skip(self))]
    pub async fn start_discovery(&self, keep_alive: bool) -> Result<ScanType, AdapterError> {
        {
            let mut discovery = self.inner.discovery.lock().unwrap();
            discovery.phase = DiscoveryPhase::Starting;
            discovery.keep_alive = keep_alive;
        }
        self.inner.discovered.lock().unwrap().clear();
        let requested = self.inner.mode.scan_type();
        match self
            .inner
            .mgmt
            .start_discovery(self.inner.dev_id, requested)
            .await
        {
            Ok(accepted) => {
                self.inner.discovery.lock().unwrap().current_type = accepted;
                Ok(accepted)
            }
            Err(err) => {
                self.inner.discovery.lock().unwrap().phase = DiscoveryPhase::Idle;
                Err(err.into())
            }
        }
    }

    /// Stops discovery; a no-op returning success when already idle.
    #[tracing::instrument(target = "adapter", skip(self))]
    pub async fn stop_discovery(&self) -> Result<(), AdapterError> {
        let current_type = {
            let mut discovery = self.inner.discovery.lock().unwrap();
            if discovery.phase == DiscoveryPhase::Idle {
                return Ok(());
            }
            discovery.phase = DiscoveryPhase::Stopping;
            discovery.keep_alive = false;
            discovery.current_type
        };
        self.inner
            .mgmt
            .stop_discovery(self.inner.dev_id, current_type)
            .await?;
        Ok(())
    }

    /// Issues an LE connection request towards `device`.
    pub async fn connect_le(
        &self,
        device: &Arc<Device>,
        params: LeConnParams,
    ) -> Result<HciStatus, AdapterError> {
        let hci = self.hci().ok_or(AdapterError::HciNotAttached)?;
        Ok(hci
            .le_create_conn(device.address(), device.address_type(), params)
            .await)
    }

    /// Requests disconnection of a connected device.
    pub async fn disconnect(
        &self,
        device: &Arc<Device>,
        reason: HciStatus,
    ) -> Result<HciStatus, AdapterError> {
        let handle = device.connection_handle().ok_or(AdapterError::NotConnected)?;
        let hci = self.hci().ok_or(AdapterError::HciNotAttached)?;
        Ok(hci
            .disconnect(handle, device.address(), device.address_type(), reason)
            .await)
    }

    pub async fn add_device_whitelist(
        &self,
        address: Address,
        address_type: AddressType,
        connect_type: WhitelistConnectType,
    ) -> Result<(), AdapterError> {
        self.inner
            .mgmt
            .add_device_whitelist(self.inner.dev_id, address, address_type, connect_type)
            .await?;
        Ok(())
    }

    pub async fn remove_device_whitelist(
        &self,
        address: Address,
        address_type: AddressType,
    ) -> Result<(), AdapterError> {
        self.inner
            .mgmt
            .remove_device_whitelist(self.inner.dev_id, address, address_type)
            .await?;
        Ok(())
    }

    pub fn find_device(&self, address: Address, address_type: AddressType) -> Option<Arc<Device>> {
        self.inner
            .shared
            .lock()
            .unwrap()
            .get(&(address, address_type))
            .cloned()
    }

    pub fn scanned_devices(&self) -> Vec<Arc<Device>> {
        self.inner.scanned.lock().unwrap().values().cloned().collect()
    }

    pub fn discovered_devices(&self) -> Vec<Arc<Device>> {
        self.inner
            .discovered
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        self.inner
            .connected
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Finalizes a device: drops it from every table.
    pub fn remove_device(&self, device: &Arc<Device>) {
        let key = device.key();
        device.clear_connection();
        self.inner.scanned.lock().unwrap().remove(&key);
        self.inner.discovered.lock().unwrap().remove(&key);
        self.inner.connected.lock().unwrap().remove(&key);
        self.inner.shared.lock().unwrap().remove(&key);
    }
}

impl AdapterInner {
    fn handle_event(self: &Arc<Self>, event: MgmtEvent) {
        let ts = Instant::now();
        match event {
            MgmtEvent::NewSettings { settings, .. } => {
                let (old, new) = {
                    let mut info = self.info.lock().unwrap();
                    let old = info.current_settings;
                    info.apply_settings(settings);
                    (old, info.current_settings)
                };
                if old != new {
                    self.for_each_listener(None, |l| l.on_settings_changed(old, new, ts));
                }
            }
            MgmtEvent::LocalNameChanged {
                name, short_name, ..
            } => {
                let mut info = self.info.lock().unwrap();
                info.name = name;
                info.short_name = short_name;
            }
            MgmtEvent::Discovering {
                scan_type, enabled, ..
            } => self.handle_discovering(scan_type, enabled, ts),
            MgmtEvent::DeviceFound {
                address,
                address_type,
                rssi,
                eir,
                ..
            } => {
                let source = if address_type == AddressType::BrEdr {
                    ReportSource::Eir
                } else {
                    ReportSource::Ad
                };
                let mut report = EirReport::new(source, address, address_type);
                report.set_rssi(rssi);
                report.read_data(&eir);
                self.handle_device_found(address, address_type, report, ts);
            }
            MgmtEvent::DeviceConnected {
                address,
                address_type,
                handle,
                ..
            } => {
                let device = self.find_or_create(address, address_type);
                device.set_connection_handle(handle);
                self.connected
                    .lock()
                    .unwrap()
                    .insert(device.key(), device.clone());
                self.for_each_listener(Some(&device), |l| {
                    l.on_device_connected(&device, handle, ts)
                });
            }
            MgmtEvent::DeviceDisconnected {
                address,
                address_type,
                reason,
                ..
            } => {
                let key = (address, address_type);
                let device = self.connected.lock().unwrap().remove(&key);
                let device = device.or_else(|| self.shared.lock().unwrap().get(&key).cloned());
                match device {
                    Some(device) => {
                        device.clear_connection();
                        self.for_each_listener(Some(&device), |l| {
                            l.on_device_disconnected(&device, reason, ts)
                        });
                    }
                    None => {
                        tracing::debug!(target: "adapter", %address, "disconnect for unknown device");
                    }
                }
            }
            MgmtEvent::ConnectFailed {
                address, status, ..
            } => {
                tracing::warn!(target: "adapter", %address, status, "connect failed");
            }
            MgmtEvent::IndexRemoved { .. } => {
                tracing::warn!(target: "adapter", dev_id = self.dev_id, "adapter index removed");
            }
            other => {
                tracing::trace!(target: "adapter", ?other, "unhandled mgmt event");
            }
        }
    }

    fn handle_discovering(self: &Arc<Self>, scan_type: ScanType, enabled: bool, ts: Instant) {
        let (keep_alive, restart) = {
            let mut discovery = self.discovery.lock().unwrap();
            if enabled {
                discovery.phase = DiscoveryPhase::Running;
                (discovery.keep_alive, false)
            } else {
                let restart =
                    discovery.keep_alive && discovery.phase == DiscoveryPhase::Running;
                discovery.phase = if restart {
                    DiscoveryPhase::Starting
                } else {
                    DiscoveryPhase::Idle
                };
                (discovery.keep_alive, restart)
            }
        };
        self.for_each_listener(None, |l| {
            l.on_discovering_changed(scan_type, enabled, keep_alive, ts)
        });
        if restart {
            tracing::debug!(target: "adapter", dev_id = self.dev_id, "re-issuing discovery");
            let inner = self.clone();
            tokio::spawn(async move {
                let requested = inner.mode.scan_type();
                match inner.mgmt.start_discovery(inner.dev_id, requested).await {
                    Ok(accepted) => {
                        inner.discovery.lock().unwrap().current_type = accepted;
                    }
                    Err(err) => {
                        tracing::warn!(target: "adapter", "discovery keep-alive failed: {err}");
                        inner.discovery.lock().unwrap().phase = DiscoveryPhase::Idle;
                    }
                }
            });
        }
    }

    fn handle_device_found(
        self: &Arc<Self>,
        address: Address,
        address_type: AddressType,
        report: EirReport,
        ts: Instant,
    ) {
        let key = (address, address_type);
        let existing = self.shared.lock().unwrap().get(&key).cloned();
        match existing {
            Some(device) => {
                let changed = device.update_from_report(&report);
                self.discovered
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert_with(|| device.clone());
                if !changed.is_empty() {
                    self.for_each_listener(Some(&device), |l| {
                        l.on_device_updated(&device, changed, ts)
                    });
                }
            }
            None => {
                let device = Device::new(self.dev_id, address, address_type);
                device.update_from_report(&report);
                self.shared.lock().unwrap().insert(key, device.clone());
                self.scanned.lock().unwrap().insert(key, device.clone());
                self.discovered.lock().unwrap().insert(key, device.clone());
                self.for_each_listener(Some(&device), |l| l.on_device_found(&device, ts));
            }
        }
    }

    fn find_or_create(self: &Arc<Self>, address: Address, address_type: AddressType) -> Arc<Device> {
        let key = (address, address_type);
        let mut shared = self.shared.lock().unwrap();
        if let Some(device) = shared.get(&key) {
            return device.clone();
        }
        let device = Device::new(self.dev_id, address, address_type);
        shared.insert(key, device.clone());
        self.scanned.lock().unwrap().insert(key, device.clone());
        device
    }

    /// Marks every connected device disconnected and notifies listeners;
    /// runs when the HCI engine dies under the connections it tracked.
    fn drop_all_connections(&self) {
        let ts = Instant::now();
        let dropped: Vec<Arc<Device>> =
            self.connected.lock().unwrap().drain().map(|(_, d)| d).collect();
        for device in dropped {
            device.clear_connection();
            self.for_each_listener(Some(&device), |l| {
                l.on_device_disconnected(&device, HciStatus::InternalFailure as u8, ts)
            });
        }
    }

    /// Invokes `f` on a snapshot of the listeners, honoring per-listener
    /// device filters; listeners may mutate the registry from within.
    fn for_each_listener(
        &self,
        device: Option<&Arc<Device>>,
        f: impl Fn(&Arc<dyn AdapterStatusListener>),
    ) {
        let snapshot: Vec<(Arc<dyn AdapterStatusListener>, bool)> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|e| {
                let pass = match (&e.filter, device) {
                    (Some(filter), Some(device)) => filter(device),
                    _ => true,
                };
                (e.listener.clone(), pass)
            })
            .collect();
        for (listener, pass) in snapshot {
            if pass {
                f(&listener);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use btdirect_core::hci::HciEvent;
    use btdirect_core::mgmt::{MgmtCommand, MgmtConfig, MgmtOpcode, MgmtStatus};
    use bytes::{Bytes, BytesMut};
    use std::sync::Mutex as SyncMutex;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Duration};

    #[derive(Debug)]
    struct MockMgmtTransport {
        sent: SyncMutex<Vec<MgmtCommand>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: mpsc::UnboundedSender<Bytes>,
    }

    impl MockMgmtTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: SyncMutex::new(Vec::new()),
                rx: tokio::sync::Mutex::new(rx),
                tx,
            })
        }

        fn inject(&self, event: MgmtEvent) {
            self.tx.send(event.encode()).unwrap();
        }

        fn sent_opcodes(&self) -> Vec<MgmtOpcode> {
            self.sent.lock().unwrap().iter().map(|c| c.opcode).collect()
        }
    }

    #[async_trait]
    impl btdirect_core::mgmt::MgmtTransport for MockMgmtTransport {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            let cmd = MgmtCommand::parse(&frame).unwrap();
            // Echo the accepted scan type for discovery, empty otherwise.
            let data = match cmd.opcode {
                MgmtOpcode::StartDiscovery => cmd.param.clone(),
                _ => Bytes::new(),
            };
            let reply = MgmtEvent::CmdComplete {
                dev_id: cmd.dev_id,
                req_opcode: cmd.opcode as u16,
                status: MgmtStatus::Success,
                data,
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

    #[derive(Debug)]
    struct MockHciTransport {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        tx: mpsc::UnboundedSender<Bytes>,
    }

    impl MockHciTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                rx: tokio::sync::Mutex::new(rx),
                tx,
            })
        }

        fn inject(&self, event: HciEvent) {
            self.tx.send(event.encode()).unwrap();
        }
    }

    #[async_trait]
    impl HciTransport for MockHciTransport {
        async fn send(&self, frame: Bytes) -> std::io::Result<()> {
            // Accept every command.
            let opcode = u16::from_le_bytes([frame[1], frame[2]]);
            let _ = self.tx.send(
                HciEvent::CmdStatus {
                    status: HciStatus::Success,
                    num_hci_cmd_pkts: 1,
                    opcode,
                }
                .encode(),
            );
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

    #[derive(Default)]
    struct RecordingListener {
        found: SyncMutex<Vec<(Address, Option<i8>)>>,
        updated: SyncMutex<Vec<(Address, ReportFields)>>,
        connected: SyncMutex<Vec<(Address, u16)>>,
        disconnected: SyncMutex<Vec<(Address, u8)>>,
        discovering: SyncMutex<Vec<bool>>,
        settings: SyncMutex<Vec<(AdapterSetting, AdapterSetting)>>,
    }

    impl AdapterStatusListener for RecordingListener {
        fn on_settings_changed(&self, old: AdapterSetting, new: AdapterSetting, _ts: Instant) {
            self.settings.lock().unwrap().push((old, new));
        }

        fn on_discovering_changed(
            &self,
            _scan_type: ScanType,
            enabled: bool,
            _keep_alive: bool,
            _ts: Instant,
        ) {
            self.discovering.lock().unwrap().push(enabled);
        }

        fn on_device_found(&self, device: &Arc<Device>, _ts: Instant) {
            self.found
                .lock()
                .unwrap()
                .push((device.address(), device.rssi()));
        }

        fn on_device_updated(&self, device: &Arc<Device>, changed: ReportFields, _ts: Instant) {
            self.updated.lock().unwrap().push((device.address(), changed));
        }

        fn on_device_connected(&self, device: &Arc<Device>, handle: u16, _ts: Instant) {
            self.connected.lock().unwrap().push((device.address(), handle));
        }

        fn on_device_disconnected(&self, device: &Arc<Device>, reason: u8, _ts: Instant) {
            self.disconnected
                .lock()
                .unwrap()
                .push((device.address(), reason));
        }
    }

    fn adapter_info(dev_id: u16) -> AdapterInfo {
        AdapterInfo {
            dev_id,
            address: "00:1A:7D:DA:71:13".parse().unwrap(),
            hci_version: 8,
            manufacturer: 2,
            supported_settings: AdapterSetting::all(),
            current_settings: AdapterSetting::POWERED | AdapterSetting::LE,
            dev_class: 0,
            name: "hci0".into(),
            short_name: String::new(),
        }
    }

    async fn test_adapter() -> (Adapter, Arc<MockMgmtTransport>, btdirect_core::mgmt::MgmtHandle) {
        let transport = MockMgmtTransport::new();
        let (mgmt, handle) = MgmtClient::attach(transport.clone(), MgmtConfig::default());
        (
            Adapter::new(mgmt, adapter_info(0), BtMode::Le),
            transport,
            handle,
        )
    }

    fn found_event(address: &str, rssi: i8) -> MgmtEvent {
        MgmtEvent::DeviceFound {
            dev_id: 0,
            address: address.parse().unwrap(),
            address_type: AddressType::LePublic,
            rssi,
            flags: 0,
            eir: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn discovers_two_devices_in_order() {
        let (adapter, transport, _handle) = test_adapter().await;
        let listener = Arc::new(RecordingListener::default());
        assert!(adapter.add_status_listener(listener.clone(), None));
        // Re-registering the same listener keeps one entry.
        assert!(!adapter.add_status_listener(listener.clone(), None));

        let accepted = adapter.start_discovery(false).await.unwrap();
        assert_eq!(accepted, ScanType::LE);
        transport.inject(MgmtEvent::Discovering {
            dev_id: 0,
            scan_type: ScanType::LE,
            enabled: true,
        });
        transport.inject(found_event("11:22:33:44:55:66", -55));
        transport.inject(found_event("AA:BB:CC:DD:EE:FF", -70));
        sleep(Duration::from_millis(30)).await;

        assert_eq!(adapter.discovery_phase(), DiscoveryPhase::Running);
        let found = listener.found.lock().unwrap().clone();
        assert_eq!(
            found,
            vec![
                ("11:22:33:44:55:66".parse().unwrap(), Some(-55)),
                ("AA:BB:CC:DD:EE:FF".parse().unwrap(), Some(-70)),
            ]
        );
        let discovered = adapter.discovered_devices();
        assert_eq!(discovered.len(), 2);
        let one = adapter
            .find_device("11:22:33:44:55:66".parse().unwrap(), AddressType::LePublic)
            .unwrap();
        assert_eq!(one.rssi(), Some(-55));
    }

    #[tokio::test]
    async fn repeated_sighting_updates_instead_of_found() {
        let (adapter, transport, _handle) = test_adapter().await;
        let listener = Arc::new(RecordingListener::default());
        adapter.add_status_listener(listener.clone(), None);
        transport.inject(found_event("11:22:33:44:55:66", -55));
        transport.inject(found_event("11:22:33:44:55:66", -60));
        sleep(Duration::from_millis(30)).await;
        assert_eq!(listener.found.lock().unwrap().len(), 1);
        let updated = listener.updated.lock().unwrap().clone();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].1, ReportFields::RSSI);
        assert_eq!(adapter.scanned_devices().len(), 1);
    }

    #[tokio::test]
    async fn device_filter_suppresses_events() {
        let (adapter, transport, _handle) = test_adapter().await;
        let listener = Arc::new(RecordingListener::default());
        let target: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        adapter.add_status_listener(
            listener.clone(),
            Some(Box::new(move |d: &Device| d.address() == target)),
        );
        transport.inject(found_event("11:22:33:44:55:66", -55));
        transport.inject(found_event("AA:BB:CC:DD:EE:FF", -70));
        sleep(Duration::from_millis(30)).await;
        let found = listener.found.lock().unwrap().clone();
        assert_eq!(found, vec![(target, Some(-70))]);
    }

    #[tokio::test]
    async fn keep_alive_reissues_discovery() {
        let (adapter, transport, _handle) = test_adapter().await;
        adapter.start_discovery(true).await.unwrap();
        transport.inject(MgmtEvent::Discovering {
            dev_id: 0,
            scan_type: ScanType::LE,
            enabled: true,
        });
        sleep(Duration::from_millis(20)).await;
        // Controller flips discovery off while desired state is running.
        transport.inject(MgmtEvent::Discovering {
            dev_id: 0,
            scan_type: ScanType::LE,
            enabled: false,
        });
        sleep(Duration::from_millis(30)).await;
        let starts = transport
            .sent_opcodes()
            .iter()
            .filter(|o| **o == MgmtOpcode::StartDiscovery)
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn stop_discovery_when_idle_is_a_no_op() {
        let (adapter, transport, _handle) = test_adapter().await;
        adapter.stop_discovery().await.unwrap();
        assert_eq!(adapter.discovery_phase(), DiscoveryPhase::Idle);
        assert!(transport.sent_opcodes().is_empty());
    }

    #[tokio::test]
    async fn settings_change_is_dispatched_once() {
        let (adapter, transport, _handle) = test_adapter().await;
        let listener = Arc::new(RecordingListener::default());
        adapter.add_status_listener(listener.clone(), None);
        let new_settings =
            AdapterSetting::POWERED | AdapterSetting::LE | AdapterSetting::DISCOVERABLE;
        transport.inject(MgmtEvent::NewSettings {
            dev_id: 0,
            settings: new_settings,
        });
        // Identical settings again: no second callback.
        transport.inject(MgmtEvent::NewSettings {
            dev_id: 0,
            settings: new_settings,
        });
        sleep(Duration::from_millis(30)).await;
        let settings = listener.settings.lock().unwrap().clone();
        assert_eq!(settings.len(), 1);
        assert_eq!(
            settings[0],
            (AdapterSetting::POWERED | AdapterSetting::LE, new_settings)
        );
        assert!(adapter
            .info()
            .current_settings
            .contains(AdapterSetting::DISCOVERABLE));
    }

    #[tokio::test]
    async fn connect_and_disconnect_round_trip() {
        let (adapter, mgmt_transport, _handle) = test_adapter().await;
        let listener = Arc::new(RecordingListener::default());
        adapter.add_status_listener(listener.clone(), None);
        let hci_transport = MockHciTransport::new();
        adapter.attach_hci(hci_transport.clone(), HciConfig::default());

        let peer: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        mgmt_transport.inject(found_event("AA:BB:CC:DD:EE:FF", -70));
        sleep(Duration::from_millis(20)).await;
        let device = adapter.find_device(peer, AddressType::LePublic).unwrap();

        let status = adapter
            .connect_le(&device, LeConnParams::default())
            .await
            .unwrap();
        assert_eq!(status, HciStatus::Success);
        hci_transport.inject(HciEvent::LeConnComplete {
            status: HciStatus::Success,
            handle: 0x0040,
            role: 0,
            peer_address_type: AddressType::LePublic,
            peer_address: peer,
            conn_interval: 0x000F,
            conn_latency: 0,
            supervision_timeout: 0x0C80,
        });
        sleep(Duration::from_millis(30)).await;
        assert_eq!(device.connection_handle(), Some(0x0040));
        assert_eq!(adapter.connected_devices().len(), 1);
        assert_eq!(
            listener.connected.lock().unwrap().as_slice(),
            &[(peer, 0x0040)]
        );

        let status = adapter
            .disconnect(&device, HciStatus::RemoteUserTerminatedConnection)
            .await
            .unwrap();
        assert_eq!(status, HciStatus::Success);
        hci_transport.inject(HciEvent::DisconnComplete {
            status: HciStatus::Success,
            handle: 0x0040,
            reason: 0x13,
        });
        sleep(Duration::from_millis(30)).await;
        assert!(!device.is_connected());
        assert!(adapter.connected_devices().is_empty());
        assert_eq!(
            listener.disconnected.lock().unwrap().as_slice(),
            &[(peer, 0x13)]
        );
    }

    #[tokio::test]
    async fn remove_device_finalizes_all_tables() {
        let (adapter, transport, _handle) = test_adapter().await;
        transport.inject(found_event("11:22:33:44:55:66", -55));
        sleep(Duration::from_millis(20)).await;
        let device = adapter
            .find_device("11:22:33:44:55:66".parse().unwrap(), AddressType::LePublic)
            .unwrap();
        adapter.remove_device(&device);
        assert!(adapter
            .find_device("11:22:33:44:55:66".parse().unwrap(), AddressType::LePublic)
            .is_none());
        assert!(adapter.scanned_devices().is_empty());
        assert!(adapter.discovered_devices().is_empty());
    }
}
