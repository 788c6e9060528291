//! Relay engine
//!
//! Owns the connection state machine for the single active target and serves the
//! single controlling client. Everything runs on one task: client commands, central
//! events, results of spawned BLE operations and the discovery watchdog are multiplexed
//! in [`RelayEngine::run`], so no state is ever mutated concurrently.
//!
//! Spawned operations carry the session epoch they were started in. `stop()` and remote
//! disconnects bump the epoch, which turns any result still in flight into a no-op.

use log::{debug, error, info, warn};

use crate::ble::{AttBearer, CentralBackend, CentralEvent, PlatformBinding, ReportKind};
use crate::error::{ProxyError, Result};
use crate::gatt::{AttributeTree, DeviceProfile, normalize};
use crate::proxy::cache::SessionCache;
use crate::proxy::discovery::DiscoverySession;
use crate::proxy::long_write::LongWriteCoordinator;
use crate::proxy::messages::{ClientRequest, ConnectionState, ProxyEvent};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub discovery_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

/// Input of the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// A new controlling client; replaces the current one.
    Attach {
        id: u64,
        events: mpsc::Sender<ProxyEvent>,
    },
    /// The client with this id went away.
    Detach { id: u64 },
    Request(ClientRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OpKind {
    Read,
    Write,
    Notify,
}

impl OpKind {
    fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Notify => "notify",
        }
    }
}

type OpKey = (OpKind, String, String);

/// Advertising data seen for an address.
#[derive(Debug, Clone, Default)]
struct KnownDevice {
    name: Option<String>,
    adv_records: Vec<u8>,
    scan_data: Option<Vec<u8>>,
}

type Linked = (AttributeTree, PlatformBinding, Arc<dyn AttBearer>);

enum Internal {
    Connected {
        epoch: u64,
        result: Result<()>,
    },
    Discovered {
        epoch: u64,
        result: Result<Linked>,
    },
    Restored {
        epoch: u64,
        result: Result<Arc<dyn AttBearer>>,
    },
    Completed {
        epoch: u64,
        key: OpKey,
        event: ProxyEvent,
    },
    Subscribed {
        epoch: u64,
        key: OpKey,
        enable: bool,
        event: ProxyEvent,
    },
}

struct Client {
    id: u64,
    events: mpsc::Sender<ProxyEvent>,
}

pub struct RelayEngine {
    central: Arc<dyn CentralBackend>,
    config: RelayConfig,
    client: Option<Client>,
    state: ConnectionState,
    target: Option<String>,
    /// Address we hold, or are bringing up, a link with.
    connected: Option<String>,
    cache: SessionCache,
    known: HashMap<String, KnownDevice>,
    tree: Option<AttributeTree>,
    writer: Option<Arc<LongWriteCoordinator>>,
    in_flight: HashSet<OpKey>,
    relays: HashSet<(String, String)>,
    tasks: Vec<JoinHandle<()>>,
    watchdog: Option<Pin<Box<Sleep>>>,
    epoch: u64,
    stopped: bool,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: Option<mpsc::Receiver<Internal>>,
}

impl RelayEngine {
    pub fn new(central: Arc<dyn CentralBackend>, config: RelayConfig) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(64);
        Self {
            central,
            config,
            client: None,
            state: ConnectionState::Disconnected,
            target: None,
            connected: None,
            cache: SessionCache::new(),
            known: HashMap::new(),
            tree: None,
            writer: None,
            in_flight: HashSet::new(),
            relays: HashSet::new(),
            tasks: Vec::new(),
            watchdog: None,
            epoch: 0,
            stopped: false,
            internal_tx,
            internal_rx: Some(internal_rx),
        }
    }

    /// Runs until the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut central_events: mpsc::Receiver<CentralEvent>,
    ) {
        let Some(mut internal) = self.internal_rx.take() else {
            error!("Relay engine started twice");
            return;
        };
        info!("Relay engine running");

        loop {
            tokio::select! {
                // pending central events are handled before the results they may precede
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = central_events.recv() => self.handle_central_event(event).await,
                Some(message) = internal.recv() => self.handle_internal(message).await,
                () = expired(&mut self.watchdog) => self.on_watchdog().await,
            }
        }

        debug!("Command channel closed, shutting down relay");
        self.stop().await;
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Attach { id, events } => {
                if self.client.is_some() {
                    warn!("Replacing controlling client with client #{}", id);
                } else {
                    info!("Client #{} connected", id);
                }
                self.client = Some(Client { id, events });
                self.emit(ProxyEvent::Hello).await;
            }
            EngineCommand::Detach { id } => {
                if self.client.as_ref().is_some_and(|c| c.id == id) {
                    warn!("Client #{} disconnected", id);
                    self.client = None;
                }
            }
            EngineCommand::Request(request) => self.handle_request(request).await,
        }
    }

    async fn handle_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Target {
                address,
                keep_handles,
            } => {
                debug!("Target {} requested (keep_handles={})", address, keep_handles);
                self.configure(&address).await;
            }
            ClientRequest::ScanDevices => self.scan_devices().await,
            ClientRequest::Stop => self.stop().await,
            ClientRequest::Status => {
                let state = self.state;
                self.emit(ProxyEvent::Status { state }).await;
            }
            ClientRequest::BleRead {
                service,
                characteristic,
                offset,
            } => self.read(&service, &characteristic, offset).await,
            ClientRequest::BleWrite {
                service,
                characteristic,
                data,
                without_response,
            } => {
                self.write(&service, &characteristic, data, without_response)
                    .await;
            }
            ClientRequest::BleNotify {
                service,
                characteristic,
                enable,
            } => self.notify(&service, &characteristic, enable).await,
        }
    }

    /// Selects a new target, dropping the current connection if any.
    async fn configure(&mut self, address: &str) {
        info!("Configuring proxy for {}", address);
        self.teardown().await;
        self.stopped = false;
        self.target = Some(address.to_lowercase());
        self.acquire_target().await;
    }

    async fn acquire_target(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.state = ConnectionState::Acquiring;
        info!("Acquiring target {}", target);

        if let Some(entry) = self.cache.lookup(&target) {
            info!("Target in cache, restoring");
            let binding = entry.platform_binding.clone();
            self.state = ConnectionState::Connecting;
            self.connected = Some(target.clone());

            let central = self.central.clone();
            let epoch = self.epoch;
            self.spawn(async move {
                let result = async {
                    central.connect(&target).await?;
                    let linked = async {
                        central.restore_binding(&target, &binding).await?;
                        central.att_bearer(&target).await
                    }
                    .await;
                    if linked.is_err() {
                        if let Err(e) = central.disconnect(&target).await {
                            warn!("Failed to disconnect from {}: {}", target, e);
                        }
                    }
                    linked
                }
                .await;
                Internal::Restored { epoch, result }
            });
            return;
        }

        if let Err(e) = self.central.start_scanning().await {
            error!("Cannot start scanning: {}", e);
            self.state = ConnectionState::Disconnected;
            self.emit(ProxyEvent::Ready { ok: false }).await;
        }
    }

    async fn scan_devices(&mut self) {
        self.teardown().await;
        self.stopped = false;
        self.target = None;
        self.state = ConnectionState::Scanning;
        info!("Scanning for devices");
        if let Err(e) = self.central.start_scanning().await {
            error!("Cannot start scanning: {}", e);
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Drops the current session, if any, and returns to `Disconnected`.
    async fn stop(&mut self) {
        info!("Stopping current proxy");
        self.state = ConnectionState::Stopping;
        self.teardown().await;
        self.state = ConnectionState::Disconnected;

        if !self.stopped {
            self.stopped = true;
            self.emit(ProxyEvent::Stopped).await;
        }
    }

    /// Cancels everything tied to the current session and disconnects.
    async fn teardown(&mut self) {
        self.reset_session();
        if self.state == ConnectionState::Scanning
            || self.state == ConnectionState::Acquiring
            || self.state == ConnectionState::Stopping
        {
            if let Err(e) = self.central.stop_scanning().await {
                warn!("Failed to stop scanning: {}", e);
            }
        }
        if let Some(address) = self.connected.take() {
            if let Err(e) = self.central.disconnect(&address).await {
                warn!("Failed to disconnect from {}: {}", address, e);
            }
        }
        if self.state != ConnectionState::Stopping {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn reset_session(&mut self) {
        self.epoch += 1;
        self.watchdog = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.in_flight.clear();
        self.relays.clear();
        self.tree = None;
        self.writer = None;
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::Advertisement {
                address,
                name,
                rssi,
                kind,
                data,
            } => {
                let address = address.to_lowercase();
                self.track_advertisement(&address, name.clone(), kind, data);

                match self.state {
                    ConnectionState::Scanning if kind == ReportKind::Advertising => {
                        self.emit(ProxyEvent::Discover {
                            address,
                            name,
                            rssi,
                        })
                        .await;
                    }
                    ConnectionState::Acquiring
                        if self.target.as_deref() == Some(address.as_str()) =>
                    {
                        self.connect_target(address).await;
                    }
                    _ => {}
                }
            }
            CentralEvent::Notification {
                address,
                service,
                characteristic,
                data,
            } => {
                let key = (normalize(&service), normalize(&characteristic));
                let ours = self.connected.as_deref() == Some(address.to_lowercase().as_str());
                if ours && self.state == ConnectionState::Forwarding && self.relays.contains(&key)
                {
                    self.emit(ProxyEvent::BleData {
                        service: key.0,
                        characteristic: key.1,
                        data,
                    })
                    .await;
                }
            }
            CentralEvent::Disconnected { address } => {
                if self.connected.as_deref() == Some(address.to_lowercase().as_str()) {
                    self.on_device_disconnected().await;
                }
            }
        }
    }

    fn track_advertisement(
        &mut self,
        address: &str,
        name: Option<String>,
        kind: ReportKind,
        data: Vec<u8>,
    ) {
        match self.known.get_mut(address) {
            None => {
                self.known.insert(
                    address.to_string(),
                    KnownDevice {
                        name,
                        adv_records: data,
                        scan_data: None,
                    },
                );
            }
            Some(device) => {
                if kind == ReportKind::ScanResponse {
                    device.scan_data = Some(data);
                }
                if name.is_some() {
                    device.name = name;
                }
            }
        }
    }

    async fn connect_target(&mut self, address: String) {
        if let Err(e) = self.central.stop_scanning().await {
            warn!("Failed to stop scanning: {}", e);
        }
        self.state = ConnectionState::Connecting;
        self.connected = Some(address.clone());
        info!("Target {} found, connecting", address);

        let central = self.central.clone();
        let epoch = self.epoch;
        self.spawn(async move {
            let result = central.connect(&address).await;
            Internal::Connected { epoch, result }
        });
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected { epoch, result } if epoch == self.epoch => match result {
                Ok(()) => self.start_discovery(),
                Err(e) => {
                    error!("Connection failed: {}", e);
                    self.connected = None;
                    self.state = ConnectionState::Disconnected;
                    self.emit(ProxyEvent::Ready { ok: false }).await;
                }
            },
            Internal::Discovered { epoch, result } if epoch == self.epoch => match result {
                Ok((tree, binding, bearer)) => {
                    self.watchdog = None;
                    if let Some(target) = self.target.clone() {
                        self.cache.store(&target, tree.clone(), binding);
                    }
                    self.enter_forwarding(tree, bearer).await;
                }
                Err(e) => {
                    error!("Discovery failed: {}", e);
                    self.emit(ProxyEvent::Ready { ok: false }).await;
                    self.stop().await;
                }
            },
            Internal::Restored { epoch, result } if epoch == self.epoch => {
                let cached = self
                    .target
                    .as_deref()
                    .and_then(|target| self.cache.lookup(target))
                    .map(|entry| entry.attribute_tree.clone());
                match (result, cached) {
                    (Ok(bearer), Some(tree)) => {
                        self.connected = self.target.clone();
                        self.enter_forwarding(tree, bearer).await;
                    }
                    (Ok(_), None) => {
                        error!("Cache entry vanished during restore");
                        self.teardown().await;
                        self.emit(ProxyEvent::Ready { ok: false }).await;
                    }
                    (Err(e), _) => {
                        // the restore task already dropped any link it brought up
                        error!("Cannot restore cached session: {}", e);
                        self.connected = None;
                        self.state = ConnectionState::Disconnected;
                        self.emit(ProxyEvent::Ready { ok: false }).await;
                    }
                }
            }
            Internal::Completed { epoch, key, event } if epoch == self.epoch => {
                self.in_flight.remove(&key);
                self.emit(event).await;
            }
            Internal::Subscribed {
                epoch,
                key,
                enable,
                event,
            } if epoch == self.epoch => {
                self.in_flight.remove(&key);
                // Only pushed payloads are relayed, never read responses.
                if let ProxyEvent::BleNotifyResp {
                    service,
                    characteristic,
                    error: None,
                } = &event
                {
                    let relay = (service.clone(), characteristic.clone());
                    if enable {
                        self.relays.insert(relay);
                    } else {
                        self.relays.remove(&relay);
                    }
                }
                self.emit(event).await;
            }
            _ => debug!("Dropping result of a stale session"),
        }
    }

    fn start_discovery(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        info!("Connected to {}, discovering attributes", target);
        self.connected = Some(target.clone());
        self.state = ConnectionState::Discovering;
        self.watchdog = Some(Box::pin(tokio::time::sleep(self.config.discovery_timeout)));

        let central = self.central.clone();
        let epoch = self.epoch;
        self.spawn(async move {
            let result = async {
                let tree = DiscoverySession::new(central.clone(), &target).run().await?;
                let binding = central.export_binding(&target).await?;
                let bearer = central.att_bearer(&target).await?;
                Ok::<_, ProxyError>((tree, binding, bearer))
            }
            .await;
            Internal::Discovered { epoch, result }
        });
    }

    async fn enter_forwarding(&mut self, tree: AttributeTree, bearer: Arc<dyn AttBearer>) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let known = self.known.get(&target).cloned().unwrap_or_default();
        let profile = DeviceProfile::new(
            &target,
            known.adv_records,
            known.scan_data,
            known.name,
            tree.clone(),
        );

        self.tree = Some(tree);
        self.writer = Some(Arc::new(LongWriteCoordinator::new(bearer)));
        self.state = ConnectionState::Forwarding;

        self.emit(ProxyEvent::Profile { profile }).await;
        self.emit(ProxyEvent::Ready { ok: true }).await;
        info!("Proxy configured and ready to relay");
    }

    async fn on_watchdog(&mut self) {
        self.watchdog = None;
        let e = ProxyError::DiscoveryTimeout(self.config.discovery_timeout);
        error!("{}, stopping proxy", e);
        self.stop().await;
        self.emit(ProxyEvent::Status {
            state: ConnectionState::Disconnected,
        })
        .await;
    }

    async fn on_device_disconnected(&mut self) {
        error!("Remote device has just disconnected");
        let previous = self.state;
        self.connected = None;
        self.reset_session();

        if !matches!(
            previous,
            ConnectionState::Stopping | ConnectionState::Disconnected
        ) {
            if let Some(address) = self.target.clone() {
                self.emit(ProxyEvent::DeviceDisconnect { address }).await;
            }
        }
        self.state = ConnectionState::Disconnected;
        self.emit(ProxyEvent::Status {
            state: ConnectionState::Disconnected,
        })
        .await;
    }

    /// Checks the relay can take an operation and claims its in-flight slot.
    /// Returns the slot and the address of the linked device.
    fn begin(
        &mut self,
        op: OpKind,
        service: &str,
        characteristic: &str,
    ) -> Result<(OpKey, String)> {
        if self.state != ConnectionState::Forwarding {
            return Err(ProxyError::NotForwarding);
        }
        let Some(address) = self.connected.clone() else {
            return Err(ProxyError::NotForwarding);
        };
        let key = (op, service.to_string(), characteristic.to_string());
        if self.in_flight.contains(&key) {
            return Err(ProxyError::Busy {
                op: op.name(),
                service: key.1,
                characteristic: key.2,
            });
        }
        self.in_flight.insert(key.clone());
        Ok((key, address))
    }

    async fn read(&mut self, service: &str, characteristic: &str, offset: u16) {
        let (service, characteristic) = (normalize(service), normalize(characteristic));
        let (key, address) = match self.begin(OpKind::Read, &service, &characteristic) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Read of {} {} rejected: {}", service, characteristic, e);
                self.emit(ProxyEvent::BleReadResp {
                    service,
                    characteristic,
                    data: Vec::new(),
                    error: Some(e.to_string()),
                })
                .await;
                return;
            }
        };

        let central = self.central.clone();
        let epoch = self.epoch;
        self.spawn(async move {
            let result = central
                .read(&address, &service, &characteristic, offset)
                .await;
            let (data, error) = match result {
                Ok(data) => (data, None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            Internal::Completed {
                epoch,
                key,
                event: ProxyEvent::BleReadResp {
                    service,
                    characteristic,
                    data,
                    error,
                },
            }
        });
    }

    async fn write(
        &mut self,
        service: &str,
        characteristic: &str,
        data: Vec<u8>,
        without_response: bool,
    ) {
        let (service, characteristic) = (normalize(service), normalize(characteristic));
        let prepared = self
            .begin(OpKind::Write, &service, &characteristic)
            .and_then(|(key, _)| {
                let handle = self
                    .tree
                    .as_ref()
                    .and_then(|tree| tree.characteristic(&service, &characteristic))
                    .map(|c| c.value_handle);
                let writer = self.writer.clone();
                match (handle, writer) {
                    (Some(handle), Some(writer)) => Ok((key, handle, writer)),
                    _ => {
                        self.in_flight.remove(&key);
                        Err(ProxyError::UnknownCharacteristic {
                            service: service.clone(),
                            characteristic: characteristic.clone(),
                        })
                    }
                }
            });

        let (key, handle, writer) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Write to {} {} rejected: {}", service, characteristic, e);
                self.emit(ProxyEvent::BleWriteResp {
                    service,
                    characteristic,
                    error: Some(e.to_string()),
                })
                .await;
                return;
            }
        };

        let epoch = self.epoch;
        self.spawn(async move {
            let error = writer
                .write(handle, &data, without_response)
                .await
                .err()
                .map(|e| e.to_string());
            Internal::Completed {
                epoch,
                key,
                event: ProxyEvent::BleWriteResp {
                    service,
                    characteristic,
                    error,
                },
            }
        });
    }

    async fn notify(&mut self, service: &str, characteristic: &str, enable: bool) {
        let (service, characteristic) = (normalize(service), normalize(characteristic));
        let (key, address) = match self.begin(OpKind::Notify, &service, &characteristic) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Notify on {} {} rejected: {}", service, characteristic, e);
                self.emit(ProxyEvent::BleNotifyResp {
                    service,
                    characteristic,
                    error: Some(e.to_string()),
                })
                .await;
                return;
            }
        };

        let central = self.central.clone();
        let epoch = self.epoch;
        self.spawn(async move {
            let error = central
                .subscribe(&address, &service, &characteristic, enable)
                .await
                .err()
                .map(|e| e.to_string());
            Internal::Subscribed {
                epoch,
                key,
                enable,
                event: ProxyEvent::BleNotifyResp {
                    service,
                    characteristic,
                    error,
                },
            }
        });
    }

    fn spawn<F>(&mut self, operation: F)
    where
        F: std::future::Future<Output = Internal> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        let tx = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let message = operation.await;
            let _ = tx.send(message).await;
        }));
    }

    async fn emit(&mut self, event: ProxyEvent) {
        let Some(client) = &self.client else {
            warn!("{}, dropping {:?}", ProxyError::ChannelUnavailable, event);
            return;
        };
        if client.events.send(event).await.is_err() {
            warn!("Client #{} is gone, dropping its channel", client.id);
            self.client = None;
        }
    }
}

async fn expired(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{CharacteristicInfo, DescriptorInfo, ServiceInfo};
    use async_trait::async_trait;

    /// Central without any adapter behind it.
    struct Offline;

    #[async_trait]
    impl CentralBackend for Offline {
        async fn start_scanning(&self) -> Result<()> {
            Err(ProxyError::NoAdapter)
        }

        async fn stop_scanning(&self) -> Result<()> {
            Ok(())
        }

        async fn connect(&self, _address: &str) -> Result<()> {
            Err(ProxyError::NoAdapter)
        }

        async fn disconnect(&self, _address: &str) -> Result<()> {
            Ok(())
        }

        async fn discover_services(&self, _address: &str) -> Result<Vec<ServiceInfo>> {
            Err(ProxyError::NoAdapter)
        }

        async fn discover_characteristics(
            &self,
            _address: &str,
            _service: &str,
        ) -> Result<Vec<CharacteristicInfo>> {
            Err(ProxyError::NoAdapter)
        }

        async fn discover_descriptors(
            &self,
            _address: &str,
            _service: &str,
            _characteristic: &str,
        ) -> Result<Vec<DescriptorInfo>> {
            Err(ProxyError::NoAdapter)
        }

        async fn read(
            &self,
            _address: &str,
            _service: &str,
            _characteristic: &str,
            _offset: u16,
        ) -> Result<Vec<u8>> {
            Err(ProxyError::NoAdapter)
        }

        async fn subscribe(
            &self,
            _address: &str,
            _service: &str,
            _characteristic: &str,
            _enable: bool,
        ) -> Result<()> {
            Err(ProxyError::NoAdapter)
        }

        async fn att_bearer(&self, _address: &str) -> Result<Arc<dyn AttBearer>> {
            Err(ProxyError::NoAdapter)
        }

        async fn export_binding(&self, _address: &str) -> Result<PlatformBinding> {
            Err(ProxyError::NoAdapter)
        }

        async fn restore_binding(&self, _address: &str, _binding: &PlatformBinding) -> Result<()> {
            Err(ProxyError::NoAdapter)
        }
    }

    fn unlinked_engine() -> (RelayEngine, mpsc::Receiver<ProxyEvent>) {
        let mut engine = RelayEngine::new(Arc::new(Offline), RelayConfig::default());
        let (events, rx) = mpsc::channel(8);
        engine.client = Some(Client { id: 1, events });
        engine.state = ConnectionState::Forwarding;
        engine.connected = None;
        (engine, rx)
    }

    #[tokio::test]
    async fn test_read_without_link_is_answered_and_frees_slot() {
        let (mut engine, mut rx) = unlinked_engine();

        engine.read("180A", "2A29", 0).await;

        match rx.try_recv() {
            Ok(ProxyEvent::BleReadResp {
                service,
                characteristic,
                error,
                ..
            }) => {
                assert_eq!((service.as_str(), characteristic.as_str()), ("180a", "2a29"));
                assert!(error.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(engine.in_flight.is_empty());
        assert!(engine.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_notify_without_link_is_answered_and_frees_slot() {
        let (mut engine, mut rx) = unlinked_engine();

        engine.notify("fff0", "fff1", true).await;

        assert!(matches!(
            rx.try_recv(),
            Ok(ProxyEvent::BleNotifyResp { error: Some(_), .. })
        ));
        assert!(engine.in_flight.is_empty());
        assert!(engine.relays.is_empty());
    }
}
