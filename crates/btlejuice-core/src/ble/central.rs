//! BlueZ central role (real device side)
//!
//! Uses bluer (BlueZ D-Bus). BlueZ names remote attribute objects after their ATT
//! handle, so object ids double as handles: a service id is its start handle, a
//! characteristic id is its declaration handle (the value follows it) and a descriptor
//! id is its own handle.
//!
//! BlueZ never hands out raw ATT or raw advertising payloads. Advertising records are
//! rebuilt from the device properties, and [`AttBearer`] is emulated: prepared writes
//! are staged locally and committed as one reliable write on execute.

use log::{debug, info, trace, warn};

use crate::ble::adv::{self, AD_COMPLETE_NAME, AD_FLAGS, AD_MANUFACTURER_DATA};
use crate::ble::{
    AttBearer, CentralBackend, CentralEvent, CharacteristicInfo, DescriptorInfo,
    PlatformBinding, ReportKind, ServiceInfo,
};
use crate::error::{ProxyError, Result};
use crate::gatt::uuid::from_uuid;
use crate::gatt::{Handle, Properties};
use crate::proxy::long_write::{
    ATT_ECODE_INVALID_HANDLE, ATT_ECODE_INVALID_OFFSET, ATT_ECODE_REQ_NOT_SUPPORTED,
    ATT_ECODE_UNLIKELY, ATT_EXECUTE_WRITE_REQ, ATT_EXECUTE_WRITE_RSP, ATT_PREPARE_WRITE_REQ,
    ATT_PREPARE_WRITE_RSP, ATT_WRITE_CMD, ATT_WRITE_REQ, ATT_WRITE_RSP, error_response,
};
use async_trait::async_trait;
use bluer::gatt::WriteOp;
use bluer::gatt::remote::{
    Characteristic as RemoteCharacteristic, CharacteristicReadRequest,
    CharacteristicWriteRequest, Service as RemoteService,
};
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// LE General Discoverable, BR/EDR not supported.
const DEFAULT_AD_FLAGS: u8 = 0x06;

const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

type CharKey = (String, String);

/// Remote attribute objects of one device. This is what a [`PlatformBinding`] carries.
#[derive(Debug, Clone, Default)]
pub struct GattBindings {
    services: HashMap<String, RemoteService>,
    characteristics: HashMap<CharKey, RemoteCharacteristic>,
    by_handle: HashMap<Handle, RemoteCharacteristic>,
}

struct Link {
    device: Device,
    bindings: GattBindings,
    subscriptions: HashMap<CharKey, JoinHandle<()>>,
    watcher: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.watcher.abort();
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

pub struct BluerCentral {
    adapter: Adapter,
    _session: bluer::Session,
    events: mpsc::Sender<CentralEvent>,
    default_mtu: u16,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<HashMap<String, Link>>,
}

impl BluerCentral {
    /// Opens a BlueZ session on `adapter_name` (or the default adapter) and powers it on.
    ///
    /// Returns the backend and the receiving end of its event channel.
    pub async fn new(
        adapter_name: Option<&str>,
        default_mtu: u16,
    ) -> Result<(Self, mpsc::Receiver<CentralEvent>)> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session
                .default_adapter()
                .await
                .map_err(|_| ProxyError::NoAdapter)?,
        };

        debug!("Powering on adapter: {}", adapter.name());
        adapter.set_powered(true).await?;
        info!("Central role using adapter {}", adapter.name());

        let (events, rx) = mpsc::channel(64);
        Ok((
            Self {
                adapter,
                _session: session,
                events,
                default_mtu,
                scan_task: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }

    fn parse_address(address: &str) -> Result<Address> {
        address.parse::<Address>().map_err(|e| ProxyError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }

    async fn service(&self, address: &str, service: &str) -> Result<RemoteService> {
        let links = self.links.lock().await;
        let link = links
            .get(&address.to_lowercase())
            .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?;
        link.bindings
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownService(service.to_string()))
    }

    async fn characteristic(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<RemoteCharacteristic> {
        let links = self.links.lock().await;
        let link = links
            .get(&address.to_lowercase())
            .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?;
        link.bindings
            .characteristics
            .get(&(service.to_string(), characteristic.to_string()))
            .cloned()
            .ok_or_else(|| ProxyError::UnknownCharacteristic {
                service: service.to_string(),
                characteristic: characteristic.to_string(),
            })
    }
}

/// Rebuilds the advertising and scan response payloads of a device from its properties.
async fn advertising_payloads(device: &Device) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut uuid16 = Vec::new();
    let mut uuid128 = Vec::new();
    for uuid in device.uuids().await?.unwrap_or_default() {
        let short = from_uuid(uuid);
        match u16::from_str_radix(&short, 16) {
            Ok(value) if short.len() == 4 => uuid16.extend_from_slice(&value.to_le_bytes()),
            _ => {
                let mut bytes = *uuid.as_bytes();
                bytes.reverse();
                uuid128.extend_from_slice(&bytes);
            }
        }
    }

    let mut service_data = Vec::new();
    for (uuid, data) in device.service_data().await?.unwrap_or_default() {
        if let Ok(value) = u16::from_str_radix(&from_uuid(uuid), 16) {
            let mut record = value.to_le_bytes().to_vec();
            record.extend_from_slice(&data);
            service_data.push(record);
        }
    }

    let flags = [DEFAULT_AD_FLAGS];
    let mut adv_records: Vec<(u8, &[u8])> = vec![(AD_FLAGS, &flags)];
    if !uuid16.is_empty() {
        adv_records.push((adv::AD_COMPLETE_UUID16, &uuid16));
    }
    if !uuid128.is_empty() {
        adv_records.push((adv::AD_COMPLETE_UUID128, &uuid128));
    }
    adv_records.extend(service_data.iter().map(|d| (adv::AD_SERVICE_DATA16, d.as_slice())));

    let name = device.name().await?.unwrap_or_default();
    let mut manufacturer = Vec::new();
    for (company, data) in device.manufacturer_data().await?.unwrap_or_default() {
        let mut record = company.to_le_bytes().to_vec();
        record.extend_from_slice(&data);
        manufacturer.push(record);
    }
    let mut scan_records: Vec<(u8, &[u8])> = Vec::new();
    if !name.is_empty() {
        scan_records.push((AD_COMPLETE_NAME, name.as_bytes()));
    }
    scan_records.extend(manufacturer.iter().map(|d| (AD_MANUFACTURER_DATA, d.as_slice())));

    Ok((adv::encode(adv_records), adv::encode(scan_records)))
}

/// BlueZ drops the RSSI of every device when discovery stops, so only devices heard
/// during the current scan carry one.
fn should_report(reported: &HashSet<Address>, addr: Address, rssi: Option<i16>) -> bool {
    rssi.is_some() && !reported.contains(&addr)
}

async fn report_device(
    adapter: &Adapter,
    addr: Address,
    events: &mpsc::Sender<CentralEvent>,
    reported: &mut HashSet<Address>,
) {
    let result: Result<()> = async {
        let device = adapter.device(addr)?;
        let rssi = device.rssi().await?;
        if !should_report(reported, addr, rssi) {
            return Ok(());
        }
        reported.insert(addr);

        let name = device.name().await?;
        let (adv_data, scan_data) = advertising_payloads(&device).await?;
        let address = addr.to_string().to_lowercase();

        trace!("Advertisement from {}: rssi={:?} name={:?}", address, rssi, name);
        let _ = events
            .send(CentralEvent::Advertisement {
                address: address.clone(),
                name: name.clone(),
                rssi,
                kind: ReportKind::Advertising,
                data: adv_data,
            })
            .await;
        if !scan_data.is_empty() {
            let _ = events
                .send(CentralEvent::Advertisement {
                    address,
                    name,
                    rssi,
                    kind: ReportKind::ScanResponse,
                    data: scan_data,
                })
                .await;
        }
        Ok::<(), ProxyError>(())
    }
    .await;

    if let Err(e) = result {
        debug!("Skipping device {}: {}", addr, e);
    }
}

async fn poll_until<F, Fut, E>(mut check: F, interval: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    ProxyError: From<E>,
{
    while !check().await? {
        tokio::time::sleep(interval).await;
    }
    Ok(())
}

async fn wait_services_resolved(device: &Device) -> Result<()> {
    poll_until(|| device.is_services_resolved(), SERVICES_RESOLVED_POLL).await
}

fn characteristic_flags(flags: &bluer::gatt::CharacteristicFlags) -> (Properties, Properties) {
    let mut properties = Properties::empty();
    let mut secure = Properties::empty();
    let read_secure =
        flags.encrypt_read || flags.encrypt_authenticated_read || flags.secure_read;
    let write_secure =
        flags.encrypt_write || flags.encrypt_authenticated_write || flags.secure_write;

    for (set, bit, is_secure) in [
        (flags.read, Properties::READ, read_secure),
        (
            flags.write_without_response,
            Properties::WRITE_WITHOUT_RESPONSE,
            write_secure,
        ),
        (flags.write, Properties::WRITE, write_secure),
        (flags.notify, Properties::NOTIFY, read_secure),
        (flags.indicate, Properties::INDICATE, read_secure),
    ] {
        if set {
            properties = properties.with(bit);
            if is_secure {
                secure = secure.with(bit);
            }
        }
    }
    (properties, secure)
}

#[async_trait]
impl CentralBackend for BluerCentral {
    async fn start_scanning(&self) -> Result<()> {
        let mut scan_task = self.scan_task.lock().await;
        if scan_task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Scan already running");
            return Ok(());
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let discoverer = adapter.discover_devices_with_changes().await?;
        info!("Starting BLE scan on {}", adapter.name());

        *scan_task = Some(tokio::spawn(async move {
            tokio::pin!(discoverer);
            let mut reported = HashSet::new();

            // Cached devices count only once they are heard again.
            if let Ok(known) = adapter.device_addresses().await {
                debug!("Checking {} cached devices", known.len());
                for addr in known {
                    report_device(&adapter, addr, &events, &mut reported).await;
                }
            }

            // Property changes arrive as DeviceAdded too, which catches cached
            // devices whose RSSI comes back.
            while let Some(event) = discoverer.next().await {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    report_device(&adapter, addr, &events, &mut reported).await;
                }
            }
            debug!("Discovery stream ended");
        }));
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            info!("BLE scan stopped");
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let addr = Self::parse_address(address)?;
        let device = self.adapter.device(addr)?;

        info!("Connecting to {}", address);
        device.connect().await.map_err(|e| ProxyError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let key = address.to_lowercase();
        let device_events = device.events().await?;
        let events = self.events.clone();
        let watched = key.clone();
        let watcher = tokio::spawn(async move {
            tokio::pin!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    info!("Device {} disconnected", watched);
                    let _ = events
                        .send(CentralEvent::Disconnected { address: watched })
                        .await;
                    break;
                }
            }
        });

        let mut links = self.links.lock().await;
        let bindings = links
            .remove(&key)
            .map(|mut old| std::mem::take(&mut old.bindings))
            .unwrap_or_default();
        links.insert(
            key,
            Link {
                device,
                bindings,
                subscriptions: HashMap::new(),
                watcher,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let Some(link) = self.links.lock().await.remove(&address.to_lowercase()) else {
            return Ok(());
        };
        info!("Disconnecting from {}", address);
        let device = link.device.clone();
        // Drops the watcher first so no disconnect event is raised for our own request.
        drop(link);
        device.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceInfo>> {
        let device = {
            let links = self.links.lock().await;
            links
                .get(&address.to_lowercase())
                .map(|link| link.device.clone())
                .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?
        };

        wait_services_resolved(&device).await?;
        let mut found = Vec::new();
        let mut infos = Vec::new();
        for service in device.services().await? {
            let uuid = from_uuid(service.uuid().await?);
            infos.push(ServiceInfo {
                uuid: uuid.clone(),
                start_handle: service.id(),
                end_handle: None,
            });
            found.push((uuid, service));
        }
        debug!("{}: {} service(s)", address, infos.len());

        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(&address.to_lowercase()) {
            link.bindings.services.extend(found);
        }
        Ok(infos)
    }

    async fn discover_characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>> {
        let remote = self.service(address, service).await?;

        let mut found = Vec::new();
        let mut infos = Vec::new();
        for characteristic in remote.characteristics().await? {
            let uuid = from_uuid(characteristic.uuid().await?);
            let (properties, secure) = characteristic_flags(&characteristic.flags().await?);
            let start_handle = characteristic.id();
            infos.push(CharacteristicInfo {
                uuid: uuid.clone(),
                properties,
                secure,
                start_handle,
                value_handle: start_handle.saturating_add(1),
                end_handle: None,
            });
            found.push((uuid, characteristic));
        }
        debug!("{} {}: {} characteristic(s)", address, service, infos.len());

        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(&address.to_lowercase()) {
            for (uuid, characteristic) in found {
                link.bindings
                    .by_handle
                    .insert(characteristic.id().saturating_add(1), characteristic.clone());
                link.bindings
                    .characteristics
                    .insert((service.to_string(), uuid), characteristic);
            }
        }
        Ok(infos)
    }

    async fn discover_descriptors(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<DescriptorInfo>> {
        let remote = self.characteristic(address, service, characteristic).await?;
        let mut infos = Vec::new();
        for descriptor in remote.descriptors().await? {
            infos.push(DescriptorInfo {
                uuid: from_uuid(descriptor.uuid().await?),
                handle: descriptor.id(),
            });
        }
        Ok(infos)
    }

    async fn read(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        offset: u16,
    ) -> Result<Vec<u8>> {
        let remote = self.characteristic(address, service, characteristic).await?;
        let request = CharacteristicReadRequest {
            offset,
            ..Default::default()
        };
        Ok(remote.read_ext(&request).await?)
    }

    async fn subscribe(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        enable: bool,
    ) -> Result<()> {
        let key = (service.to_string(), characteristic.to_string());

        if !enable {
            let mut links = self.links.lock().await;
            if let Some(task) = links
                .get_mut(&address.to_lowercase())
                .and_then(|link| link.subscriptions.remove(&key))
            {
                // Dropping the notification stream stops notifications in BlueZ.
                task.abort();
                debug!("Unsubscribed from {} {}", service, characteristic);
            }
            return Ok(());
        }

        let remote = self.characteristic(address, service, characteristic).await?;
        let stream = remote.notify().await?;
        let events = self.events.clone();
        let (addr, svc, chr) = (
            address.to_lowercase(),
            service.to_string(),
            characteristic.to_string(),
        );
        let task = tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(data) = stream.next().await {
                trace!("Notification {} {}: {}", svc, chr, hex::encode(&data));
                let event = CentralEvent::Notification {
                    address: addr.clone(),
                    service: svc.clone(),
                    characteristic: chr.clone(),
                    data,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        let mut links = self.links.lock().await;
        match links.get_mut(&address.to_lowercase()) {
            Some(link) => {
                if let Some(old) = link.subscriptions.insert(key, task) {
                    old.abort();
                }
                debug!("Subscribed to {} {}", service, characteristic);
                Ok(())
            }
            None => {
                task.abort();
                Err(ProxyError::NotConnected(address.to_string()))
            }
        }
    }

    async fn att_bearer(&self, address: &str) -> Result<Arc<dyn AttBearer>> {
        let characteristics = {
            let links = self.links.lock().await;
            links
                .get(&address.to_lowercase())
                .map(|link| link.bindings.by_handle.clone())
                .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?
        };

        let mtu = match characteristics.values().next() {
            Some(characteristic) => characteristic
                .mtu()
                .await
                .ok()
                .and_then(|mtu| u16::try_from(mtu).ok())
                .unwrap_or(self.default_mtu),
            None => self.default_mtu,
        };

        Ok(Arc::new(BluerAttBearer {
            mtu,
            characteristics,
            staged: Mutex::new(None),
        }))
    }

    async fn export_binding(&self, address: &str) -> Result<PlatformBinding> {
        let links = self.links.lock().await;
        let link = links
            .get(&address.to_lowercase())
            .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?;
        Ok(PlatformBinding::new(link.bindings.clone()))
    }

    async fn restore_binding(&self, address: &str, binding: &PlatformBinding) -> Result<()> {
        let bindings = binding
            .downcast::<GattBindings>()
            .ok_or(ProxyError::ForeignBinding)?;
        let device = {
            let links = self.links.lock().await;
            links
                .get(&address.to_lowercase())
                .map(|link| link.device.clone())
                .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?
        };
        // cached objects are only usable once BlueZ has loaded its GATT cache
        wait_services_resolved(&device).await?;

        let mut links = self.links.lock().await;
        let link = links
            .get_mut(&address.to_lowercase())
            .ok_or_else(|| ProxyError::NotConnected(address.to_string()))?;
        link.bindings = (*bindings).clone();
        debug!(
            "Restored {} service(s) for {}",
            link.bindings.services.len(),
            address
        );
        Ok(())
    }
}

struct PreparedWrite {
    handle: Handle,
    value: Vec<u8>,
}

/// ATT exchange emulated on top of BlueZ characteristic writes.
struct BluerAttBearer {
    mtu: u16,
    characteristics: HashMap<Handle, RemoteCharacteristic>,
    staged: Mutex<Option<PreparedWrite>>,
}

impl BluerAttBearer {
    fn target(
        &self,
        opcode: u8,
        pdu: &[u8],
    ) -> Result<(Handle, &RemoteCharacteristic), Vec<u8>> {
        let [_, lo, hi, ..] = *pdu else {
            return Err(error_response(opcode, 0, ATT_ECODE_INVALID_HANDLE));
        };
        let handle = u16::from_le_bytes([lo, hi]);
        self.characteristics
            .get(&handle)
            .map(|characteristic| (handle, characteristic))
            .ok_or_else(|| error_response(opcode, handle, ATT_ECODE_INVALID_HANDLE))
    }

    async fn write_value(characteristic: &RemoteCharacteristic, value: &[u8], op: WriteOp) -> bool {
        let request = CharacteristicWriteRequest {
            op_type: op,
            ..Default::default()
        };
        match characteristic.write_ext(value, &request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("BlueZ write failed: {}", e);
                false
            }
        }
    }

    async fn prepare(&self, pdu: &[u8]) -> Vec<u8> {
        let (handle, _) = match self.target(ATT_PREPARE_WRITE_REQ, pdu) {
            Ok(target) => target,
            Err(rsp) => return rsp,
        };
        let Some(chunk) = pdu.get(5..) else {
            return error_response(ATT_PREPARE_WRITE_REQ, handle, ATT_ECODE_INVALID_OFFSET);
        };
        let offset = usize::from(u16::from_le_bytes([pdu[3], pdu[4]]));

        let mut staged = self.staged.lock().await;
        let queue = staged.get_or_insert_with(|| PreparedWrite {
            handle,
            value: Vec::new(),
        });
        if queue.handle != handle || queue.value.len() != offset {
            return error_response(ATT_PREPARE_WRITE_REQ, handle, ATT_ECODE_INVALID_OFFSET);
        }
        queue.value.extend_from_slice(chunk);

        let mut rsp = pdu.to_vec();
        rsp[0] = ATT_PREPARE_WRITE_RSP;
        rsp
    }

    async fn execute(&self, pdu: &[u8]) -> Vec<u8> {
        let Some(queue) = self.staged.lock().await.take() else {
            return vec![ATT_EXECUTE_WRITE_RSP];
        };
        if pdu.get(1) != Some(&0x01) {
            debug!("Cancelled {} queued bytes", queue.value.len());
            return vec![ATT_EXECUTE_WRITE_RSP];
        }
        let Some(characteristic) = self.characteristics.get(&queue.handle) else {
            return error_response(ATT_EXECUTE_WRITE_REQ, queue.handle, ATT_ECODE_INVALID_HANDLE);
        };
        if Self::write_value(characteristic, &queue.value, WriteOp::Reliable).await {
            vec![ATT_EXECUTE_WRITE_RSP]
        } else {
            error_response(ATT_EXECUTE_WRITE_REQ, queue.handle, ATT_ECODE_UNLIKELY)
        }
    }
}

#[async_trait]
impl AttBearer for BluerAttBearer {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn request(&self, pdu: Vec<u8>) -> Result<Vec<u8>> {
        let Some(&opcode) = pdu.first() else {
            return Err(ProxyError::WriteProtocol("empty PDU".to_string()));
        };
        Ok(match opcode {
            ATT_WRITE_REQ => match self.target(opcode, &pdu) {
                Ok((handle, characteristic)) => {
                    if Self::write_value(characteristic, &pdu[3..], WriteOp::Request).await {
                        vec![ATT_WRITE_RSP]
                    } else {
                        error_response(opcode, handle, ATT_ECODE_UNLIKELY)
                    }
                }
                Err(rsp) => rsp,
            },
            ATT_PREPARE_WRITE_REQ => self.prepare(&pdu).await,
            ATT_EXECUTE_WRITE_REQ => self.execute(&pdu).await,
            other => error_response(other, 0, ATT_ECODE_REQ_NOT_SUPPORTED),
        })
    }

    async fn command(&self, pdu: Vec<u8>) -> Result<()> {
        if pdu.first() != Some(&ATT_WRITE_CMD) {
            return Err(ProxyError::WriteProtocol(format!(
                "unsupported command PDU {}",
                hex::encode(&pdu)
            )));
        }
        let (_, characteristic) = self
            .target(ATT_WRITE_CMD, &pdu)
            .map_err(|rsp| ProxyError::WriteProtocol(hex::encode(rsp)))?;
        let request = CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
        };
        characteristic.write_ext(&pdu[3..], &request).await?;
        Ok(())
    }
}
