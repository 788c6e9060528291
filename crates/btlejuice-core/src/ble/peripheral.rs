//! BlueZ peripheral role (intercepted central side)
//!
//! Serves an [`AttributeTable`] as a BlueZ GATT application and advertises the cloned
//! advertising records.
//!
//! # Handles
//!
//! Every service, characteristic and descriptor is registered with an explicit handle
//! (services at their start handle, characteristics at their value handle). BlueZ
//! allocates the declaration right before the value and manages the CCCD itself, which
//! it places first after the value, so `2902` entries of the table are not registered.
//!
//! # Requests
//!
//! Reads, writes and subscriptions are turned into [`PeripheralEvent`]s. Read and write
//! callbacks wait on the one-shot reply carried by the event.

use log::{debug, info, trace, warn};

use crate::ble::adv::AdContent;
use crate::ble::{
    AttributeTable, PeripheralBackend, PeripheralEvent, RequestError, ServedAttribute,
};
use crate::error::{ProxyError, Result};
use crate::gatt::uuid::to_uuid;
use crate::gatt::{AttributeTree, CCCD_UUID, Handle, Properties};
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Descriptor, DescriptorRead, ReqError, Service,
};
use bluer::{Adapter, Address, DeviceEvent, DeviceProperty};
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

type CharKey = (String, String);

impl From<RequestError> for ReqError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Unlikely => ReqError::Failed,
            RequestError::InvalidOffset => ReqError::InvalidOffset,
            RequestError::InProgress => ReqError::InProgress,
        }
    }
}

/// State shared with the GATT callbacks.
struct PeerState {
    adapter: Adapter,
    events: mpsc::Sender<PeripheralEvent>,
    central: Mutex<Option<Address>>,
    notifiers: Mutex<HashMap<CharKey, mpsc::Sender<Vec<u8>>>>,
}

impl PeerState {
    /// Raises `Accepted` the first time a central shows up and watches it for disconnect.
    fn track(self: &Arc<Self>, address: Address) {
        {
            let Ok(mut central) = self.central.lock() else {
                return;
            };
            if *central == Some(address) {
                return;
            }
            *central = Some(address);
        }

        info!("Central {} connected to emulated device", address);
        let state = self.clone();
        tokio::spawn(async move {
            let name = address.to_string().to_lowercase();
            let _ = state
                .events
                .send(PeripheralEvent::Accepted {
                    address: name.clone(),
                })
                .await;

            let stream = match state.adapter.device(address) {
                Ok(device) => device.events().await,
                Err(e) => Err(e),
            };
            let Ok(stream) = stream else {
                warn!("Cannot watch central {} for disconnection", name);
                return;
            };
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }

            info!("Central {} disconnected", name);
            state.forget(address);
            let _ = state
                .events
                .send(PeripheralEvent::Disconnected { address: name })
                .await;
        });
    }

    fn forget(&self, address: Address) {
        if let Ok(mut central) = self.central.lock() {
            if *central == Some(address) {
                *central = None;
            }
        }
        if let Ok(mut notifiers) = self.notifiers.lock() {
            notifiers.clear();
        }
    }

    fn notifier(&self, key: &CharKey) -> Option<mpsc::Sender<Vec<u8>>> {
        self.notifiers.lock().ok()?.get(key).cloned()
    }
}

pub struct BluerPeripheral {
    adapter: Adapter,
    _session: bluer::Session,
    table: AttributeTable,
    state: Arc<PeerState>,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
}

impl BluerPeripheral {
    pub async fn new(
        adapter_name: Option<&str>,
    ) -> Result<(Self, mpsc::Receiver<PeripheralEvent>)> {
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

        let (events, rx) = mpsc::channel(64);
        let state = Arc::new(PeerState {
            adapter: adapter.clone(),
            events,
            central: Mutex::new(None),
            notifiers: Mutex::new(HashMap::new()),
        });

        Ok((
            Self {
                adapter,
                _session: session,
                table: AttributeTable::default(),
                state,
                app_handle: None,
                adv_handle: None,
            },
            rx,
        ))
    }

    /// Translates the served table into a BlueZ application.
    fn application(&self) -> Result<Application> {
        let mut services: Vec<Service> = Vec::new();

        for (handle, attribute) in self.table.iter() {
            match attribute {
                ServedAttribute::Service { uuid, .. } => services.push(Service {
                    uuid: to_uuid(uuid)?,
                    handle: NonZeroU16::new(handle),
                    primary: true,
                    ..Default::default()
                }),
                ServedAttribute::Characteristic {
                    service,
                    uuid,
                    properties,
                    secure,
                    value_handle,
                    ..
                } => {
                    let characteristic = self.characteristic(
                        service,
                        uuid,
                        Properties::from_bits(*properties),
                        Properties::from_bits(*secure),
                        *value_handle,
                    )?;
                    if let Some(current) = services.last_mut() {
                        current.characteristics.push(characteristic);
                    }
                }
                ServedAttribute::Descriptor { uuid, .. } if uuid == CCCD_UUID => {}
                ServedAttribute::Descriptor {
                    uuid, secure, value, ..
                } => {
                    let descriptor = Descriptor {
                        uuid: to_uuid(uuid)?,
                        handle: NonZeroU16::new(handle),
                        read: Some(static_descriptor_read(
                            value.clone().unwrap_or_default(),
                            secure & Properties::READ != 0,
                        )),
                        ..Default::default()
                    };
                    if let Some(current) = services
                        .last_mut()
                        .and_then(|service| service.characteristics.last_mut())
                    {
                        current.descriptors.push(descriptor);
                    }
                }
                ServedAttribute::CharacteristicValue { .. } => {}
            }
        }

        Ok(Application {
            services,
            ..Default::default()
        })
    }

    fn characteristic(
        &self,
        service: &str,
        uuid: &str,
        properties: Properties,
        secure: Properties,
        value_handle: Handle,
    ) -> Result<Characteristic> {
        let key: CharKey = (service.to_string(), uuid.to_string());

        let read = properties.can_read().then(|| {
            let state = self.state.clone();
            let key = key.clone();
            CharacteristicRead {
                read: true,
                encrypt_read: secure.contains(Properties::READ),
                fun: Box::new(move |req| {
                    let state = state.clone();
                    let (service, characteristic) = key.clone();
                    async move {
                        state.track(req.device_address);
                        let (reply, rx) = oneshot::channel();
                        let event = PeripheralEvent::Read {
                            service,
                            characteristic,
                            offset: req.offset,
                            reply,
                        };
                        state.events.send(event).await.map_err(|_| ReqError::Failed)?;
                        match rx.await {
                            Ok(result) => result.map_err(ReqError::from),
                            Err(_) => Err(ReqError::Failed),
                        }
                    }
                    .boxed()
                }),
                ..Default::default()
            }
        });

        let write = properties.can_write().then(|| {
            let state = self.state.clone();
            let key = key.clone();
            CharacteristicWrite {
                write: properties.contains(Properties::WRITE),
                write_without_response: properties.contains(Properties::WRITE_WITHOUT_RESPONSE),
                encrypt_write: secure.contains(Properties::WRITE)
                    || secure.contains(Properties::WRITE_WITHOUT_RESPONSE),
                method: CharacteristicWriteMethod::Fun(Box::new(move |data, req| {
                    let state = state.clone();
                    let (service, characteristic) = key.clone();
                    async move {
                        state.track(req.device_address);
                        let (reply, rx) = oneshot::channel();
                        let event = PeripheralEvent::Write {
                            service,
                            characteristic,
                            data,
                            offset: req.offset,
                            without_response: req.op_type == bluer::gatt::WriteOp::Command,
                            reply,
                        };
                        state.events.send(event).await.map_err(|_| ReqError::Failed)?;
                        match rx.await {
                            Ok(result) => result.map_err(ReqError::from),
                            Err(_) => Err(ReqError::Failed),
                        }
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        let notify = properties.can_notify().then(|| {
            let state = self.state.clone();
            CharacteristicNotify {
                notify: properties.contains(Properties::NOTIFY),
                indicate: properties.contains(Properties::INDICATE),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let state = state.clone();
                    let key = key.clone();
                    async move {
                        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
                        if let Ok(mut notifiers) = state.notifiers.lock() {
                            notifiers.insert(key.clone(), tx);
                        }
                        let (service, characteristic) = key.clone();
                        debug!("Central subscribed to {} {}", service, characteristic);
                        let _ = state
                            .events
                            .send(PeripheralEvent::Subscribe {
                                service: service.clone(),
                                characteristic: characteristic.clone(),
                            })
                            .await;

                        tokio::spawn(async move {
                            loop {
                                tokio::select! {
                                    data = rx.recv() => {
                                        let Some(data) = data else { break };
                                        if let Err(e) = notifier.notify(data).await {
                                            debug!("Notification on {} failed: {}", characteristic, e);
                                            break;
                                        }
                                    }
                                    () = notifier.stopped() => break,
                                }
                            }

                            if let Ok(mut notifiers) = state.notifiers.lock() {
                                notifiers.remove(&key);
                            }
                            debug!("Central unsubscribed from {} {}", service, characteristic);
                            let _ = state
                                .events
                                .send(PeripheralEvent::Unsubscribe {
                                    service,
                                    characteristic,
                                })
                                .await;
                        });
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        Ok(Characteristic {
            uuid: to_uuid(uuid)?,
            handle: NonZeroU16::new(value_handle),
            read,
            write,
            notify,
            ..Default::default()
        })
    }
}

fn static_descriptor_read(value: Vec<u8>, encrypted: bool) -> DescriptorRead {
    DescriptorRead {
        read: true,
        encrypt_read: encrypted,
        fun: Box::new(move |req| {
            let offset = usize::from(req.offset);
            let value = value.get(offset..).map(<[u8]>::to_vec);
            async move { value.ok_or(ReqError::InvalidOffset) }.boxed()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl PeripheralBackend for BluerPeripheral {
    fn set_services(&mut self, tree: &AttributeTree) -> Result<()> {
        self.table = AttributeTable::sequential(tree);
        debug!("Attribute table holds {} attributes", self.table.len());
        Ok(())
    }

    fn attribute_table_mut(&mut self) -> &mut AttributeTable {
        &mut self.table
    }

    async fn start_advertising(&mut self, adv_data: &[u8], scan_data: Option<&[u8]>) -> Result<()> {
        let app = self.application()?;
        debug!("Registering GATT application with {} service(s)", app.services.len());
        self.app_handle = Some(self.adapter.serve_gatt_application(app).await?);

        let mut payloads = vec![adv_data];
        payloads.extend(scan_data);
        let content = AdContent::from_payloads(payloads);
        trace!("Advertisement content: {:?}", content);

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: content.service_uuids,
            service_data: content.service_data,
            manufacturer_data: content.manufacturer_data,
            local_name: content.local_name.clone(),
            discoverable: Some(true),
            ..Default::default()
        };
        self.adv_handle = Some(self.adapter.advertise(adv).await?);

        info!(
            "Emulated device advertising as {:?} on {}",
            content.local_name,
            self.adapter.name()
        );
        Ok(())
    }

    async fn notify(&self, service: &str, characteristic: &str, data: Vec<u8>) -> Result<bool> {
        let key = (service.to_string(), characteristic.to_string());
        let Some(sink) = self.state.notifier(&key) else {
            return Ok(false);
        };
        Ok(sink.send(data).await.is_ok())
    }

    async fn stop(&mut self) -> Result<()> {
        // Dropping the handles unregisters the advertisement and the application.
        self.adv_handle.take();
        self.app_handle.take();
        if let Ok(mut notifiers) = self.state.notifiers.lock() {
            notifiers.clear();
        }
        if let Ok(mut central) = self.state.central.lock() {
            *central = None;
        }
        info!("Emulated device stopped");
        Ok(())
    }
}
