//! Attribute discovery against the real device
//!
//! Services are enumerated first; characteristic discovery then fans out to every
//! service at once, and descriptor discovery to every characteristic as soon as its
//! service reports in. A [`DiscoveryTracker`] joins the fan-out and is rechecked after
//! every single result.

use log::{debug, error, info};

use crate::ble::{CentralBackend, CharacteristicInfo, DescriptorInfo, ServiceInfo};
use crate::error::{ProxyError, Result};
use crate::gatt::{
    AttributeTree, Characteristic, Descriptor, Handle, Service, USER_DESCRIPTION_UUID, normalize,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// AND-join over a dynamically sized discovery fan-out.
///
/// Completion latches: once every service and characteristic has reported, later calls
/// cannot make the session incomplete again.
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    services: BTreeMap<String, bool>,
    characteristics: BTreeMap<(String, String), bool>,
    services_known: bool,
    complete: bool,
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the services found on the device; none of them is done yet.
    pub fn expect_services<'a>(&mut self, uuids: impl IntoIterator<Item = &'a str>) {
        if self.complete {
            return;
        }
        for uuid in uuids {
            self.services.entry(uuid.to_string()).or_insert(false);
        }
        self.services_known = true;
        self.recheck();
    }

    /// Marks `service` done and registers its characteristics as pending.
    pub fn service_discovered<'a>(
        &mut self,
        service: &str,
        characteristics: impl IntoIterator<Item = &'a str>,
    ) {
        if self.complete {
            return;
        }
        for characteristic in characteristics {
            self.characteristics
                .entry((service.to_string(), characteristic.to_string()))
                .or_insert(false);
        }
        self.services.insert(service.to_string(), true);
        self.recheck();
    }

    pub fn characteristic_discovered(&mut self, service: &str, characteristic: &str) {
        if self.complete {
            return;
        }
        if let Some(done) = self
            .characteristics
            .get_mut(&(service.to_string(), characteristic.to_string()))
        {
            *done = true;
        }
        self.recheck();
    }

    pub fn is_all_discovered(&self) -> bool {
        self.complete
    }

    fn recheck(&mut self) {
        self.complete = self.services_known
            && self.services.values().all(|done| *done)
            && self.characteristics.values().all(|done| *done);
    }
}

type Branch = Pin<Box<dyn Future<Output = Step> + Send>>;

enum Step {
    Characteristics {
        service: String,
        result: Result<Vec<CharacteristicInfo>>,
    },
    Descriptors {
        service: String,
        characteristic: String,
        result: Result<Vec<DescriptorInfo>>,
    },
}

/// One run of recursive discovery for a connected device.
pub struct DiscoverySession {
    central: Arc<dyn CentralBackend>,
    address: String,
    tracker: DiscoveryTracker,
}

impl DiscoverySession {
    pub fn new(central: Arc<dyn CentralBackend>, address: &str) -> Self {
        Self {
            central,
            address: address.to_string(),
            tracker: DiscoveryTracker::new(),
        }
    }

    /// Discovers the whole attribute tree.
    ///
    /// A failing branch is logged and left incomplete, in which case this future never
    /// resolves and the caller's watchdog decides.
    pub async fn run(mut self) -> Result<AttributeTree> {
        info!("Discovering services and characteristics of {}", self.address);

        let services = self
            .central
            .discover_services(&self.address)
            .await
            .map_err(|e| ProxyError::Discovery {
                target: self.address.clone(),
                reason: e.to_string(),
            })?;
        let services: Vec<ServiceInfo> = services
            .into_iter()
            .map(|s| ServiceInfo {
                uuid: normalize(&s.uuid),
                ..s
            })
            .collect();
        self.tracker
            .expect_services(services.iter().map(|s| s.uuid.as_str()));

        let mut characteristics: BTreeMap<String, Vec<CharacteristicInfo>> = BTreeMap::new();
        let mut descriptors: BTreeMap<(String, String), Vec<DescriptorInfo>> = BTreeMap::new();

        let mut pending: FuturesUnordered<Branch> = services
            .iter()
            .map(|service| self.characteristics_branch(&service.uuid))
            .collect();

        while !self.tracker.is_all_discovered() {
            let Some(step) = pending.next().await else {
                error!(
                    "Discovery of {} is incomplete, waiting for the watchdog",
                    self.address
                );
                return std::future::pending().await;
            };

            match step {
                Step::Characteristics { service, result } => match result {
                    Ok(found) => {
                        let found: Vec<CharacteristicInfo> = found
                            .into_iter()
                            .map(|c| CharacteristicInfo {
                                uuid: normalize(&c.uuid),
                                ..c
                            })
                            .collect();
                        debug!("Service {}: {} characteristic(s)", service, found.len());
                        for characteristic in &found {
                            pending.push(self.descriptors_branch(&service, &characteristic.uuid));
                        }
                        self.tracker
                            .service_discovered(&service, found.iter().map(|c| c.uuid.as_str()));
                        characteristics.insert(service, found);
                    }
                    Err(e) => error!("Cannot discover service {}: {}", service, e),
                },
                Step::Descriptors {
                    service,
                    characteristic,
                    result,
                } => match result {
                    Ok(found) => {
                        self.tracker
                            .characteristic_discovered(&service, &characteristic);
                        descriptors.insert((service, characteristic), found);
                    }
                    Err(e) => error!(
                        "Cannot discover descriptors of {} {}: {}",
                        service, characteristic, e
                    ),
                },
            }
        }

        let tree = assemble(&services, &mut characteristics, &mut descriptors)?;
        info!(
            "Discovered {} service(s) on {}",
            tree.services().len(),
            self.address
        );
        Ok(tree)
    }

    fn characteristics_branch(&self, service: &str) -> Branch {
        let central = self.central.clone();
        let address = self.address.clone();
        let service = service.to_string();
        Box::pin(async move {
            let result = central.discover_characteristics(&address, &service).await;
            Step::Characteristics { service, result }
        })
    }

    fn descriptors_branch(&self, service: &str, characteristic: &str) -> Branch {
        let central = self.central.clone();
        let address = self.address.clone();
        let service = service.to_string();
        let characteristic = characteristic.to_string();
        Box::pin(async move {
            let result = central
                .discover_descriptors(&address, &service, &characteristic)
                .await;
            Step::Descriptors {
                service,
                characteristic,
                result,
            }
        })
    }
}

/// Builds the frozen tree. Missing end handles become the last handle of the range.
fn assemble(
    services: &[ServiceInfo],
    characteristics: &mut BTreeMap<String, Vec<CharacteristicInfo>>,
    descriptors: &mut BTreeMap<(String, String), Vec<DescriptorInfo>>,
) -> Result<AttributeTree> {
    let mut tree = Vec::with_capacity(services.len());

    for info in services {
        let mut chars = characteristics.remove(&info.uuid).unwrap_or_default();
        chars.sort_by_key(|c| c.start_handle);

        let mut built = Vec::with_capacity(chars.len());
        for c in chars {
            let mut descs = descriptors
                .remove(&(info.uuid.clone(), c.uuid.clone()))
                .unwrap_or_default();
            descs.sort_by_key(|d| d.handle);

            let last: Handle = descs.last().map_or(c.value_handle, |d| d.handle);
            built.push(Characteristic {
                uuid: c.uuid,
                properties: c.properties,
                secure: c.secure,
                descriptors: descs
                    .into_iter()
                    .map(|d| {
                        let uuid = normalize(&d.uuid);
                        let value = (uuid == USER_DESCRIPTION_UUID).then(Vec::new);
                        Descriptor {
                            uuid,
                            handle: d.handle,
                            value,
                        }
                    })
                    .collect(),
                start_handle: c.start_handle,
                value_handle: c.value_handle,
                end_handle: c.end_handle.unwrap_or(last).max(last),
            });
        }

        let last = built.last().map_or(info.start_handle, |c| c.end_handle);
        tree.push(Service {
            uuid: info.uuid.clone(),
            start_handle: info.start_handle,
            end_handle: info.end_handle.unwrap_or(last).max(last),
            characteristics: built,
        });
    }

    tree.sort_by_key(|s| s.start_handle);
    AttributeTree::new(tree)
}
