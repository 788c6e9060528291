//! Mock capability backends shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use btlejuice_core::ble::{
    AttBearer, AttributeTable, CentralBackend, CentralEvent, CharacteristicInfo, DescriptorInfo,
    PeripheralBackend, PlatformBinding, ReportKind, ServiceInfo,
};
use btlejuice_core::gatt::{AttributeTree, Properties};
use btlejuice_core::{ProxyError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

pub const TARGET: &str = "54:4A:16:6D:3D:23";
pub const ADV_RECORDS: [u8; 3] = [0x02, 0x01, 0x06];
pub const SCAN_DATA: [u8; 6] = [0x05, 0x09, b'l', b'o', b'c', b'k'];

#[derive(Default)]
pub struct Calls {
    pub start_scanning: AtomicUsize,
    pub stop_scanning: AtomicUsize,
    pub connect: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub discover_services: AtomicUsize,
    pub discover_characteristics: AtomicUsize,
    pub discover_descriptors: AtomicUsize,
    pub restore_binding: AtomicUsize,
    pub subscribe: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Central that "sees" one device with a device information service and a vendor service.
pub struct MockCentral {
    pub calls: Calls,
    pub events: mpsc::Sender<CentralEvent>,
    pub fail_connect: AtomicBool,
    pub stall_discovery: AtomicBool,
    pub hold_reads: AtomicBool,
    pub fail_restore: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub read_gate: Notify,
    pub bearer: Arc<MockBearer>,
}

impl MockCentral {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<CentralEvent>) {
        let (events, rx) = mpsc::channel(32);
        let central = Arc::new(Self {
            calls: Calls::default(),
            events,
            fail_connect: AtomicBool::new(false),
            stall_discovery: AtomicBool::new(false),
            hold_reads: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            read_gate: Notify::new(),
            bearer: Arc::new(MockBearer::default()),
        });
        (central, rx)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CentralBackend for MockCentral {
    async fn start_scanning(&self) -> Result<()> {
        Self::bump(&self.calls.start_scanning);
        let _ = self.events.try_send(CentralEvent::Advertisement {
            address: TARGET.to_string(),
            name: Some("lock".to_string()),
            rssi: Some(-60),
            kind: ReportKind::Advertising,
            data: ADV_RECORDS.to_vec(),
        });
        let _ = self.events.try_send(CentralEvent::Advertisement {
            address: TARGET.to_string(),
            name: None,
            rssi: Some(-60),
            kind: ReportKind::ScanResponse,
            data: SCAN_DATA.to_vec(),
        });
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        Self::bump(&self.calls.stop_scanning);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        Self::bump(&self.calls.connect);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProxyError::Connect {
                address: address.to_string(),
                reason: "page timeout".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, _address: &str) -> Result<()> {
        Self::bump(&self.calls.disconnect);
        Ok(())
    }

    async fn discover_services(&self, _address: &str) -> Result<Vec<ServiceInfo>> {
        Self::bump(&self.calls.discover_services);
        if self.stall_discovery.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(vec![
            ServiceInfo {
                uuid: "180A".to_string(),
                start_handle: 1,
                end_handle: Some(3),
            },
            ServiceInfo {
                uuid: "FFF0".to_string(),
                start_handle: 4,
                end_handle: None,
            },
        ])
    }

    async fn discover_characteristics(
        &self,
        _address: &str,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>> {
        Self::bump(&self.calls.discover_characteristics);
        let found = match service {
            "180a" => vec![CharacteristicInfo {
                uuid: "2A29".to_string(),
                properties: Properties::from_bits(Properties::READ),
                secure: Properties::empty(),
                start_handle: 2,
                value_handle: 3,
                end_handle: Some(3),
            }],
            "fff0" => vec![CharacteristicInfo {
                uuid: "FFF1".to_string(),
                properties: Properties::from_bits(
                    Properties::READ | Properties::WRITE | Properties::NOTIFY,
                ),
                secure: Properties::empty(),
                start_handle: 5,
                value_handle: 6,
                end_handle: None,
            }],
            _ => vec![],
        };
        Ok(found)
    }

    async fn discover_descriptors(
        &self,
        _address: &str,
        _service: &str,
        characteristic: &str,
    ) -> Result<Vec<DescriptorInfo>> {
        Self::bump(&self.calls.discover_descriptors);
        let found = match characteristic {
            "fff1" => vec![
                DescriptorInfo {
                    uuid: "2902".to_string(),
                    handle: 7,
                },
                DescriptorInfo {
                    uuid: "2901".to_string(),
                    handle: 8,
                },
            ],
            _ => vec![],
        };
        Ok(found)
    }

    async fn read(
        &self,
        _address: &str,
        _service: &str,
        _characteristic: &str,
        _offset: u16,
    ) -> Result<Vec<u8>> {
        if self.hold_reads.load(Ordering::SeqCst) {
            self.read_gate.notified().await;
        }
        Ok(b"ACME".to_vec())
    }

    async fn subscribe(
        &self,
        _address: &str,
        _service: &str,
        _characteristic: &str,
        _enable: bool,
    ) -> Result<()> {
        Self::bump(&self.calls.subscribe);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ProxyError::Backend("CCCD write rejected".to_string()));
        }
        Ok(())
    }

    async fn att_bearer(&self, _address: &str) -> Result<Arc<dyn AttBearer>> {
        Ok(self.bearer.clone())
    }

    async fn export_binding(&self, address: &str) -> Result<PlatformBinding> {
        Ok(PlatformBinding::new(address.to_lowercase()))
    }

    async fn restore_binding(&self, address: &str, binding: &PlatformBinding) -> Result<()> {
        Self::bump(&self.calls.restore_binding);
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(ProxyError::Backend("object path vanished".to_string()));
        }
        match binding.downcast::<String>() {
            Some(bound) if *bound == address.to_lowercase() => Ok(()),
            _ => Err(ProxyError::ForeignBinding),
        }
    }
}

/// ATT bearer with a 23 byte MTU that accepts every write.
#[derive(Default)]
pub struct MockBearer {
    pub pdus: Mutex<Vec<Vec<u8>>>,
}

impl MockBearer {
    pub fn opcodes(&self) -> Vec<u8> {
        self.pdus.lock().unwrap().iter().map(|pdu| pdu[0]).collect()
    }
}

#[async_trait]
impl AttBearer for MockBearer {
    fn mtu(&self) -> u16 {
        23
    }

    async fn request(&self, pdu: Vec<u8>) -> Result<Vec<u8>> {
        self.pdus.lock().unwrap().push(pdu.clone());
        let response = match pdu[0] {
            0x12 => vec![0x13],
            0x16 => {
                let mut echo = pdu;
                echo[0] = 0x17;
                echo
            }
            0x18 => vec![0x19],
            op => vec![0x01, op, 0x00, 0x00, 0x06],
        };
        Ok(response)
    }

    async fn command(&self, pdu: Vec<u8>) -> Result<()> {
        self.pdus.lock().unwrap().push(pdu);
        Ok(())
    }
}

#[derive(Default)]
pub struct PeripheralLog {
    pub advertised: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub notified: Vec<(String, String, Vec<u8>)>,
    pub table: Option<AttributeTable>,
    pub stops: usize,
}

pub struct MockPeripheral {
    pub table: AttributeTable,
    pub log: Arc<Mutex<PeripheralLog>>,
    pub fail_services: bool,
}

impl MockPeripheral {
    pub fn new() -> (Self, Arc<Mutex<PeripheralLog>>) {
        let log = Arc::new(Mutex::new(PeripheralLog::default()));
        (
            Self {
                table: AttributeTable::default(),
                log: log.clone(),
                fail_services: false,
            },
            log,
        )
    }
}

#[async_trait]
impl PeripheralBackend for MockPeripheral {
    fn set_services(&mut self, tree: &AttributeTree) -> Result<()> {
        if self.fail_services {
            return Err(ProxyError::Backend("RegisterApplication failed".to_string()));
        }
        self.table = AttributeTable::sequential(tree);
        Ok(())
    }

    fn attribute_table_mut(&mut self) -> &mut AttributeTable {
        &mut self.table
    }

    async fn start_advertising(&mut self, adv_data: &[u8], scan_data: Option<&[u8]>) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.advertised
            .push((adv_data.to_vec(), scan_data.map(<[u8]>::to_vec)));
        log.table = Some(self.table.clone());
        Ok(())
    }

    async fn notify(&self, service: &str, characteristic: &str, data: Vec<u8>) -> Result<bool> {
        self.log.lock().unwrap().notified.push((
            service.to_string(),
            characteristic.to_string(),
            data,
        ));
        Ok(true)
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.lock().unwrap().stops += 1;
        Ok(())
    }
}
