//! Relay engine scenarios against a mock central

mod common;

use btlejuice_core::ble::CentralEvent;
use btlejuice_core::proxy::{ClientRequest, ConnectionState, EngineCommand, ProxyEvent};
use btlejuice_core::{RelayConfig, RelayEngine};
use common::{ADV_RECORDS, Calls, MockCentral, SCAN_DATA, TARGET};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    central: Arc<MockCentral>,
    commands: mpsc::Sender<EngineCommand>,
    events: mpsc::Receiver<ProxyEvent>,
}

impl Harness {
    async fn start(config: RelayConfig) -> Self {
        let (central, central_events) = MockCentral::new();
        let engine = RelayEngine::new(central.clone(), config);
        let (commands, commands_rx) = mpsc::channel(16);
        tokio::spawn(engine.run(commands_rx, central_events));

        let (events_tx, events) = mpsc::channel(64);
        commands
            .send(EngineCommand::Attach {
                id: 1,
                events: events_tx,
            })
            .await
            .unwrap();

        let mut harness = Self {
            central,
            commands,
            events,
        };
        assert_eq!(harness.next().await, ProxyEvent::Hello);
        harness
    }

    async fn request(&self, request: ClientRequest) {
        self.commands
            .send(EngineCommand::Request(request))
            .await
            .unwrap();
    }

    async fn next(&mut self) -> ProxyEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("no event from the relay engine")
            .expect("relay engine dropped the client")
    }

    async fn target(&mut self) -> ProxyEvent {
        self.request(ClientRequest::Target {
            address: TARGET.to_string(),
            keep_handles: true,
        })
        .await;
        self.next().await
    }

    /// Targets the device and consumes `profile` + `ready(true)`.
    async fn forward(&mut self) {
        assert!(matches!(self.target().await, ProxyEvent::Profile { .. }));
        assert_eq!(self.next().await, ProxyEvent::Ready { ok: true });
    }

    async fn status(&mut self) -> ConnectionState {
        self.request(ClientRequest::Status).await;
        match self.next().await {
            ProxyEvent::Status { state } => state,
            other => panic!("expected status, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_first_target_discovers_and_emits_profile() {
    let mut harness = Harness::start(RelayConfig::default()).await;

    let ProxyEvent::Profile { profile } = harness.target().await else {
        panic!("expected a profile");
    };
    assert_eq!(harness.next().await, ProxyEvent::Ready { ok: true });

    assert_eq!(profile.address, "54:4a:16:6d:3d:23");
    assert_eq!(profile.ad_records, ADV_RECORDS.to_vec());
    assert_eq!(profile.scan_data, Some(SCAN_DATA.to_vec()));
    assert_eq!(profile.name.as_deref(), Some("lock"));

    let tree = &profile.attribute_tree;
    assert_eq!(tree.services().len(), 2);
    let vendor = tree.service("fff0").unwrap();
    assert_eq!(vendor.end_handle, 8);
    let characteristic = tree.characteristic("FFF0", "FFF1").unwrap();
    assert_eq!(characteristic.end_handle, 8);
    assert_eq!(characteristic.descriptor("2901").unwrap().value, Some(vec![]));
    assert_eq!(characteristic.descriptor("2902").unwrap().value, None);

    let calls = &harness.central.calls;
    assert_eq!(Calls::get(&calls.discover_services), 1);
    assert_eq!(Calls::get(&calls.discover_characteristics), 2);
    assert_eq!(Calls::get(&calls.discover_descriptors), 2);
    assert!(Calls::get(&calls.stop_scanning) >= 1);
    assert_eq!(harness.status().await, ConnectionState::Forwarding);
}

#[tokio::test]
async fn test_second_target_uses_session_cache() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    harness.forward().await;

    let calls = &harness.central.calls;
    assert_eq!(Calls::get(&calls.discover_services), 1);
    assert_eq!(Calls::get(&calls.discover_characteristics), 2);
    assert_eq!(Calls::get(&calls.discover_descriptors), 2);
    assert_eq!(Calls::get(&calls.restore_binding), 1);
    assert_eq!(Calls::get(&calls.start_scanning), 1);
    assert_eq!(Calls::get(&calls.connect), 2);
    // the first link is dropped before re-targeting
    assert_eq!(Calls::get(&calls.disconnect), 1);
    assert_eq!(harness.status().await, ConnectionState::Forwarding);
}

#[tokio::test]
async fn test_connect_failure_reports_not_ready() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.central.fail_connect.store(true, Ordering::SeqCst);

    assert_eq!(harness.target().await, ProxyEvent::Ready { ok: false });
    assert_eq!(harness.status().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_restore_does_not_strand_the_link() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;
    harness.central.fail_restore.store(true, Ordering::SeqCst);

    assert_eq!(harness.target().await, ProxyEvent::Ready { ok: false });
    assert_eq!(harness.status().await, ConnectionState::Disconnected);

    harness.request(ClientRequest::Stop).await;
    assert_eq!(harness.next().await, ProxyEvent::Stopped);
    assert_eq!(harness.status().await, ConnectionState::Disconnected);

    let calls = &harness.central.calls;
    assert_eq!(Calls::get(&calls.restore_binding), 1);
    assert_eq!(Calls::get(&calls.connect), 2);
    assert_eq!(Calls::get(&calls.disconnect), 2);
}

#[tokio::test]
async fn test_stop_twice_emits_single_stopped() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    harness.request(ClientRequest::Stop).await;
    harness.request(ClientRequest::Stop).await;

    assert_eq!(harness.next().await, ProxyEvent::Stopped);
    assert_eq!(harness.status().await, ConnectionState::Disconnected);
    assert_eq!(Calls::get(&harness.central.calls.disconnect), 1);
}

#[tokio::test]
async fn test_discovery_watchdog_stops_session() {
    let mut harness = Harness::start(RelayConfig {
        discovery_timeout: Duration::from_millis(100),
    })
    .await;
    harness.central.stall_discovery.store(true, Ordering::SeqCst);

    assert_eq!(harness.target().await, ProxyEvent::Stopped);
    assert_eq!(
        harness.next().await,
        ProxyEvent::Status {
            state: ConnectionState::Disconnected
        }
    );
    assert_eq!(Calls::get(&harness.central.calls.disconnect), 1);
}

#[tokio::test]
async fn test_operations_rejected_unless_forwarding() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness
        .request(ClientRequest::BleRead {
            service: "180a".to_string(),
            characteristic: "2a29".to_string(),
            offset: 0,
        })
        .await;

    match harness.next().await {
        ProxyEvent::BleReadResp { data, error, .. } => {
            assert!(data.is_empty());
            assert!(error.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_read_is_rejected_as_busy() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;
    harness.central.hold_reads.store(true, Ordering::SeqCst);

    for _ in 0..2 {
        harness
            .request(ClientRequest::BleRead {
                service: "180A".to_string(),
                characteristic: "2A29".to_string(),
                offset: 0,
            })
            .await;
    }

    match harness.next().await {
        ProxyEvent::BleReadResp { error, .. } => {
            assert!(error.unwrap().contains("already pending"));
        }
        other => panic!("unexpected {other:?}"),
    }

    harness.central.read_gate.notify_one();
    assert_eq!(
        harness.next().await,
        ProxyEvent::BleReadResp {
            service: "180a".to_string(),
            characteristic: "2a29".to_string(),
            data: b"ACME".to_vec(),
            error: None,
        }
    );
}

#[tokio::test]
async fn test_long_write_goes_through_prepared_writes() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    harness
        .request(ClientRequest::BleWrite {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            data: (0..40).collect(),
            without_response: false,
        })
        .await;

    assert_eq!(
        harness.next().await,
        ProxyEvent::BleWriteResp {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            error: None,
        }
    );
    assert_eq!(harness.central.bearer.opcodes(), vec![0x16, 0x16, 0x16, 0x18]);
}

#[tokio::test]
async fn test_notifications_relayed_only_when_subscribed() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    // never subscribed, must not surface
    harness
        .central
        .events
        .send(CentralEvent::Notification {
            address: TARGET.to_string(),
            service: "180a".to_string(),
            characteristic: "2a29".to_string(),
            data: vec![0xee],
        })
        .await
        .unwrap();

    harness
        .request(ClientRequest::BleNotify {
            service: "FFF0".to_string(),
            characteristic: "FFF1".to_string(),
            enable: true,
        })
        .await;
    assert_eq!(
        harness.next().await,
        ProxyEvent::BleNotifyResp {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            error: None,
        }
    );

    harness
        .central
        .events
        .send(CentralEvent::Notification {
            address: TARGET.to_string(),
            service: "FFF0".to_string(),
            characteristic: "FFF1".to_string(),
            data: vec![0x42],
        })
        .await
        .unwrap();
    assert_eq!(
        harness.next().await,
        ProxyEvent::BleData {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            data: vec![0x42],
        }
    );
}

#[tokio::test]
async fn test_remote_disconnect_is_reported() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    harness
        .central
        .events
        .send(CentralEvent::Disconnected {
            address: TARGET.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        harness.next().await,
        ProxyEvent::DeviceDisconnect {
            address: "54:4a:16:6d:3d:23".to_string()
        }
    );
    assert_eq!(
        harness.next().await,
        ProxyEvent::Status {
            state: ConnectionState::Disconnected
        }
    );
}

#[tokio::test]
async fn test_scan_reports_devices() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.request(ClientRequest::ScanDevices).await;

    assert_eq!(
        harness.next().await,
        ProxyEvent::Discover {
            address: "54:4a:16:6d:3d:23".to_string(),
            name: Some("lock".to_string()),
            rssi: Some(-60),
        }
    );
    assert_eq!(harness.status().await, ConnectionState::Scanning);
}

#[tokio::test]
async fn test_new_client_replaces_old_one() {
    let mut harness = Harness::start(RelayConfig::default()).await;

    let (events_tx, mut second) = mpsc::channel(16);
    harness
        .commands
        .send(EngineCommand::Attach {
            id: 2,
            events: events_tx,
        })
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, second.recv()).await.unwrap(),
        Some(ProxyEvent::Hello)
    );
    assert_eq!(timeout(WAIT, harness.events.recv()).await.unwrap(), None);

    // a late detach from the replaced client leaves the new one attached
    harness
        .commands
        .send(EngineCommand::Detach { id: 1 })
        .await
        .unwrap();
    harness.request(ClientRequest::Status).await;
    assert_eq!(
        timeout(WAIT, second.recv()).await.unwrap(),
        Some(ProxyEvent::Status {
            state: ConnectionState::Disconnected
        })
    );
}

#[tokio::test]
async fn test_failed_subscription_relays_nothing() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;
    harness.central.fail_subscribe.store(true, Ordering::SeqCst);

    harness
        .request(ClientRequest::BleNotify {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            enable: true,
        })
        .await;
    match harness.next().await {
        ProxyEvent::BleNotifyResp { error, .. } => assert!(error.is_some()),
        other => panic!("unexpected {other:?}"),
    }

    harness
        .central
        .events
        .send(CentralEvent::Notification {
            address: TARGET.to_string(),
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            data: vec![0x42],
        })
        .await
        .unwrap();
    // let the engine drain the notification before the status request overtakes it
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.status().await, ConnectionState::Forwarding);
}

#[tokio::test]
async fn test_failed_unsubscription_keeps_relaying() {
    let mut harness = Harness::start(RelayConfig::default()).await;
    harness.forward().await;

    let subscribe = |enable| ClientRequest::BleNotify {
        service: "fff0".to_string(),
        characteristic: "fff1".to_string(),
        enable,
    };
    harness.request(subscribe(true)).await;
    assert!(matches!(
        harness.next().await,
        ProxyEvent::BleNotifyResp { error: None, .. }
    ));

    harness.central.fail_subscribe.store(true, Ordering::SeqCst);
    harness.request(subscribe(false)).await;
    assert!(matches!(
        harness.next().await,
        ProxyEvent::BleNotifyResp { error: Some(_), .. }
    ));

    harness
        .central
        .events
        .send(CentralEvent::Notification {
            address: TARGET.to_string(),
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            data: vec![0x42],
        })
        .await
        .unwrap();
    assert_eq!(
        harness.next().await,
        ProxyEvent::BleData {
            service: "fff0".to_string(),
            characteristic: "fff1".to_string(),
            data: vec![0x42],
        }
    );
}
