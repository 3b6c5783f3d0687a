//! Simulated BLE transport for tests and the CLI's `--simulate` mode.
//!
//! Peripherals are scripted up front: name, GATT layout, granted MTU,
//! whether they advertise, whether they refuse connects, and any
//! notifications to deliver right after subscription. The transport
//! records every characteristic write and counts scan starts so tests can
//! assert on retry policy and command traffic, and it allows runtime
//! notification injection and forced disconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    Advertisement, BleTransport, GattProfile, GattService, LinkEvent, LinkEventSink,
    PeripheralLink,
};

/// How often the fake scanner re-delivers each advertising peripheral.
/// Short enough that sequential-mode tests see a fresh advertisement soon
/// after the left role becomes ready.
const ADVERTISING_INTERVAL: Duration = Duration::from_millis(10);

/// Script for one simulated peripheral.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    /// Advertised name.
    pub name: String,
    /// GATT layout reported by discovery.
    pub profile: GattProfile,
    /// MTU granted regardless of the requested value.
    pub granted_mtu: u16,
    /// Whether the peripheral shows up in scans.
    pub advertising: bool,
    /// Refuse connect requests outright.
    pub refuse_connect: bool,
    /// Payloads delivered immediately after the subscription activates.
    pub queued_notifications: Vec<Vec<u8>>,
}

impl FakePeripheral {
    /// A peripheral exposing exactly one service with the given
    /// characteristics.
    #[must_use]
    pub fn new(name: &str, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            name: name.to_owned(),
            profile: GattProfile {
                services: vec![GattService {
                    uuid: service,
                    characteristics,
                }],
            },
            granted_mtu: 247,
            advertising: true,
            refuse_connect: false,
            queued_notifications: Vec::new(),
        }
    }

    /// A peripheral matching a configured identity exactly.
    #[must_use]
    pub fn matching(identity: &crate::config::DeviceIdentity) -> Self {
        let mut characteristics = vec![identity.notify];
        if let Some(write) = identity.write {
            characteristics.push(write);
        }
        Self::new(&identity.name, identity.service, characteristics)
    }
}

/// One recorded characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Peripheral the write went to.
    pub peripheral: String,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    peripherals: HashMap<String, FakePeripheral>,
    /// Event sinks of currently connected links, by peripheral name.
    connections: HashMap<String, ConnectionEntry>,
    writes: Vec<WriteRecord>,
    scan_starts: usize,
    scanning: bool,
    scan_generation: u64,
}

struct ConnectionEntry {
    events: LinkEventSink,
    subscribed: bool,
}

/// Scripted in-memory [`BleTransport`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<Inner>>,
}

impl FakeTransport {
    /// Empty transport with no peripherals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a scripted peripheral.
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        let mut inner = self.inner.lock().unwrap();
        inner.peripherals.insert(peripheral.name.clone(), peripheral);
    }

    /// Toggle whether a peripheral shows up in scans.
    pub fn set_advertising(&self, name: &str, advertising: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.peripherals.get_mut(name) {
            p.advertising = advertising;
        }
    }

    /// Number of times a scan was started.
    #[must_use]
    pub fn scan_start_count(&self) -> usize {
        self.inner.lock().unwrap().scan_starts
    }

    /// All recorded writes, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Payloads written to one peripheral, in order.
    #[must_use]
    pub fn writes_for(&self, name: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.peripheral == name)
            .map(|w| w.payload.clone())
            .collect()
    }

    /// Deliver a notification to a connected, subscribed link.
    pub async fn push_notification(&self, name: &str, payload: &[u8]) {
        let sink = {
            let inner = self.inner.lock().unwrap();
            inner
                .connections
                .get(name)
                .filter(|c| c.subscribed)
                .map(|c| c.events.clone())
        };
        if let Some(sink) = sink {
            let _ = sink.send(LinkEvent::Notification(payload.to_vec())).await;
        }
    }

    /// Drop the link to a peripheral, as if the peer disconnected.
    pub async fn drop_connection(&self, name: &str, reason: &str) {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            inner.connections.remove(name).map(|c| c.events)
        };
        if let Some(sink) = sink {
            let _ = sink
                .send(LinkEvent::Disconnected(Some(reason.to_owned())))
                .await;
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.scan_starts += 1;
            inner.scanning = true;
            inner.scan_generation += 1;
            inner.scan_generation
        };

        let (tx, rx) = mpsc::channel(32);
        let shared = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let advertisements: Vec<Advertisement> = {
                    let inner = shared.lock().unwrap();
                    if !inner.scanning || inner.scan_generation != generation {
                        break;
                    }
                    inner
                        .peripherals
                        .values()
                        .filter(|p| p.advertising)
                        .map(|p| Advertisement {
                            name: p.name.clone(),
                            handle: p.name.clone(),
                        })
                        .collect()
                };
                for adv in advertisements {
                    if tx.send(adv).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(ADVERTISING_INTERVAL).await;
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().scanning = false;
        Ok(())
    }

    async fn connect(
        &self,
        adv: &Advertisement,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeripheralLink>, TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(peripheral) = inner.peripherals.get(&adv.handle) else {
                return Err(TransportError::StaleAdvertisement);
            };
            if peripheral.refuse_connect {
                return Err(TransportError::ConnectFailed(format!(
                    "{} refused the connection",
                    adv.name
                )));
            }
            inner.connections.insert(
                adv.handle.clone(),
                ConnectionEntry {
                    events: events.clone(),
                    subscribed: false,
                },
            );
        }

        let _ = events.send(LinkEvent::Connected).await;
        Ok(Box::new(FakeLink {
            name: adv.handle.clone(),
            inner: self.inner.clone(),
            events,
            connected: true,
        }))
    }
}

struct FakeLink {
    name: String,
    inner: Arc<Mutex<Inner>>,
    events: LinkEventSink,
    connected: bool,
}

impl FakeLink {
    fn peripheral(&self) -> Result<FakePeripheral, TransportError> {
        if !self.connected {
            return Err(TransportError::Operation("link is closed".into()));
        }
        self.inner
            .lock()
            .unwrap()
            .peripherals
            .get(&self.name)
            .cloned()
            .ok_or(TransportError::StaleAdvertisement)
    }
}

#[async_trait]
impl PeripheralLink for FakeLink {
    async fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        let granted = self.peripheral()?.granted_mtu.min(mtu);
        let _ = self.events.send(LinkEvent::MtuChanged(granted)).await;
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<(), TransportError> {
        let profile = self.peripheral()?.profile;
        let _ = self
            .events
            .send(LinkEvent::ServicesDiscovered(profile))
            .await;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        if !peripheral.profile.has_characteristic(service, characteristic) {
            return Err(TransportError::Operation(format!(
                "characteristic {characteristic} not present"
            )));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.connections.get_mut(&self.name) {
                entry.subscribed = true;
            }
        }
        let _ = self.events.send(LinkEvent::SubscriptionActive).await;
        for payload in peripheral.queued_notifications {
            let _ = self.events.send(LinkEvent::Notification(payload)).await;
        }
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Operation("link is closed".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push(WriteRecord {
            peripheral: self.name.clone(),
            characteristic,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.inner.lock().unwrap().connections.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::uuid;

    const SVC: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef0");
    const NOTIFY: Uuid = uuid!("abcdef01-1234-5678-1234-56789abcdef0");

    #[tokio::test]
    async fn scan_delivers_advertising_peripherals_repeatedly() {
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::new("shoe", SVC, vec![NOTIFY]));

        let mut scan = transport.start_scan().await.unwrap();
        let first = scan.recv().await.unwrap();
        let second = scan.recv().await.unwrap();
        assert_eq!(first.name, "shoe");
        assert_eq!(second.name, "shoe");
        assert_eq!(transport.scan_start_count(), 1);

        transport.stop_scan().await.unwrap();
    }

    #[tokio::test]
    async fn hidden_peripherals_are_not_advertised() {
        let transport = FakeTransport::new();
        let mut peripheral = FakePeripheral::new("shoe", SVC, vec![NOTIFY]);
        peripheral.advertising = false;
        transport.add_peripheral(peripheral);

        let mut scan = transport.start_scan().await.unwrap();
        let adv =
            tokio::time::timeout(Duration::from_millis(50), scan.recv()).await;
        assert!(adv.is_err(), "hidden peripheral must not advertise");
        transport.stop_scan().await.unwrap();
    }

    #[tokio::test]
    async fn connect_walks_the_scripted_handshake() {
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::new("shoe", SVC, vec![NOTIFY]));

        let (tx, mut rx) = mpsc::channel(64);
        let adv = Advertisement {
            name: "shoe".into(),
            handle: "shoe".into(),
        };
        let mut link = transport.connect(&adv, tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Connected)));

        link.request_mtu(256).await.unwrap();
        match rx.recv().await {
            Some(LinkEvent::MtuChanged(granted)) => assert_eq!(granted, 247),
            other => panic!("expected MTU event, got {other:?}"),
        }

        link.discover_services().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::ServicesDiscovered(_))
        ));

        link.subscribe(SVC, NOTIFY).await.unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::SubscriptionActive)));

        transport.push_notification("shoe", b"{\"roll\":1.0}").await;
        assert!(matches!(rx.recv().await, Some(LinkEvent::Notification(_))));

        link.close().await;
        transport.push_notification("shoe", b"{}").await;
        assert!(rx.try_recv().is_err(), "closed link receives nothing");
    }

    #[tokio::test]
    async fn refused_connects_fail_fast() {
        let transport = FakeTransport::new();
        let mut peripheral = FakePeripheral::new("shoe", SVC, vec![NOTIFY]);
        peripheral.refuse_connect = true;
        transport.add_peripheral(peripheral);

        let (tx, _rx) = mpsc::channel(64);
        let adv = Advertisement {
            name: "shoe".into(),
            handle: "shoe".into(),
        };
        assert!(transport.connect(&adv, tx).await.is_err());
    }

    #[tokio::test]
    async fn unknown_handles_are_stale() {
        let transport = FakeTransport::new();
        let (tx, _rx) = mpsc::channel(64);
        let adv = Advertisement {
            name: "ghost".into(),
            handle: "ghost".into(),
        };
        assert!(matches!(
            transport.connect(&adv, tx).await,
            Err(TransportError::StaleAdvertisement)
        ));
    }
}
