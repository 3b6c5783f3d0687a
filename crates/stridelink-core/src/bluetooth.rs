//! btleplug-backed transport.
//!
//! Bridges the request/completion model of [`BleTransport`] onto
//! btleplug's cross-platform central API. Scanning polls the adapter's
//! peripheral table and forwards every named peripheral as an
//! [`Advertisement`]; the coordinator deduplicates by role, so repeated
//! delivery of the same peripheral is expected. btleplug negotiates the
//! ATT MTU internally with no client-side request API, so
//! [`PeripheralLink::request_mtu`] acknowledges immediately and the
//! handshake proceeds with whatever the platform settled on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    Advertisement, BleTransport, GattProfile, GattService, LinkEvent, LinkEventSink,
    PeripheralLink,
};

/// How often the scan task polls the adapter's peripheral table.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn map_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::PermissionDenied => {
            TransportError::PermissionDenied("bluetooth permission denied".into())
        }
        btleplug::Error::DeviceNotFound => TransportError::StaleAdvertisement,
        other => TransportError::Operation(other.to_string()),
    }
}

#[derive(Default)]
struct ScanState {
    scanning: bool,
    generation: u64,
    /// Peripherals seen by the current or a previous scan, keyed by the
    /// stringified platform id used as the advertisement handle.
    seen: HashMap<String, Peripheral>,
}

/// Cross-platform BLE central transport.
pub struct BtleplugTransport {
    adapter: Adapter,
    state: Arc<Mutex<ScanState>>,
}

impl BtleplugTransport {
    /// Open the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterNotFound`] when the platform exposes no
    /// adapter, or a platform error from the manager.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(map_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotFound)?;
        Ok(Self {
            adapter,
            state: Arc::new(Mutex::new(ScanState::default())),
        })
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|error| TransportError::ScanFailed(error.to_string()))?;

        let generation = {
            let mut state = self.state.lock().unwrap();
            state.scanning = true;
            state.generation += 1;
            state.generation
        };

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let shared = self.state.clone();
        tokio::spawn(async move {
            loop {
                {
                    let state = shared.lock().unwrap();
                    if !state.scanning || state.generation != generation {
                        break;
                    }
                }

                let peripherals = match adapter.peripherals().await {
                    Ok(peripherals) => peripherals,
                    Err(error) => {
                        warn!(%error, "peripheral poll failed, scan ends");
                        break;
                    }
                };
                for peripheral in peripherals {
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    // Nameless advertisements carry nothing to match on.
                    let Some(name) = properties.local_name else {
                        continue;
                    };
                    let handle = peripheral.id().to_string();
                    shared
                        .lock()
                        .unwrap()
                        .seen
                        .insert(handle.clone(), peripheral);
                    if tx.send(Advertisement { name, handle }).await.is_err() {
                        return;
                    }
                }

                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state.lock().unwrap().scanning = false;
        self.adapter.stop_scan().await.map_err(map_error)
    }

    async fn connect(
        &self,
        adv: &Advertisement,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeripheralLink>, TransportError> {
        let peripheral = self
            .state
            .lock()
            .unwrap()
            .seen
            .get(&adv.handle)
            .cloned()
            .ok_or(TransportError::StaleAdvertisement)?;

        if !peripheral.is_connected().await.map_err(map_error)? {
            peripheral
                .connect()
                .await
                .map_err(|error| TransportError::ConnectFailed(error.to_string()))?;
        }
        let _ = events.send(LinkEvent::Connected).await;

        Ok(Box::new(BtleplugLink {
            peripheral,
            events,
            notify_task: None,
            connected: true,
        }))
    }
}

struct BtleplugLink {
    peripheral: Peripheral,
    events: LinkEventSink,
    notify_task: Option<JoinHandle<()>>,
    connected: bool,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::Operation(format!("characteristic {uuid} not present")))
    }
}

#[async_trait]
impl PeripheralLink for BtleplugLink {
    async fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        // The platform exchanges the MTU on its own during connect; there
        // is no client-side request. Acknowledge so the handshake moves on.
        trace!(mtu, "mtu handled by platform, acknowledging");
        let _ = self.events.send(LinkEvent::MtuChanged(mtu)).await;
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<(), TransportError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(map_error)?;
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect();
        let _ = self
            .events
            .send(LinkEvent::ServicesDiscovered(GattProfile { services }))
            .await;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await.map_err(map_error)?;

        let mut notifications = self.peripheral.notifications().await.map_err(map_error)?;
        let events = self.events.clone();
        self.notify_task = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if events
                    .send(LinkEvent::Notification(notification.value))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Stream end means the platform dropped the connection.
            debug!("notification stream closed");
            let _ = events.send(LinkEvent::Disconnected(None)).await;
        }));

        let _ = self.events.send(LinkEvent::SubscriptionActive).await;
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(map_error)
    }

    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        match self.peripheral.is_connected().await {
            Ok(true) => {
                if let Err(error) = self.peripheral.disconnect().await {
                    debug!(%error, "disconnect failed during close");
                }
            }
            Ok(false) => {}
            Err(error) => debug!(%error, "connection check failed during close"),
        }
    }
}
