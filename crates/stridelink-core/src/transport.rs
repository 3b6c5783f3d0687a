//! Platform transport seam.
//!
//! The session and coordinator never touch a concrete Bluetooth stack;
//! they talk to [`BleTransport`] and [`PeripheralLink`]. Requests return
//! as soon as they are submitted and completions arrive later as
//! [`LinkEvent`]s on the sink handed to [`BleTransport::connect`] — the
//! same shape as the platform GATT callbacks this crate abstracts over.
//! Events for one link are delivered in order and never concurrently.
//!
//! Two implementations ship with the crate: [`crate::fake::FakeTransport`]
//! for tests and simulation, and the btleplug-backed
//! [`crate::bluetooth::BtleplugTransport`] behind the `bluetooth` feature.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised device name. Advertisements without a name are never
    /// delivered; the coordinator matches on nothing else.
    pub name: String,
    /// Opaque platform handle identifying the peripheral. May go stale
    /// once the peripheral stops advertising.
    pub handle: String,
}

/// GATT layout reported by service discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattProfile {
    /// Discovered primary services.
    pub services: Vec<GattService>,
}

/// One discovered service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service identifier.
    pub uuid: Uuid,
    /// Characteristic identifiers under this service.
    pub characteristics: Vec<Uuid>,
}

impl GattProfile {
    /// Find a discovered service by identifier.
    #[must_use]
    pub fn service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// Whether `characteristic` exists under `service`.
    #[must_use]
    pub fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.service(service)
            .is_some_and(|s| s.characteristics.contains(&characteristic))
    }
}

/// Completion events for one peripheral link.
///
/// Delivered in submission order on the sink passed to
/// [`BleTransport::connect`]; after the link is closed any stragglers are
/// ignored by the session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The low-level connection is up.
    Connected,
    /// The MTU exchange settled. Carries the granted value, which may be
    /// less than requested; the handshake proceeds with it regardless.
    MtuChanged(u16),
    /// Service discovery finished.
    ServicesDiscovered(GattProfile),
    /// The notification subscription (CCCD write) took effect.
    SubscriptionActive,
    /// One notification payload from the subscribed characteristic.
    Notification(Vec<u8>),
    /// The link dropped, peer-initiated or otherwise.
    Disconnected(Option<String>),
}

/// Sink for link events, one per session.
pub type LinkEventSink = mpsc::Sender<LinkEvent>;

/// Receiving half used by the session driver task.
pub type LinkEventStream = mpsc::Receiver<LinkEvent>;

/// Buffer depth for link event channels. Large enough that a burst of
/// notifications never stalls a transport callback.
pub const LINK_EVENT_BUFFER: usize = 64;

/// A BLE central transport: scanning plus connection establishment.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Start scanning and return the advertisement stream. The stream ends
    /// when the scan is stopped.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    /// Stop the active scan. A no-op when no scan is running.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Begin connecting to an advertised peripheral.
    ///
    /// Fails fast when the handle is stale or unusable; otherwise returns
    /// the link immediately and reports [`LinkEvent::Connected`] (or
    /// [`LinkEvent::Disconnected`]) on `events` once the platform settles.
    async fn connect(
        &self,
        adv: &Advertisement,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeripheralLink>, TransportError>;
}

/// One physical connection, exclusively owned by its session.
///
/// All methods submit a request and return; the matching completion
/// arrives as a [`LinkEvent`].
#[async_trait]
pub trait PeripheralLink: Send {
    /// Request an MTU of `mtu` bytes. Completion: [`LinkEvent::MtuChanged`]
    /// with the granted value.
    async fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError>;

    /// Start GATT service discovery. Completion:
    /// [`LinkEvent::ServicesDiscovered`].
    async fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic` under `service` by writing
    /// the client-characteristic-configuration descriptor. Completion:
    /// [`LinkEvent::SubscriptionActive`], then a [`LinkEvent::Notification`]
    /// per inbound payload.
    async fn subscribe(&mut self, service: Uuid, characteristic: Uuid)
        -> Result<(), TransportError>;

    /// Write `payload` to `characteristic`. Best-effort delivery; no
    /// completion event is delivered beyond the submission result.
    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    /// Release the underlying connection. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::uuid;

    const SVC: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef0");
    const CHR: Uuid = uuid!("abcdef01-1234-5678-1234-56789abcdef0");

    #[test]
    fn profile_lookup() {
        let profile = GattProfile {
            services: vec![GattService {
                uuid: SVC,
                characteristics: vec![CHR],
            }],
        };
        assert!(profile.service(SVC).is_some());
        assert!(profile.has_characteristic(SVC, CHR));
        assert!(!profile.has_characteristic(SVC, Uuid::nil()));
        assert!(!profile.has_characteristic(Uuid::nil(), CHR));
    }
}
