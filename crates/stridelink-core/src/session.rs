//! Peripheral session: one physical connection's lifecycle.
//!
//! A [`PeripheralSession`] is an explicit state machine driven by
//! [`LinkEvent`]s. The handshake is strictly ordered — connect, MTU
//! exchange, service discovery, notification subscription, optional start
//! command — and each step's completion event triggers the next request.
//! Session-local failures (missing service, dropped link) are absorbed
//! into a state transition plus an error value and reported upward as
//! [`SessionNotice`]s; they are never thrown past the session boundary.

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::DeviceIdentity;
use crate::decode;
use crate::error::{SessionError, TransportError};
use crate::transport::{
    Advertisement, BleTransport, LinkEvent, LinkEventStream, PeripheralLink, LINK_EVENT_BUFFER,
};
use crate::types::{ConnectionState, Role, SensorFrame};

/// Command written once the handshake completes, when a write channel
/// exists.
pub const START_COMMAND: &[u8] = b"start";
/// Best-effort command written during a graceful close.
pub const STOP_COMMAND: &[u8] = b"stop";
/// Repeating poll command issued by the command pump.
pub const MEASURE_COMMAND: &[u8] = b"measure";
/// Re-zeroes the firmware's angle integrators.
pub const RESET_COMMAND: &[u8] = b"reset";

/// Events a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// The connection state advanced or fell back.
    StateChanged {
        /// Session role.
        role: Role,
        /// New state.
        state: ConnectionState,
    },
    /// A notification decoded into at least a partial frame.
    Frame {
        /// Session role.
        role: Role,
        /// Decoded fields; absent fields are `None`.
        frame: SensorFrame,
    },
    /// A role-level failure. The session has already released its link;
    /// recovery (a rescan) is the coordinator's call.
    Failed {
        /// Session role.
        role: Role,
        /// What went wrong.
        error: SessionError,
    },
}

/// Commands the coordinator (or the command pump) sends to a session's
/// driver task.
#[derive(Debug, Clone)]
pub(crate) enum SessionCommand {
    /// Write a command payload; rejected outside `Ready`.
    Send(Vec<u8>),
    /// Graceful close.
    Close,
}

/// State machine for one peripheral connection.
pub struct PeripheralSession {
    role: Role,
    identity: DeviceIdentity,
    mtu_target: u16,
    state: ConnectionState,
    link: Box<dyn PeripheralLink>,
    /// Write characteristic, present once discovery located it.
    write_char: Option<Uuid>,
    closed: bool,
    decode_failures: u64,
    last_error: Option<SessionError>,
    notices: mpsc::Sender<SessionNotice>,
}

impl PeripheralSession {
    /// Begin connecting to a matched advertisement.
    ///
    /// Returns the session in `Connecting` together with the link event
    /// stream the caller must drive into [`Self::handle_event`].
    ///
    /// # Errors
    ///
    /// Fails fast when the advertisement handle is stale or the platform
    /// rejects the connect outright; no session exists in that case.
    pub async fn open(
        role: Role,
        identity: DeviceIdentity,
        mtu_target: u16,
        adv: &Advertisement,
        transport: &dyn BleTransport,
        notices: mpsc::Sender<SessionNotice>,
    ) -> Result<(Self, LinkEventStream), SessionError> {
        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let link = transport.connect(adv, event_tx).await?;

        let mut session = Self {
            role,
            identity,
            mtu_target,
            state: ConnectionState::Disconnected,
            link,
            write_char: None,
            closed: false,
            decode_failures: 0,
            last_error: None,
            notices,
        };
        session.transition(ConnectionState::Connecting).await;
        Ok((session, event_rx))
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Last session-local error, if any.
    #[must_use]
    pub const fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Notifications dropped because their payload did not parse.
    #[must_use]
    pub const fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    /// Feed one link event into the state machine.
    ///
    /// Events arriving after [`Self::close`] are ignored; events that do
    /// not fit the current state are dropped with a trace log.
    pub async fn handle_event(&mut self, event: LinkEvent) {
        if self.closed {
            trace!(role = %self.role, "link event after close ignored");
            return;
        }

        match (self.state, event) {
            (ConnectionState::Connecting, LinkEvent::Connected) => {
                self.transition(ConnectionState::MtuNegotiating).await;
                if let Err(error) = self.link.request_mtu(self.mtu_target).await {
                    self.fail(error.into()).await;
                }
            }
            (ConnectionState::MtuNegotiating, LinkEvent::MtuChanged(granted)) => {
                // A grant below the target is accepted; the decoder already
                // tolerates truncated payloads.
                if granted < self.mtu_target {
                    debug!(role = %self.role, granted, target = self.mtu_target, "partial MTU grant");
                }
                self.transition(ConnectionState::DiscoveringServices).await;
                if let Err(error) = self.link.discover_services().await {
                    self.fail(error.into()).await;
                }
            }
            (ConnectionState::DiscoveringServices, LinkEvent::ServicesDiscovered(profile)) => {
                let service = self.identity.service;
                if profile.service(service).is_none() {
                    self.fail(SessionError::ServiceNotFound(service)).await;
                    return;
                }
                let notify = self.identity.notify;
                if !profile.has_characteristic(service, notify) {
                    self.fail(SessionError::CharacteristicNotFound(notify)).await;
                    return;
                }
                // The write channel is optional: absence only means the
                // role cannot receive commands.
                self.write_char = match self.identity.write {
                    Some(write) if profile.has_characteristic(service, write) => Some(write),
                    Some(write) => {
                        warn!(role = %self.role, %write, "declared write characteristic not found");
                        None
                    }
                    None => None,
                };
                self.transition(ConnectionState::Subscribing).await;
                if let Err(error) = self.link.subscribe(service, notify).await {
                    self.fail(error.into()).await;
                }
            }
            (ConnectionState::Subscribing, LinkEvent::SubscriptionActive) => {
                self.transition(ConnectionState::Ready).await;
                if self.write_char.is_some() {
                    if let Err(error) = self.write_command(START_COMMAND).await {
                        warn!(role = %self.role, %error, "start command write failed");
                    }
                }
            }
            (
                ConnectionState::Subscribing | ConnectionState::Ready,
                LinkEvent::Notification(payload),
            ) => {
                self.handle_notification(&payload).await;
            }
            (_, LinkEvent::Disconnected(reason)) => {
                debug!(role = %self.role, ?reason, "link disconnected");
                self.link.close().await;
                if let Some(reason) = reason {
                    let error = SessionError::Transport(TransportError::Operation(reason));
                    self.last_error = Some(error.clone());
                    let _ = self
                        .notices
                        .send(SessionNotice::Failed {
                            role: self.role,
                            error,
                        })
                        .await;
                }
                self.transition(ConnectionState::Disconnected).await;
            }
            (state, event) => {
                trace!(role = %self.role, %state, ?event, "link event ignored in this state");
            }
        }
    }

    /// Write a command payload. Legal only at `Ready`.
    ///
    /// Delivery is best-effort; the platform write callback is not awaited
    /// beyond submission.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] after close, [`SessionError::NotReady`]
    /// outside `Ready`, [`SessionError::NoWriteChannel`] when the role has
    /// no command characteristic.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.state.is_ready() {
            return Err(SessionError::NotReady(self.state));
        }
        self.write_command(payload).await
    }

    /// Gracefully close the session. Idempotent and safe in any state.
    ///
    /// Sends a best-effort stop command when a write channel exists, then
    /// always releases the connection handle.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Best-effort stop; the peripheral may already be gone.
        if self.state.is_ready() && self.write_char.is_some() {
            if let Err(error) = self.write_command(STOP_COMMAND).await {
                debug!(role = %self.role, %error, "stop command write failed");
            }
        }

        self.state = ConnectionState::Disconnecting;
        let _ = self
            .notices
            .send(SessionNotice::StateChanged {
                role: self.role,
                state: ConnectionState::Disconnecting,
            })
            .await;

        self.link.close().await;

        self.state = ConnectionState::Disconnected;
        let _ = self
            .notices
            .send(SessionNotice::StateChanged {
                role: self.role,
                state: ConnectionState::Disconnected,
            })
            .await;
    }

    async fn handle_notification(&mut self, payload: &[u8]) {
        match decode::decode(payload) {
            Ok(Some(frame)) => {
                if frame.is_empty() {
                    trace!(role = %self.role, "frame carried no recognized fields");
                    return;
                }
                let _ = self
                    .notices
                    .send(SessionNotice::Frame {
                        role: self.role,
                        frame,
                    })
                    .await;
            }
            Ok(None) => {
                // No complete object in this notification; expected noise.
                trace!(role = %self.role, len = payload.len(), "incomplete frame dropped");
            }
            Err(error) => {
                self.decode_failures += 1;
                debug!(
                    role = %self.role,
                    failures = self.decode_failures,
                    %error,
                    "undecodable frame dropped"
                );
            }
        }
    }

    async fn write_command(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let characteristic = self.write_char.ok_or(SessionError::NoWriteChannel)?;
        self.link
            .write(characteristic, payload)
            .await
            .map_err(SessionError::from)
    }

    /// Fatal-to-role failure: release the link, record the error, report
    /// upward. Retrying via a fresh scan is the coordinator's decision.
    async fn fail(&mut self, error: SessionError) {
        warn!(role = %self.role, %error, "session failed");
        self.link.close().await;
        self.last_error = Some(error.clone());
        let _ = self
            .notices
            .send(SessionNotice::Failed {
                role: self.role,
                error,
            })
            .await;
        self.transition(ConnectionState::Disconnected).await;
    }

    async fn transition(&mut self, state: ConnectionState) {
        trace!(role = %self.role, from = %self.state, to = %state, "session transition");
        self.state = state;
        let _ = self
            .notices
            .send(SessionNotice::StateChanged {
                role: self.role,
                state,
            })
            .await;
    }
}

/// Drive a session from its link events and owner commands on a dedicated
/// task. All callbacks for one session are serialized here; the task ends
/// once the session reaches `Disconnected`.
pub(crate) fn spawn_driver(
    mut session: PeripheralSession,
    mut events: LinkEventStream,
    mut commands: mpsc::Receiver<SessionCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Send(payload)) => {
                        if let Err(error) = session.send(&payload).await {
                            debug!(role = %session.role(), %error, "command rejected");
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        session.close().await;
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => {
                        session.handle_event(event).await;
                        if session.state() == ConnectionState::Disconnected {
                            break;
                        }
                    }
                    None => {
                        // Transport dropped its side of the event channel.
                        session.handle_event(LinkEvent::Disconnected(None)).await;
                        break;
                    }
                },
            }
        }
    })
}
