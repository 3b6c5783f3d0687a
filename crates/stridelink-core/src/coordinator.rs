//! Dual-session coordinator.
//!
//! Owns up to two role-scoped [`PeripheralSession`]s, the scan loop, the
//! name→role mapping, and the retry budget, and publishes aggregate state
//! to external consumers through a `watch` channel. All coordinator
//! mutations happen on one dedicated task — sessions and the transport
//! talk to it exclusively through channels, so the retry budget, found
//! set, and aggregate flags live in a single mutual-exclusion domain.
//!
//! Scan attempts are bounded: `max_scan_attempts` counts the *total*
//! number of scan starts per measurement. When the budget is exhausted
//! the measurement fails terminally and nothing restarts it except an
//! explicit [`Coordinator::start_measurement`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, CoordinatorError};
use crate::pump::CommandPump;
use crate::session::{
    spawn_driver, PeripheralSession, SessionCommand, SessionNotice, MEASURE_COMMAND,
    RESET_COMMAND,
};
use crate::transport::{Advertisement, BleTransport};
use crate::types::{ConnectionState, DualState, Role};

/// Handle to a running coordinator.
///
/// Cloning is not supported; share the published state via
/// [`Coordinator::subscribe`] instead. Dropping the handle shuts the
/// coordinator down.
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<DualState>,
    task: JoinHandle<()>,
}

enum Command {
    Start(oneshot::Sender<Result<(), CoordinatorError>>),
    Stop(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

impl Coordinator {
    /// Validate `config` and spawn the coordinator task.
    ///
    /// # Errors
    ///
    /// Returns the first configuration invariant violation.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn BleTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(DualState::default());
        let (notice_tx, notice_rx) = mpsc::channel(64);

        let runner = Runner {
            config,
            transport,
            state: state_tx,
            notice_tx,
            sessions: HashMap::new(),
            scan: None,
            pending_right: None,
            pump: None,
            attempts: 0,
            measuring: false,
        };
        let task = tokio::spawn(runner.run(command_rx, notice_rx));

        Ok(Self {
            commands: command_tx,
            state: state_rx,
            task,
        })
    }

    /// Begin a measurement: reset the retry budget and start scanning for
    /// both roles. A no-op when a measurement is already running.
    ///
    /// # Errors
    ///
    /// Fails when the platform refuses to start the first scan, or when
    /// the coordinator task has shut down.
    pub async fn start_measurement(&self) -> Result<(), CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        reply_rx.await.map_err(|_| CoordinatorError::Shutdown)?
    }

    /// Stop the measurement: close both sessions (each sends a
    /// best-effort stop command), cancel the command pump, stop any
    /// active scan. Last-known sensor values are retained — they reflect
    /// hardware, not this module.
    ///
    /// # Errors
    ///
    /// Fails only when the coordinator task has shut down.
    pub async fn stop_measurement(&self) -> Result<(), CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        reply_rx.await.map_err(|_| CoordinatorError::Shutdown)
    }

    /// Re-zero the firmware's angle integrators on every connected role.
    /// Roles without a write channel log the rejection and are skipped.
    ///
    /// # Errors
    ///
    /// Fails only when the coordinator task has shut down.
    pub async fn reset_angles(&self) -> Result<(), CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Reset(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        reply_rx.await.map_err(|_| CoordinatorError::Shutdown)
    }

    /// Snapshot of the published state.
    #[must_use]
    pub fn state(&self) -> DualState {
        self.state.borrow().clone()
    }

    /// Subscribe to published state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DualState> {
        self.state.clone()
    }

    /// Stop the measurement and wind the coordinator task down.
    pub async fn shutdown(self) {
        let Self {
            commands, task, ..
        } = self;
        drop(commands);
        let _ = task.await;
    }
}

/// Per-role bookkeeping for a live session.
struct SessionEntry {
    commands: mpsc::Sender<SessionCommand>,
    state: ConnectionState,
}

/// One scan attempt in flight.
struct ScanAttempt {
    advertisements: mpsc::Receiver<Advertisement>,
    deadline: Instant,
    /// The transport closed the advertisement stream; keep the deadline
    /// but stop polling.
    ended: bool,
}

enum Wake {
    Command(Option<Command>),
    Notice(SessionNotice),
    Advertisement(Option<Advertisement>),
    ScanDeadline,
    RightDue,
}

struct Runner {
    config: CoordinatorConfig,
    transport: Arc<dyn BleTransport>,
    state: watch::Sender<DualState>,
    notice_tx: mpsc::Sender<SessionNotice>,
    sessions: HashMap<Role, SessionEntry>,
    scan: Option<ScanAttempt>,
    /// Sequential mode: right advertisement waiting out the grace period.
    pending_right: Option<(Advertisement, Instant)>,
    pump: Option<CommandPump>,
    /// Scan starts consumed by the current measurement.
    attempts: u32,
    measuring: bool,
}

impl Runner {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut notices: mpsc::Receiver<SessionNotice>,
    ) {
        loop {
            let scan_open = self.scan.as_ref().is_some_and(|s| !s.ended);
            let scan_deadline = self.scan.as_ref().map(|s| s.deadline);
            let right_due = self.pending_right.as_ref().map(|(_, at)| *at);

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(notice) = notices.recv() => Wake::Notice(notice),
                advertisement = async {
                    match self.scan.as_mut() {
                        Some(scan) => scan.advertisements.recv().await,
                        None => None,
                    }
                }, if scan_open => Wake::Advertisement(advertisement),
                () = async {
                    if let Some(deadline) = scan_deadline {
                        tokio::time::sleep_until(deadline).await;
                    }
                }, if scan_deadline.is_some() => Wake::ScanDeadline,
                () = async {
                    if let Some(due) = right_due {
                        tokio::time::sleep_until(due).await;
                    }
                }, if right_due.is_some() => Wake::RightDue,
            };

            match wake {
                Wake::Command(Some(Command::Start(reply))) => {
                    let _ = reply.send(self.handle_start().await);
                }
                Wake::Command(Some(Command::Stop(reply))) => {
                    self.handle_stop().await;
                    let _ = reply.send(());
                }
                Wake::Command(Some(Command::Reset(reply))) => {
                    self.handle_reset().await;
                    let _ = reply.send(());
                }
                Wake::Command(None) => {
                    // Handle dropped: clean shutdown.
                    self.handle_stop().await;
                    break;
                }
                Wake::Notice(notice) => self.handle_notice(notice).await,
                Wake::Advertisement(Some(adv)) => self.handle_advertisement(adv).await,
                Wake::Advertisement(None) => {
                    if let Some(scan) = self.scan.as_mut() {
                        scan.ended = true;
                    }
                }
                Wake::ScanDeadline => self.handle_attempt_timeout().await,
                Wake::RightDue => self.connect_pending_right().await,
            }
        }
    }

    async fn handle_start(&mut self) -> Result<(), CoordinatorError> {
        if self.measuring {
            debug!("measurement already running");
            return Ok(());
        }
        info!("starting measurement");
        self.measuring = true;
        self.attempts = 0;
        self.state.send_modify(|s| {
            s.measuring = true;
            s.failure = None;
            for role in Role::ALL {
                s.role_mut(role).last_error = None;
            }
        });
        self.begin_attempt().await
    }

    async fn handle_stop(&mut self) {
        info!("stopping measurement");
        self.measuring = false;
        self.cancel_pump();
        self.stop_scan().await;
        self.pending_right = None;
        self.close_all_sessions().await;
        // Connection flags drop; last-known sensor values are retained.
        self.state.send_modify(|s| {
            s.measuring = false;
            for role in Role::ALL {
                s.role_mut(role).state = ConnectionState::Disconnected;
            }
        });
    }

    async fn handle_reset(&mut self) {
        for (role, entry) in &self.sessions {
            debug!(%role, "sending reset");
            let _ = entry
                .commands
                .send(SessionCommand::Send(RESET_COMMAND.to_vec()))
                .await;
        }
    }

    /// Start one scan attempt, consuming budget. The caller has already
    /// checked the budget.
    async fn begin_attempt(&mut self) -> Result<(), CoordinatorError> {
        self.attempts += 1;
        debug!(
            attempt = self.attempts,
            max = self.config.max_scan_attempts,
            "starting scan attempt"
        );

        let advertisements = match self.transport.start_scan().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "scan failed to start");
                self.fail_terminally(&error.to_string()).await;
                return Err(error.into());
            }
        };
        self.scan = Some(ScanAttempt {
            advertisements,
            deadline: Instant::now() + self.config.scan_timeout(),
            ended: false,
        });

        // Roles without a live session are back to being searched for.
        self.state.send_modify(|s| {
            for role in Role::ALL {
                if !self.sessions.contains_key(&role) {
                    s.role_mut(role).state = ConnectionState::Scanning;
                }
            }
        });
        Ok(())
    }

    async fn handle_advertisement(&mut self, adv: Advertisement) {
        if !self.measuring {
            return;
        }
        // Role assignment comes solely from the advertised name; anything
        // else is ignored.
        let Some(role) = self.config.role_for(&adv.name) else {
            return;
        };
        if self.sessions.contains_key(&role) {
            return;
        }

        if role == Role::Right && self.config.scan_mode == crate::config::ScanMode::Sequential {
            // Right waits until left is ready, then a grace period, to
            // avoid simultaneous-connection radio contention.
            let left_ready = self
                .sessions
                .get(&Role::Left)
                .is_some_and(|e| e.state.is_ready());
            if !left_ready || self.pending_right.is_some() {
                return;
            }
            let due = Instant::now() + self.config.sequential_grace();
            debug!(grace_ms = self.config.sequential_grace_ms, "right connect deferred");
            self.pending_right = Some((adv, due));
            return;
        }

        self.open_session(role, &adv).await;
    }

    async fn connect_pending_right(&mut self) {
        let Some((adv, _)) = self.pending_right.take() else {
            return;
        };
        if !self.measuring || self.sessions.contains_key(&Role::Right) {
            return;
        }
        self.open_session(Role::Right, &adv).await;
    }

    async fn open_session(&mut self, role: Role, adv: &Advertisement) {
        let identity = self.config.identity(role).clone();
        info!(%role, name = %adv.name, "matched advertisement, connecting");

        match PeripheralSession::open(
            role,
            identity,
            self.config.mtu_target,
            adv,
            self.transport.as_ref(),
            self.notice_tx.clone(),
        )
        .await
        {
            Ok((session, events)) => {
                let (command_tx, command_rx) = mpsc::channel(16);
                let _driver = spawn_driver(session, events, command_rx);
                self.sessions.insert(
                    role,
                    SessionEntry {
                        commands: command_tx,
                        state: ConnectionState::Connecting,
                    },
                );
            }
            Err(error) => {
                // Fail fast; the next matching advertisement retries.
                warn!(%role, %error, "session open failed");
                self.state.send_modify(|s| {
                    s.role_mut(role).last_error = Some(error.to_string());
                });
            }
        }
    }

    async fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::StateChanged { role, state } => {
                if let Some(entry) = self.sessions.get_mut(&role) {
                    entry.state = state;
                }
                if state == ConnectionState::Disconnected {
                    self.sessions.remove(&role);
                }
                self.state.send_modify(|s| {
                    s.role_mut(role).state = state;
                });
                if state.is_ready() {
                    self.check_both_ready().await;
                }
            }
            SessionNotice::Frame { role, frame } => {
                self.state.send_modify(|s| {
                    s.role_mut(role).frame.merge(&frame);
                });
            }
            SessionNotice::Failed { role, error } => {
                self.state.send_modify(|s| {
                    s.role_mut(role).last_error = Some(error.to_string());
                });
            }
        }
    }

    async fn check_both_ready(&mut self) {
        let both_ready = Role::ALL.iter().all(|role| {
            self.sessions
                .get(role)
                .is_some_and(|entry| entry.state.is_ready())
        });
        if !both_ready {
            return;
        }

        info!("both roles ready");
        self.stop_scan().await;
        self.pending_right = None;
        self.attempts = 0;
        self.start_pump();
    }

    async fn handle_attempt_timeout(&mut self) {
        self.stop_scan().await;
        self.pending_right = None;

        if self.attempts < self.config.max_scan_attempts {
            warn!(
                attempt = self.attempts,
                max = self.config.max_scan_attempts,
                "scan attempt timed out, retrying"
            );
            let _ = self.begin_attempt().await;
        } else {
            let error = CoordinatorError::RetryBudgetExhausted {
                attempts: self.attempts,
            };
            warn!(%error, "retry budget exhausted");
            self.fail_terminally(&error.to_string()).await;
        }
    }

    /// Terminal failure: everything stops until the operator restarts the
    /// measurement explicitly.
    async fn fail_terminally(&mut self, message: &str) {
        self.measuring = false;
        self.cancel_pump();
        self.stop_scan().await;
        self.pending_right = None;
        self.close_all_sessions().await;
        self.state.send_modify(|s| {
            s.measuring = false;
            s.failure = Some(message.to_owned());
            for role in Role::ALL {
                s.role_mut(role).state = ConnectionState::Disconnected;
            }
        });
    }

    async fn stop_scan(&mut self) {
        if self.scan.take().is_some() {
            if let Err(error) = self.transport.stop_scan().await {
                debug!(%error, "stop scan failed");
            }
        }
    }

    async fn close_all_sessions(&mut self) {
        for (role, entry) in self.sessions.drain() {
            debug!(%role, "closing session");
            let _ = entry.commands.send(SessionCommand::Close).await;
        }
    }

    fn start_pump(&mut self) {
        if !self.config.command_pump || self.pump.is_some() {
            return;
        }
        // Only roles whose identity declares a write channel are pumped.
        let sinks: Vec<_> = Role::ALL
            .iter()
            .filter(|role| self.config.identity(**role).write.is_some())
            .filter_map(|role| self.sessions.get(role))
            .map(|entry| entry.commands.clone())
            .collect();
        if sinks.is_empty() {
            return;
        }
        info!(
            interval_ms = self.config.command_interval_ms,
            "starting command pump"
        );
        self.pump = Some(CommandPump::start(
            self.config.command_interval(),
            MEASURE_COMMAND.to_vec(),
            sinks,
        ));
    }

    fn cancel_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
    }
}
