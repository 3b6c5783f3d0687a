//! Periodic command pump.
//!
//! Some firmware revisions do not push notifications spontaneously and
//! must be polled: once both roles are ready, a repeating task writes
//! `measure` on a fixed interval until cancelled. Cancellation is
//! cooperative — checked before every send — and idempotent; a send
//! already racing with the cancel may complete, but nothing further is
//! scheduled.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::session::SessionCommand;

/// Cancellable repeating command writer.
pub(crate) struct CommandPump {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CommandPump {
    /// Start pumping `payload` to every sink each `interval`.
    ///
    /// The first send happens one interval after start, matching firmware
    /// that expects a settle period after its start command.
    pub(crate) fn start(
        interval: Duration,
        payload: Vec<u8>,
        sinks: Vec<mpsc::Sender<SessionCommand>>,
    ) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.changed() => {
                        if *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Re-check after waking: a cancel may have landed
                        // while the tick was pending.
                        if *cancelled.borrow() {
                            break;
                        }
                        trace!(sinks = sinks.len(), "command pump tick");
                        for sink in &sinks {
                            let _ = sink.send(SessionCommand::Send(payload.clone())).await;
                        }
                    }
                }
            }
            debug!("command pump stopped");
        });
        Self { cancel, task }
    }

    /// Request cancellation. Idempotent; no sends are scheduled after
    /// this returns.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the pump task has fully wound down.
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CommandPump {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }
}
