//! Liveness pings for a self-created session.

use std::sync::Arc;
use std::time::Duration;

use hostlink_protocol::{PlayerId, SessionId};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{DirectoryClient, SessionState, StatusEvent};

/// A running heartbeat task. Dropping it stops the task.
pub(crate) struct Heartbeat {
    session_id: SessionId,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Pings `session_id` as `host` every `interval`, first one interval
    /// from now.
    ///
    /// A failed ping is logged and reported on `status`; the next tick
    /// retries.
    pub(crate) fn spawn<D: DirectoryClient>(
        directory: Arc<D>,
        session_id: SessionId,
        host: PlayerId,
        interval: Duration,
        status: broadcast::Sender<StatusEvent>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let id = session_id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match directory.heartbeat(&id, &host).await {
                            Ok(()) => tracing::trace!(session_id = %id, "heartbeat sent"),
                            Err(e) => {
                                tracing::warn!(session_id = %id, error = %e, "heartbeat failed, retrying next interval");
                                let _ = status.send(StatusEvent {
                                    state: SessionState::Connected,
                                    message: format!("Heartbeat failed: {e}"),
                                    failure: Some(e.kind()),
                                });
                            }
                        }
                    }
                }
            }
            tracing::debug!(session_id = %id, "heartbeat loop exited");
        });

        tracing::info!(%session_id, ?interval, "heartbeat started");
        Self {
            session_id,
            stop: Some(stop_tx),
            task,
        }
    }

    /// Stops the heartbeat. No further ping is started.
    pub(crate) fn stop(self) {
        drop(self);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.abort();
        tracing::info!(session_id = %self.session_id, "heartbeat stopped");
    }
}
