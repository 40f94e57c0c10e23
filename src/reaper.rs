//! Background removal of inactive workspaces.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::workspace::Workspaces;

/// Handle to the running reaper task.
pub struct Reaper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Every `period`, destroy sessions idle for longer than `timeout`.
    pub fn start(workspaces: Arc<Workspaces>, period: Duration, timeout: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, ?timeout, "Reaper started");

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        let reaped = workspaces.reap_expired(timeout).await;
                        debug!(count = reaped.len(), "Reaper cycle finished");
                    }
                }
            }
            info!("Reaper stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop the loop and wait for an in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}
