//! Periodic visibility extension for in-flight messages.
//!
//! The snapshot is taken inside the manager actor so it is consistent with
//! the in-flight map; the broker calls themselves run off the actor loop.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::manager::ManagerHandle;

#[derive(Debug, Clone)]
pub struct VisibilityConfig {
    /// Tick interval; 55 s leaves headroom against a ~120 s broker budget.
    pub interval: std::time::Duration,
    /// Visibility target for each extension.
    pub extend_to_seconds: u32,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(55),
            extend_to_seconds: 120,
        }
    }
}

pub fn spawn_visibility_extender(
    manager: ManagerHandle,
    shutdown: &broadcast::Sender<()>,
    config: VisibilityConfig,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        // Nothing is in flight at startup; skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match manager.extend_visibility(config.extend_to_seconds).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "extended visibility for in-flight messages"),
                        Err(e) => warn!(error = %e, "visibility extension request failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("visibility extender stopped");
                    break;
                }
            }
        }
    })
}
