//! Controller liveness record
//!
//! Each replica periodically writes the current time under its own key in the
//! status store, along with the capabilities it advertises, so other tools
//! can tell which controllers are alive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use engine_common::run::format_timestamp;
use engine_common::{Clock, StatusStore};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::settings::Settings;

/// Time between heartbeats
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(20);

/// Prefix of the per-replica heartbeat keys
pub const HEARTBEAT_PREFIX: &str = "servers.k8scontroller.";

/// Store key of the heartbeat timestamp for `controller_id`
pub fn heartbeat_key(controller_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{controller_id}.heartbeat")
}

fn capabilities_key(controller_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{controller_id}.capabilities")
}

/// Writes this replica's heartbeat
pub struct Heartbeat {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    settings: watch::Receiver<Arc<Settings>>,
    controller_id: String,
}

impl Heartbeat {
    /// Create a heartbeat for the replica named `controller_id`
    pub fn new(
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        settings: watch::Receiver<Arc<Settings>>,
        controller_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            controller_id: controller_id.into(),
        }
    }

    /// One periodic beat; a failed write is logged and retried next period
    pub async fn tick(&self) {
        if let Err(e) = self.beat().await {
            warn!(controller = %self.controller_id, error = %e, "Failed to write heartbeat");
        }
    }

    /// Record the current time, and the advertised capabilities when there
    /// are any
    pub async fn beat(&self) -> Result<()> {
        let now = format_timestamp(self.clock.now());
        let capabilities = self.settings.borrow().capability_report();

        let mut values = BTreeMap::from([(heartbeat_key(&self.controller_id), now.clone())]);
        match capabilities {
            Some(report) => {
                values.insert(capabilities_key(&self.controller_id), report);
            }
            None => {
                self.store
                    .delete(&[capabilities_key(&self.controller_id)])
                    .await?;
            }
        }
        self.store.put_all(values).await?;
        debug!(controller = %self.controller_id, at = %now, "Heartbeat written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::epoch;
    use engine_common::{ManualClock, MemoryStatusStore};
    use std::collections::BTreeSet;

    fn heartbeat(
        store: &Arc<MemoryStatusStore>,
        clock: &Arc<ManualClock>,
        settings: Settings,
    ) -> (Heartbeat, watch::Sender<Arc<Settings>>) {
        let (tx, rx) = watch::channel(Arc::new(settings));
        let beat = Heartbeat::new(store.clone(), clock.clone(), rx, "controller-0");
        (beat, tx)
    }

    #[tokio::test]
    async fn beat_writes_current_time() {
        let store = Arc::new(MemoryStatusStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let (beat, _tx) = heartbeat(&store, &clock, Settings::default());

        beat.beat().await.unwrap();
        assert_eq!(
            store.get(&heartbeat_key("controller-0")).await.unwrap(),
            Some(format_timestamp(epoch()))
        );

        clock.advance(Duration::from_secs(20));
        beat.tick().await;
        assert_eq!(
            store.get(&heartbeat_key("controller-0")).await.unwrap(),
            Some(format_timestamp(epoch() + chrono::Duration::seconds(20)))
        );
    }

    #[tokio::test]
    async fn capabilities_follow_settings() {
        let store = Arc::new(MemoryStatusStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let (beat, tx) = heartbeat(
            &store,
            &clock,
            Settings {
                required_capabilities: BTreeSet::from(["docker".to_string()]),
                optional_capabilities: BTreeSet::from(["zos".to_string()]),
                ..Settings::default()
            },
        );

        beat.beat().await.unwrap();
        let key = "servers.k8scontroller.controller-0.capabilities";
        assert_eq!(store.get(key).await.unwrap().as_deref(), Some("+docker,zos"));

        tx.send_replace(Arc::new(Settings::default()));
        beat.beat().await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), None);
    }
}
