//! Controller settings read from a ConfigMap
//!
//! A [`Settings`] value is immutable. Each reload that sees a new
//! `resourceVersion` builds a complete replacement and publishes it through a
//! watch channel, so readers always hold a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use engine_kube::ClusterFacade;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};

/// Default engine label
pub const DEFAULT_ENGINE_LABEL: &str = "k8s-standard-engine";
/// Default worker image
pub const DEFAULT_ENGINE_IMAGE: &str = "ghcr.io/galasa-dev/galasa-boot-embedded-amd64";

/// One consistent view of the controller configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `resourceVersion` of the ConfigMap this was read from
    pub version: Option<String>,
    /// Maximum concurrently active worker pods
    pub max_engines: u32,
    /// Label value identifying this controller's workers
    pub engine_label: String,
    /// Worker container image
    pub engine_image: String,
    /// Memory request in MiB
    pub memory_request_mi: i64,
    /// Memory limit in MiB
    pub memory_limit_mi: i64,
    /// CPU request in millicores; not set on the pod when ≤ 0
    pub cpu_request_m: i64,
    /// CPU limit in millicores; not set on the pod when ≤ 0
    pub cpu_limit_m: i64,
    /// JVM heap in MiB; no `-Xmx` argument when 0
    pub heap_mi: i64,
    /// Required `kubernetes.io/arch` of worker nodes
    pub node_arch: String,
    /// Preferred node label as `key=value`
    pub node_preferred_affinity: String,
    /// Tolerations as `key=Operator:Effect,...`
    pub node_tolerations: String,
    /// Secret holding the encryption keys mounted into workers
    pub encryption_keys_secret_name: String,
    /// Pause between launches within one scheduling pass
    pub launch_interval: Duration,
    /// Pod-create attempts per run before it is marked EnvFail
    pub max_launch_attempts: u32,
    /// Period of the scheduler and pod cleanup
    pub run_poll: Duration,
    /// How long after an interrupt request a running worker is left alone
    pub interrupt_grace_period: Duration,
    /// Requestors whose runs come from schedules
    pub scheduled_requestors: Vec<String>,
    /// Capabilities a worker must be asked for explicitly
    pub required_capabilities: BTreeSet<String>,
    /// Capabilities this controller's workers offer
    pub optional_capabilities: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: None,
            max_engines: 1,
            engine_label: DEFAULT_ENGINE_LABEL.to_string(),
            engine_image: DEFAULT_ENGINE_IMAGE.to_string(),
            memory_request_mi: 150,
            memory_limit_mi: 200,
            cpu_request_m: 400,
            cpu_limit_m: 1000,
            heap_mi: 150,
            node_arch: String::new(),
            node_preferred_affinity: String::new(),
            node_tolerations: String::new(),
            encryption_keys_secret_name: String::new(),
            launch_interval: Duration::from_millis(1000),
            max_launch_attempts: 5,
            run_poll: Duration::from_secs(20),
            interrupt_grace_period: Duration::from_secs(300),
            scheduled_requestors: Vec::new(),
            required_capabilities: BTreeSet::new(),
            optional_capabilities: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Build a snapshot from ConfigMap data. Values that fail to parse keep
    /// their value from `previous`; missing values take the defaults.
    pub fn from_data(
        previous: &Settings,
        version: Option<String>,
        data: &BTreeMap<String, String>,
    ) -> Self {
        let defaults = Settings::default();
        let reader = DataReader { data };

        let (required, optional) = parse_capabilities(reader.raw("engine_capabilities"));
        let (required_capabilities, optional_capabilities) = if required
            != previous.required_capabilities
            || optional != previous.optional_capabilities
        {
            info!(
                capabilities = ?capability_report(&required, &optional),
                "Engine capabilities changed"
            );
            (required, optional)
        } else {
            (
                previous.required_capabilities.clone(),
                previous.optional_capabilities.clone(),
            )
        };

        let scheduled_requestors = parse_csv(reader.raw("scheduled_requestors"));
        if scheduled_requestors != previous.scheduled_requestors {
            info!(requestors = ?scheduled_requestors, "Scheduled requestors changed");
        }

        Self {
            version,
            max_engines: reader.number("max_engines", defaults.max_engines, previous.max_engines),
            engine_label: reader.string("engine_label", &defaults.engine_label),
            engine_image: reader.string("engine_image", &defaults.engine_image),
            memory_request_mi: reader.number(
                "engine_memory_request",
                defaults.memory_request_mi,
                previous.memory_request_mi,
            ),
            memory_limit_mi: reader.number(
                "engine_memory_limit",
                defaults.memory_limit_mi,
                previous.memory_limit_mi,
            ),
            cpu_request_m: reader.number(
                "engine_cpu_request",
                defaults.cpu_request_m,
                previous.cpu_request_m,
            ),
            cpu_limit_m: reader.number(
                "engine_cpu_limit",
                defaults.cpu_limit_m,
                previous.cpu_limit_m,
            ),
            heap_mi: reader.number("engine_memory_heap", defaults.heap_mi, previous.heap_mi),
            node_arch: reader.string("node_arch", ""),
            node_preferred_affinity: reader.string("galasa_node_preferred_affinity", ""),
            node_tolerations: reader.string("galasa_node_tolerations", ""),
            encryption_keys_secret_name: reader.string("encryption_keys_secret_name", ""),
            launch_interval: Duration::from_millis(reader.number(
                "kube_launch_interval_milliseconds",
                duration_millis(defaults.launch_interval),
                duration_millis(previous.launch_interval),
            )),
            max_launch_attempts: reader.number(
                "max_test_pod_retry_limit",
                defaults.max_launch_attempts,
                previous.max_launch_attempts,
            ),
            run_poll: Duration::from_secs(reader.number(
                "run_poll",
                defaults.run_poll.as_secs(),
                previous.run_poll.as_secs(),
            )),
            interrupt_grace_period: Duration::from_secs(reader.number(
                "interrupted_test_run_cleanup_grace_period_seconds",
                defaults.interrupt_grace_period.as_secs(),
                previous.interrupt_grace_period.as_secs(),
            )),
            scheduled_requestors,
            required_capabilities,
            optional_capabilities,
        }
    }

    /// Capabilities as advertised: required ones prefixed with `+`, then the
    /// optional ones. `None` when there are no capabilities.
    pub fn capability_report(&self) -> Option<String> {
        capability_report(&self.required_capabilities, &self.optional_capabilities)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct DataReader<'a> {
    data: &'a BTreeMap<String, String>,
}

impl DataReader<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    fn number<T>(&self, key: &str, default: T, previous: T) -> T
    where
        T: FromStr + Display + Copy,
        T::Err: Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    key,
                    value = %raw,
                    error = %e,
                    keeping = %previous,
                    "Invalid numeric setting, keeping previous value"
                );
                previous
            }
        }
    }
}

fn parse_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_capabilities(raw: Option<&str>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut required = BTreeSet::new();
    let mut optional = BTreeSet::new();
    for entry in parse_csv(raw) {
        match entry.strip_prefix('+') {
            Some(name) if !name.trim().is_empty() => {
                required.insert(name.trim().to_string());
            }
            Some(_) => {}
            None => {
                optional.insert(entry);
            }
        }
    }
    (required, optional)
}

fn capability_report(required: &BTreeSet<String>, optional: &BTreeSet<String>) -> Option<String> {
    if required.is_empty() && optional.is_empty() {
        return None;
    }
    let parts: Vec<String> = required
        .iter()
        .map(|c| format!("+{c}"))
        .chain(optional.iter().cloned())
        .collect();
    Some(parts.join(","))
}

/// Owns the current settings and reloads them from the cluster
pub struct SettingsManager {
    facade: Arc<dyn ClusterFacade>,
    config_map: String,
    tx: watch::Sender<Arc<Settings>>,
}

impl SettingsManager {
    /// Start from defaults; call [`SettingsManager::reload`] to read the
    /// ConfigMap
    pub fn new(facade: Arc<dyn ClusterFacade>, config_map: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Settings::default()));
        Self {
            facade,
            config_map: config_map.into(),
            tx,
        }
    }

    /// Receiver that always yields the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// The current snapshot
    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// Re-read the ConfigMap. Returns `true` if a new snapshot was published.
    pub async fn reload(&self) -> Result<bool> {
        let cm = self.facade.get_config_map(&self.config_map).await?;

        let Some(version) = cm.metadata.resource_version.clone() else {
            return Err(ControllerError::invalid_settings(
                &self.config_map,
                "ConfigMap has no metadata resourceVersion",
            ));
        };
        let Some(data) = cm.data.as_ref() else {
            return Err(ControllerError::invalid_settings(
                &self.config_map,
                "ConfigMap has no data",
            ));
        };

        let current = self.current();
        if current.version.as_deref() == Some(version.as_str()) {
            debug!(config_map = %self.config_map, version = %version, "Settings unchanged");
            return Ok(false);
        }

        let next = Settings::from_data(&current, Some(version.clone()), data);
        if next.run_poll != current.run_poll {
            info!(
                old_secs = current.run_poll.as_secs(),
                new_secs = next.run_poll.as_secs(),
                "Run poll interval changed, rescheduling"
            );
        }
        info!(
            config_map = %self.config_map,
            version = %version,
            max_engines = next.max_engines,
            engine_label = %next.engine_label,
            engine_image = %next.engine_image,
            "Settings loaded"
        );
        self.tx.send_replace(Arc::new(next));
        Ok(true)
    }

    /// Periodic reload; failures keep the previous snapshot
    pub async fn refresh(&self) {
        if let Err(e) = self.reload().await {
            warn!(config_map = %self.config_map, error = %e, "Failed to reload settings");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFacade;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn data(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config_map(version: Option<&str>, entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("config".to_string()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            data: Some(data(entries)),
            ..Default::default()
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn missing_keys_take_literal_defaults() {
            let s = Settings::from_data(&Settings::default(), None, &BTreeMap::new());
            assert_eq!(s, Settings::default());
            assert_eq!(s.engine_label, "k8s-standard-engine");
            assert_eq!(s.max_launch_attempts, 5);
            assert_eq!(s.interrupt_grace_period, Duration::from_secs(300));
        }

        #[test]
        fn values_are_read_and_trimmed() {
            let s = Settings::from_data(
                &Settings::default(),
                Some("7".to_string()),
                &data(&[
                    ("max_engines", " 4 "),
                    ("engine_label", "fast-engine"),
                    ("engine_cpu_request", "-1"),
                    ("kube_launch_interval_milliseconds", "250"),
                    ("run_poll", "45"),
                    ("interrupted_test_run_cleanup_grace_period_seconds", "60"),
                    ("galasa_node_tolerations", "galasa-engines=Exists:NoSchedule"),
                ]),
            );
            assert_eq!(s.version.as_deref(), Some("7"));
            assert_eq!(s.max_engines, 4);
            assert_eq!(s.engine_label, "fast-engine");
            assert_eq!(s.cpu_request_m, -1);
            assert_eq!(s.launch_interval, Duration::from_millis(250));
            assert_eq!(s.run_poll, Duration::from_secs(45));
            assert_eq!(s.interrupt_grace_period, Duration::from_secs(60));
            assert_eq!(s.node_tolerations, "galasa-engines=Exists:NoSchedule");
        }

        #[test]
        fn unparseable_numbers_keep_previous_value() {
            let previous = Settings {
                max_engines: 9,
                run_poll: Duration::from_secs(33),
                ..Settings::default()
            };
            let s = Settings::from_data(
                &previous,
                None,
                &data(&[("max_engines", "lots"), ("run_poll", "soon")]),
            );
            assert_eq!(s.max_engines, 9);
            assert_eq!(s.run_poll, Duration::from_secs(33));
        }

        #[test]
        fn blank_strings_fall_back_to_default() {
            let previous = Settings {
                engine_image: "custom:1".to_string(),
                ..Settings::default()
            };
            let s = Settings::from_data(&previous, None, &data(&[("engine_image", "  ")]));
            assert_eq!(s.engine_image, DEFAULT_ENGINE_IMAGE);
        }

        #[test]
        fn capabilities_split_into_required_and_optional() {
            let s = Settings::from_data(
                &Settings::default(),
                None,
                &data(&[("engine_capabilities", "+docker, zos ,+gpu,,+")]),
            );
            assert_eq!(
                s.required_capabilities,
                BTreeSet::from(["docker".to_string(), "gpu".to_string()])
            );
            assert_eq!(s.optional_capabilities, BTreeSet::from(["zos".to_string()]));
            assert_eq!(s.capability_report().as_deref(), Some("+docker,+gpu,zos"));
            assert_eq!(Settings::default().capability_report(), None);
        }

        #[test]
        fn scheduled_requestors_are_a_list() {
            let s = Settings::from_data(
                &Settings::default(),
                None,
                &data(&[("scheduled_requestors", "nightly, weekly")]),
            );
            assert_eq!(s.scheduled_requestors, vec!["nightly", "weekly"]);
        }
    }

    mod reload {
        use super::*;

        #[tokio::test]
        async fn reload_publishes_new_snapshot() {
            let mut facade = MockFacade::new();
            facade
                .expect_get_config_map()
                .returning(|_| Ok(config_map(Some("1"), &[("max_engines", "3")])));
            let manager = SettingsManager::new(Arc::new(facade), "config");
            let mut rx = manager.subscribe();

            assert!(manager.reload().await.unwrap());
            assert!(rx.has_changed().unwrap());
            assert_eq!(rx.borrow_and_update().max_engines, 3);
        }

        #[tokio::test]
        async fn unchanged_version_is_a_no_op() {
            let mut facade = MockFacade::new();
            facade
                .expect_get_config_map()
                .times(2)
                .returning(|_| Ok(config_map(Some("1"), &[("max_engines", "3")])));
            let manager = SettingsManager::new(Arc::new(facade), "config");

            assert!(manager.reload().await.unwrap());
            let mut rx = manager.subscribe();
            assert!(!manager.reload().await.unwrap());
            assert!(!rx.has_changed().unwrap());
            assert_eq!(rx.borrow_and_update().version.as_deref(), Some("1"));
        }

        #[tokio::test]
        async fn missing_data_is_a_typed_error() {
            let mut facade = MockFacade::new();
            facade
                .expect_get_config_map()
                .returning(|_| {
                    let mut cm = config_map(Some("1"), &[]);
                    cm.data = None;
                    Ok(cm)
                });
            let manager = SettingsManager::new(Arc::new(facade), "config");

            let err = manager.reload().await.unwrap_err();
            assert!(matches!(err, ControllerError::InvalidSettings { .. }));
            assert_eq!(*manager.current(), Settings::default());
        }

        #[tokio::test]
        async fn missing_version_is_a_typed_error() {
            let mut facade = MockFacade::new();
            facade
                .expect_get_config_map()
                .returning(|_| Ok(config_map(None, &[])));
            let manager = SettingsManager::new(Arc::new(facade), "config");

            assert!(matches!(
                manager.reload().await,
                Err(ControllerError::InvalidSettings { .. })
            ));
        }

        #[tokio::test]
        async fn refresh_keeps_snapshot_on_failure() {
            let mut facade = MockFacade::new();
            facade.expect_get_config_map().returning(|name| {
                Err(engine_kube::ClusterError::NotFound {
                    kind: "ConfigMap".to_string(),
                    name: name.to_string(),
                })
            });
            let manager = SettingsManager::new(Arc::new(facade), "config");
            manager.refresh().await;
            assert_eq!(*manager.current(), Settings::default());
        }
    }
}
