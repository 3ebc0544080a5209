//! Worker pod definition
//!
//! The template is built once per run from the settings snapshot and the
//! controller's environment; retries only change the pod name.

use std::collections::BTreeMap;
use std::path::Path;

use engine_kube::{ENGINE_CONTROLLER_LABEL, RUN_LABEL};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PodSpec, PreferredSchedulingTerm, ResourceRequirements, SecretVolumeSource, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{error, info};

use crate::settings::Settings;

/// Name of the secret volume holding encryption keys
pub const ENCRYPTION_KEYS_VOLUME: &str = "encryption-keys";

/// Name of the worker container
pub const ENGINE_CONTAINER: &str = "engine";

/// Environment variables the controller hands to workers
pub mod env_keys {
    /// Heap size given to the worker JVM
    pub const MAX_HEAP: &str = "MAX_HEAP";
    /// Token for the result archive
    pub const RAS_TOKEN: &str = "GALASA_RAS_TOKEN";
    /// Token for the event stream
    pub const EVENT_TOKEN: &str = "GALASA_EVENT_STREAMS_TOKEN";
    /// Path of the encryption keys file inside the container
    pub const ENCRYPTION_KEYS_PATH: &str = "GALASA_ENCRYPTION_KEYS_PATH";
    /// Configuration store locator
    pub const CONFIG_STORE: &str = "GALASA_CONFIG_STORE";
    /// Dynamic status store locator
    pub const STATUS_STORE: &str = "GALASA_DYNAMICSTATUS_STORE";
    /// Credentials store locator
    pub const CREDENTIALS_STORE: &str = "GALASA_CREDENTIALS_STORE";
    /// Extra bundles to load in the worker
    pub const EXTRA_BUNDLES: &str = "GALASA_EXTRA_BUNDLES";

    /// Always set on workers, even when empty
    pub const ALWAYS: [&str; 3] = [RAS_TOKEN, EVENT_TOKEN, ENCRYPTION_KEYS_PATH];

    /// Passed through only when the controller has a value
    pub const PASS_THROUGH: [&str; 4] =
        [CONFIG_STORE, STATUS_STORE, CREDENTIALS_STORE, EXTRA_BUNDLES];
}

/// The part of the controller's environment that is forwarded to workers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerEnvironment {
    vars: BTreeMap<String, String>,
}

impl WorkerEnvironment {
    /// Capture the forwarded variables from this process
    pub fn from_process() -> Self {
        Self::from_pairs(
            env_keys::ALWAYS
                .iter()
                .chain(env_keys::PASS_THROUGH.iter())
                .filter_map(|key| std::env::var(key).ok().map(|v| (*key, v))),
        )
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Non-blank value of a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Base pod name for a run: `<engineLabel>-<lowercased run name>`
pub fn worker_base_name(engine_label: &str, run_name: &str) -> String {
    format!("{engine_label}-{}", run_name.to_lowercase())
}

/// Command-line arguments for the worker JVM
pub fn worker_args(settings: &Settings, run_name: &str, trace: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(8);
    if settings.heap_mi != 0 {
        args.push(format!("-Xmx{}m", settings.heap_mi));
    }
    args.extend(
        ["-jar", "boot.jar", "--obr", "file:galasa.obr", "--run", run_name]
            .iter()
            .map(|s| s.to_string()),
    );
    if trace {
        args.push("--trace".to_string());
    }
    args
}

/// Immutable worker pod definition for one run
#[derive(Debug, Clone)]
pub struct WorkerPodTemplate {
    base_name: String,
    pod: Pod,
}

impl WorkerPodTemplate {
    /// Build the pod definition for `run_name`
    pub fn build(
        settings: &Settings,
        run_name: &str,
        trace: bool,
        env: &WorkerEnvironment,
    ) -> Self {
        let base_name = worker_base_name(&settings.engine_label, run_name);

        let labels = BTreeMap::from([
            (
                ENGINE_CONTROLLER_LABEL.to_string(),
                settings.engine_label.clone(),
            ),
            (RUN_LABEL.to_string(), run_name.to_string()),
        ]);

        let node_selector = (!settings.node_arch.is_empty()).then(|| {
            BTreeMap::from([(
                "kubernetes.io/arch".to_string(),
                settings.node_arch.clone(),
            )])
        });

        let tolerations = parse_tolerations(&settings.node_tolerations);

        let secret = &settings.encryption_keys_secret_name;
        let volumes = (!secret.is_empty()).then(|| {
            vec![Volume {
                name: ENCRYPTION_KEYS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });

        let container = Container {
            name: ENGINE_CONTAINER.to_string(),
            image: Some(settings.engine_image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec!["java".to_string()]),
            args: Some(worker_args(settings, run_name, trace)),
            resources: Some(resources(settings)),
            volume_mounts: volumes.as_ref().and_then(|_| encryption_keys_mount(env)),
            env: Some(worker_env(settings, env)),
            ..Default::default()
        };

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(base_name.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                node_selector,
                affinity: parse_preferred_affinity(&settings.node_preferred_affinity),
                tolerations: (!tolerations.is_empty()).then_some(tolerations),
                volumes,
                containers: vec![container],
                ..Default::default()
            }),
            ..Default::default()
        };

        Self { base_name, pod }
    }

    /// Name used for the first launch attempt
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// The pod definition under a specific name
    pub fn pod_named(&self, name: &str) -> Pod {
        let mut pod = self.pod.clone();
        pod.metadata.name = Some(name.to_string());
        pod
    }
}

fn resources(settings: &Settings) -> ResourceRequirements {
    let mut requests = BTreeMap::from([(
        "memory".to_string(),
        Quantity(format!("{}Mi", settings.memory_request_mi)),
    )]);
    let mut limits = BTreeMap::from([(
        "memory".to_string(),
        Quantity(format!("{}Mi", settings.memory_limit_mi)),
    )]);
    if settings.cpu_request_m > 0 {
        requests.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", settings.cpu_request_m)),
        );
    }
    if settings.cpu_limit_m > 0 {
        limits.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", settings.cpu_limit_m)),
        );
    }
    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn worker_env(settings: &Settings, env: &WorkerEnvironment) -> Vec<EnvVar> {
    let mut vars = vec![EnvVar {
        name: env_keys::MAX_HEAP.to_string(),
        value: Some(format!("{}m", settings.heap_mi)),
        ..Default::default()
    }];
    vars.extend(env_keys::ALWAYS.iter().map(|key| EnvVar {
        name: key.to_string(),
        value: env.get(key).map(str::to_string),
        ..Default::default()
    }));
    vars.extend(env_keys::PASS_THROUGH.iter().filter_map(|key| {
        env.get(key).map(|value| EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        })
    }));
    vars
}

fn encryption_keys_mount(env: &WorkerEnvironment) -> Option<Vec<VolumeMount>> {
    let path = env.get(env_keys::ENCRYPTION_KEYS_PATH)?;
    let dir = Path::new(path).parent()?.to_str()?;
    if dir.is_empty() {
        return None;
    }
    Some(vec![VolumeMount {
        name: ENCRYPTION_KEYS_VOLUME.to_string(),
        mount_path: dir.to_string(),
        read_only: Some(true),
        ..Default::default()
    }])
}

/// Preferred node affinity from `key=value`; anything else is ignored
pub fn parse_preferred_affinity(raw: &str) -> Option<Affinity> {
    let parts: Vec<&str> = raw.split('=').collect();
    let [key, value] = parts.as_slice() else {
        return None;
    };
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 1,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: key.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![value.to_string()]),
                        }]),
                        match_fields: None,
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Tolerations from `key=Operator:Effect[,...]`. Malformed entries are
/// logged and skipped.
pub fn parse_tolerations(raw: &str) -> Vec<Toleration> {
    let mut tolerations = Vec::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let Some((key, rest)) = entry.split_once('=') else {
            error!(toleration = %entry, "Badly formatted toleration");
            continue;
        };
        let Some((operator, effect)) = rest.split_once(':') else {
            error!(toleration = %entry, key = %key, "Toleration is missing operator or effect");
            continue;
        };
        if rest.contains('=') || effect.contains(':') {
            error!(toleration = %entry, "Badly formatted toleration");
            continue;
        }
        info!(key = %key, operator = %operator, effect = %effect, "Adding toleration");
        tolerations.push(Toleration {
            key: Some(key.trim().to_string()),
            operator: Some(operator.trim().to_string()),
            effect: Some(effect.trim().to_string()),
            ..Default::default()
        });
    }
    tolerations
}
