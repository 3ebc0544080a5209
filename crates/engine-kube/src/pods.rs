//! Pod phase and readiness helpers

use k8s_openapi::api::core::v1::Pod;

use crate::RUN_LABEL;

/// Whether a pod has run to completion, successfully or not
pub fn is_terminated(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| {
            phase.eq_ignore_ascii_case("failed") || phase.eq_ignore_ascii_case("succeeded")
        })
}

/// Pods that still occupy a worker slot. A pod that has not reported any
/// status yet is not counted.
pub fn active_pods(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter()
        .filter(|p| p.status.is_some() && !is_terminated(p))
        .collect()
}

/// Pods whose phase is failed or succeeded
pub fn terminated_pods(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter().filter(|p| is_terminated(p)).collect()
}

/// Whether every container in the pod reports ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    match statuses {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|c| c.ready),
        _ => false,
    }
}

/// Run name a worker pod was launched for
pub fn run_name(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(RUN_LABEL))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}
