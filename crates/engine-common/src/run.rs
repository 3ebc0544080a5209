//! Run model: lifecycle status, interrupt reasons and deferred archive actions

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Result recorded when a run is cancelled
pub const RESULT_CANCELLED: &str = "Cancelled";
/// Result recorded when a run is requeued
pub const RESULT_REQUEUED: &str = "Requeued";
/// Result recorded when a run stopped sending heartbeats
pub const RESULT_HUNG: &str = "Hung";
/// Result recorded when no worker could be launched for a run
pub const RESULT_ENV_FAIL: &str = "EnvFail";

/// Lifecycle status of a test run
///
/// Runs move forward from `Queued` to `Finished`. `Cancelling` is a side
/// branch a queued run enters while an interrupt is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// Waiting for a worker
    Queued,
    /// Claimed by a controller replica
    Allocated,
    /// Worker process has started
    Started,
    /// Worker is building the test environment
    Building,
    /// Provisioning has started
    ProvStart,
    /// Generating test resources
    Generating,
    /// Environment is up
    Up,
    /// Test methods are executing
    Running,
    /// Test methods have completed
    RunDone,
    /// Environment is being torn down
    Ending,
    /// Terminal state
    Finished,
    /// A queued run being cancelled
    Cancelling,
    /// Worker is waiting for resources
    Waiting,
}

impl RunStatus {
    /// Stored string form of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Allocated => "allocated",
            Self::Started => "started",
            Self::Building => "building",
            Self::ProvStart => "provstart",
            Self::Generating => "generating",
            Self::Up => "up",
            Self::Running => "running",
            Self::RunDone => "rundone",
            Self::Ending => "ending",
            Self::Finished => "finished",
            Self::Cancelling => "cancelling",
            Self::Waiting => "waiting",
        }
    }

    /// Whether a worker pod may exist for a run in this status
    pub fn may_have_worker(&self) -> bool {
        !matches!(self, Self::Queued | Self::Cancelling)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "allocated" => Self::Allocated,
            "started" => Self::Started,
            "building" => Self::Building,
            "provstart" => Self::ProvStart,
            "generating" => Self::Generating,
            "up" => Self::Up,
            "running" => Self::Running,
            "rundone" => Self::RunDone,
            "ending" => Self::Ending,
            "finished" => Self::Finished,
            "cancelling" => Self::Cancelling,
            "waiting" => Self::Waiting,
            _ => return Err(Error::UnknownStatus(s.to_string())),
        };
        Ok(status)
    }
}

/// Why a run was interrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// A user cancelled the run
    Cancelled,
    /// The run should be put back on the queue
    Requeued,
    /// The run stopped making progress
    Hung,
    /// A reason this controller does not act on
    Other(String),
}

impl InterruptReason {
    /// Parse a stored reason; blank values mean no interrupt
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let reason = if s.eq_ignore_ascii_case(RESULT_CANCELLED) {
            Self::Cancelled
        } else if s.eq_ignore_ascii_case(RESULT_REQUEUED) {
            Self::Requeued
        } else if s.eq_ignore_ascii_case(RESULT_HUNG) {
            Self::Hung
        } else {
            Self::Other(s.to_string())
        };
        Some(reason)
    }

    /// Stored string form, also used as the run result
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cancelled => RESULT_CANCELLED,
            Self::Requeued => RESULT_REQUEUED,
            Self::Hung => RESULT_HUNG,
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An archive status update recorded when the interrupt was requested and
/// applied once the interrupt is processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredArchiveAction {
    /// Archive record to update
    pub run_id: String,
    /// Status the record should end up in
    pub desired_run_status: String,
    /// Result the record should end up with
    pub desired_run_result: String,
}

/// Encode deferred actions as base64 of their JSON array
pub fn encode_actions(actions: &[DeferredArchiveAction]) -> Result<String> {
    let json = serde_json::to_vec(actions)
        .map_err(|e| Error::encoding("rasActions", e.to_string()))?;
    Ok(STANDARD.encode(json))
}

/// Decode deferred actions previously written with [`encode_actions`]
pub fn decode_actions(key: &str, encoded: &str) -> Result<Vec<DeferredArchiveAction>> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let json = STANDARD
        .decode(encoded)
        .map_err(|e| Error::encoding(key, e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| Error::encoding(key, e.to_string()))
}

/// Format a timestamp the way the store keeps them
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, ignoring malformed values
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A test run as recorded in the durable status store
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    /// Unique run name
    pub name: String,
    /// Current lifecycle status
    pub status: RunStatus,
    /// Final result, once known
    pub result: Option<String>,
    /// Set when someone asked for the run to be interrupted
    pub interrupt_reason: Option<InterruptReason>,
    /// When the interrupt was requested
    pub interrupted_at: Option<DateTime<Utc>>,
    /// When the run was queued
    pub queued: Option<DateTime<Utc>>,
    /// Last heartbeat from the worker
    pub heartbeat: Option<DateTime<Utc>>,
    /// When the run finished
    pub finished: Option<DateTime<Utc>>,
    /// Test bundle
    pub bundle: Option<String>,
    /// Fully qualified test class
    pub test: Option<String>,
    /// Requesting user
    pub requestor: Option<String>,
    /// Group the run was submitted in
    pub group: Option<String>,
    /// Submission identifier
    pub submission_id: Option<String>,
    /// Tags attached at submission
    pub tags: Vec<String>,
    /// Archive record id, when one was created
    pub archive_id: Option<String>,
    /// Archive updates to apply when the interrupt is processed
    pub deferred_actions: Vec<DeferredArchiveAction>,
    /// Local runs execute outside the cluster and are never scheduled here
    pub local: bool,
    /// Whether the worker should run with tracing enabled
    pub trace: bool,
}

impl Run {
    /// Create a queued run with no other attributes
    pub fn queued(name: impl Into<String>, queued: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: RunStatus::Queued,
            result: None,
            interrupt_reason: None,
            interrupted_at: None,
            queued: Some(queued),
            heartbeat: None,
            finished: None,
            bundle: None,
            test: None,
            requestor: None,
            group: None,
            submission_id: None,
            tags: Vec::new(),
            archive_id: None,
            deferred_actions: Vec::new(),
            local: false,
            trace: false,
        }
    }

    /// Seed a fresh archive record from this run
    pub fn to_test_structure(&self) -> TestStructure {
        let test_short_name = self
            .test
            .as_deref()
            .map(|t| t.rsplit('.').next().unwrap_or(t).to_string());
        TestStructure {
            run_name: self.name.clone(),
            bundle: self.bundle.clone(),
            test_name: self.test.clone(),
            test_short_name,
            requestor: self
                .requestor
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            status: Some(self.status.as_str().to_string()),
            result: None,
            group: self.group.clone(),
            submission_id: self.submission_id.clone(),
            queued: self.queued,
            start_time: None,
            end_time: None,
            log_record_ids: Vec::new(),
            artifact_record_ids: Vec::new(),
            tags: self.tags.clone(),
        }
    }
}

/// The document stored in the result archive for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStructure {
    /// Run name
    pub run_name: String,
    /// Test bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    /// Fully qualified test class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    /// Test class without its package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_short_name: Option<String>,
    /// Requesting user
    pub requestor: String,
    /// Archive status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Archive result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Submission group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Submission identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    /// When the run was queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    /// When the worker started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the worker finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Log record ids
    #[serde(default)]
    pub log_record_ids: Vec<String>,
    /// Artifact record ids
    #[serde(default)]
    pub artifact_record_ids: Vec<String>,
    /// Submission tags
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_strings_are_lowercase() {
        assert_eq!(RunStatus::ProvStart.as_str(), "provstart");
        assert_eq!("RUNDONE".parse::<RunStatus>().unwrap(), RunStatus::RunDone);
        assert!(matches!(
            "exploded".parse::<RunStatus>(),
            Err(Error::UnknownStatus(_))
        ));
    }

    #[test]
    fn only_running_statuses_may_have_worker() {
        assert!(!RunStatus::Queued.may_have_worker());
        assert!(!RunStatus::Cancelling.may_have_worker());
        assert!(RunStatus::Allocated.may_have_worker());
        assert!(RunStatus::Running.may_have_worker());
    }

    #[test]
    fn interrupt_reason_parsing() {
        assert_eq!(InterruptReason::parse(""), None);
        assert_eq!(
            InterruptReason::parse("Cancelled"),
            Some(InterruptReason::Cancelled)
        );
        assert_eq!(
            InterruptReason::parse("requeued"),
            Some(InterruptReason::Requeued)
        );
        assert_eq!(
            InterruptReason::parse("Paused"),
            Some(InterruptReason::Other("Paused".to_string()))
        );
    }

    #[test]
    fn deferred_actions_use_camel_case_json() {
        let actions = vec![DeferredArchiveAction {
            run_id: "cdb-1".to_string(),
            desired_run_status: "finished".to_string(),
            desired_run_result: RESULT_CANCELLED.to_string(),
        }];
        let encoded = encode_actions(&actions).unwrap();
        let json = STANDARD.decode(&encoded).unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(text.contains("\"runId\":\"cdb-1\""));
        assert!(text.contains("\"desiredRunStatus\":\"finished\""));
        assert_eq!(decode_actions("k", &encoded).unwrap(), actions);
    }

    #[test]
    fn decoding_garbage_reports_key() {
        let err = decode_actions("run.U1.rasActions", "%%%").unwrap_err();
        assert!(err.to_string().contains("run.U1.rasActions"));
        assert!(decode_actions("k", "  ").unwrap().is_empty());
    }

    #[test]
    fn timestamps_survive_the_store_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(format_timestamp(ts), "2024-05-01T12:30:00.000Z");
        assert_eq!(parse_timestamp("2024-05-01T12:30:00Z"), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_structure_seeded_from_run() {
        let queued = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut run = Run::queued("U42", queued);
        run.bundle = Some("dev.example.tests".to_string());
        run.test = Some("dev.example.tests.SimpleTest".to_string());
        run.group = Some("nightly".to_string());
        run.tags = vec!["smoke".to_string()];

        let structure = run.to_test_structure();
        assert_eq!(structure.run_name, "U42");
        assert_eq!(structure.test_short_name.as_deref(), Some("SimpleTest"));
        assert_eq!(structure.requestor, "unknown");
        assert_eq!(structure.queued, Some(queued));
        assert_eq!(structure.tags, vec!["smoke".to_string()]);
        assert!(structure.log_record_ids.is_empty());
    }
}
