//! Bounded retry-with-rename for worker pod creation

use engine_kube::ClusterError;

/// Outcome of one pod-create attempt
#[derive(Debug)]
pub enum AttemptResult {
    /// The pod was created
    Created,
    /// A pod with that name already exists
    AlreadyExists,
    /// Any other failure
    Failed(String),
}

impl<T> From<&Result<T, ClusterError>> for AttemptResult {
    fn from(result: &Result<T, ClusterError>) -> Self {
        match result {
            Ok(_) => Self::Created,
            Err(e) if e.is_already_exists() => Self::AlreadyExists,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Why another attempt is needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// The name was taken; retry immediately under the new name
    NameConflict,
    /// Creation failed; back off and retry under the same name
    Transient(String),
}

/// What to do after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStep {
    /// A pod with this name is running the run
    Launched(String),
    /// Try again
    Retry(RetryReason),
    /// The attempt budget is spent
    GiveUp,
}

/// Tracks attempts and the current pod name for one run
#[derive(Debug, Clone)]
pub struct LaunchState {
    base_name: String,
    current_name: String,
    conflicts: u32,
    attempts: u32,
    max_attempts: u32,
}

impl LaunchState {
    /// Start with `base_name` and a budget of `max_attempts`
    pub fn new(base_name: impl Into<String>, max_attempts: u32) -> Self {
        let base_name = base_name.into();
        Self {
            current_name: base_name.clone(),
            base_name,
            conflicts: 0,
            attempts: 0,
            max_attempts,
        }
    }

    /// Name to use for the next attempt
    pub fn pod_name(&self) -> &str {
        &self.current_name
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no attempts remain
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Record the result of an attempt and decide what comes next
    pub fn record(&mut self, result: AttemptResult) -> LaunchStep {
        self.attempts += 1;
        match result {
            AttemptResult::Created => LaunchStep::Launched(self.current_name.clone()),
            _ if self.exhausted() => LaunchStep::GiveUp,
            AttemptResult::AlreadyExists => {
                self.conflicts += 1;
                self.current_name = format!("{}-{}", self.base_name, self.conflicts);
                LaunchStep::Retry(RetryReason::NameConflict)
            }
            AttemptResult::Failed(reason) => LaunchStep::Retry(RetryReason::Transient(reason)),
        }
    }
}
