use crate::guard::GuardIssue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("not initialized: run 'warden init'")]
    NotInitialized,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host already exists: {0}")]
    HostExists(String),

    #[error("host is disabled: {0}")]
    HostDisabled(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("action '{action}' is not in the current plan for host '{host}'")]
    ActionNotInPlan { host: String, action: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("confirm phrase mismatch: type '{expected}' to execute")]
    ConfirmPhraseMismatch { expected: String },

    #[error("execute requires a successful dry-run of '{action}' within the last {window_minutes} minutes")]
    DryRunRequired { action: String, window_minutes: u32 },

    #[error("action '{action}' is cooling down for another {remaining_minutes} minute(s)")]
    CooldownActive { action: String, remaining_minutes: i64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("queue backlog full: {0}")]
    BacklogFull(String),

    #[error("action '{action}' already has an active run ({run_id})")]
    ActionAlreadyActive { action: String, run_id: String },

    #[error("command guard rejected {} command(s): {}", .issues.len(), summarize_issues(.issues))]
    GuardRejected { issues: Vec<GuardIssue> },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Stable reason code recorded in run errors and audit metadata.
    pub fn code(&self) -> &'static str {
        match self {
            WardenError::NotInitialized => "not_initialized",
            WardenError::HostNotFound(_) => "host_not_found",
            WardenError::HostExists(_) => "host_exists",
            WardenError::HostDisabled(_) => "host_disabled",
            WardenError::RunNotFound(_) => "run_not_found",
            WardenError::ActionNotInPlan { .. } => "action_not_in_plan",
            WardenError::Forbidden(_) => "forbidden",
            WardenError::ConfirmPhraseMismatch { .. } => "confirm_phrase_mismatch",
            WardenError::DryRunRequired { .. } => "dry_run_required",
            WardenError::CooldownActive { .. } => "cooldown_active",
            WardenError::RateLimited(_) => "rate_limited",
            WardenError::BacklogFull(_) => "backlog_full",
            WardenError::ActionAlreadyActive { .. } => "already_active",
            WardenError::GuardRejected { .. } => "guard_rejected",
            WardenError::InvalidTransition { .. } => "invalid_transition",
            WardenError::InvalidValue(_) => "invalid_value",
            WardenError::Store(_) => "store_error",
            WardenError::Io(_) => "io_error",
            WardenError::Yaml(_) => "yaml_error",
            WardenError::Json(_) => "json_error",
        }
    }
}

fn summarize_issues(issues: &[GuardIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}#{} {}", i.list, i.index, i.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, WardenError>;
