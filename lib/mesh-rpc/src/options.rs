//! Per-call and per-subscription options

use crate::subject::{DEFAULT_QUEUE, DEFAULT_SUFFIX};
use mesh_api::CodeType;
use std::time::Duration;

/// Options for a subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group name, used by queue subscriptions only
    pub queue: String,
    pub code_type: CodeType,
    pub suffix: String,
    /// Spawn one task per inbound message instead of handling them in order
    pub parallel: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            code_type: CodeType::Binary,
            suffix: DEFAULT_SUFFIX.to_string(),
            parallel: true,
        }
    }
}

impl SubscribeOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_code_type(mut self, code_type: CodeType) -> Self {
        self.code_type = code_type;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Options for an outbound publish or request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOptions {
    pub code_type: CodeType,
    pub suffix: String,
    /// Queue group addressed by queue publishes and requests
    pub queue: String,
    /// Overrides the configured dial timeout
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            code_type: CodeType::Binary,
            suffix: DEFAULT_SUFFIX.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            timeout: None,
        }
    }
}

impl CallOptions {
    pub fn with_code_type(mut self, code_type: CodeType) -> Self {
        self.code_type = code_type;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.filter(|t| !t.is_zero()).unwrap_or(default)
    }
}
