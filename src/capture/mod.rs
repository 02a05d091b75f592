//! Request capture: bounded buffer, filter pipeline and interception config

mod buffer;
mod filter;
mod recorder;

use std::time::Duration;

use regex::Regex;

pub use buffer::{CaptureBuffer, PushOutcome};
pub use filter::RequestFilter;
pub use recorder::{RequestCapture, StopReason};

use crate::{Result, SnareError};

/// Default capture window
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 30_000;

/// Default capacity for script-filtered captures
pub const DEFAULT_MAX_REQUESTS: usize = 100;

/// Upper bound on capture capacity
pub const MAX_CAPTURE_CAPACITY: usize = 10_000;

/// Options for a single interception session
#[derive(Debug, Clone)]
pub struct InterceptionConfig {
    /// Capture window in milliseconds
    pub timeout_ms: u64,
    /// Capture capacity; capture stops as soon as it is reached
    pub max_requests: usize,
    /// Optional pre-filter, matched anywhere in the request URL
    pub url_pattern: Option<Regex>,
    /// Optional predicate script (see [`crate::predicate`])
    pub filter_script: Option<String>,
    /// Optional script injected once, on the first page-finished event
    pub page_script: Option<String>,
    /// Optional identity string used for this session only
    pub user_agent: Option<String>,
}

impl InterceptionConfig {
    /// Create a config with a capture window and capacity
    #[must_use]
    pub fn new(timeout_ms: u64, max_requests: usize) -> Self {
        Self {
            timeout_ms,
            max_requests,
            url_pattern: None,
            filter_script: None,
            page_script: None,
            user_agent: None,
        }
    }

    /// Only consider requests whose URL matches `pattern`
    #[must_use]
    pub fn with_url_pattern(mut self, pattern: Regex) -> Self {
        self.url_pattern = Some(pattern);
        self
    }

    /// Compile and set a URL pattern
    ///
    /// # Errors
    ///
    /// Returns error if the pattern is not a valid regular expression
    pub fn with_pattern_str(self, pattern: &str) -> Result<Self> {
        Ok(self.with_url_pattern(Regex::new(pattern)?))
    }

    /// Filter requests with a predicate script
    #[must_use]
    pub fn with_filter_script(mut self, script: impl Into<String>) -> Self {
        self.filter_script = Some(script.into());
        self
    }

    /// Inject a script once the page has finished loading
    #[must_use]
    pub fn with_page_script(mut self, script: impl Into<String>) -> Self {
        self.page_script = Some(script.into());
        self
    }

    /// Override the engine identity string for this session
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Capture window as a [`Duration`]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Page script, if one is set and not blank
    pub fn page_script(&self) -> Option<&str> {
        self.page_script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
    }

    /// Validate the config before a session touches the engine
    ///
    /// # Errors
    ///
    /// Returns error if the window or capacity is zero, or capacity is too large
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SnareError::InvalidConfig(
                "timeout_ms must be positive".to_string(),
            ));
        }

        if self.max_requests == 0 {
            return Err(SnareError::InvalidConfig(
                "max_requests must be positive".to_string(),
            ));
        }

        if self.max_requests > MAX_CAPTURE_CAPACITY {
            return Err(SnareError::InvalidConfig(format!(
                "max_requests {} exceeds limit of {MAX_CAPTURE_CAPACITY}",
                self.max_requests
            )));
        }

        Ok(())
    }
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_TIMEOUT_MS, DEFAULT_MAX_REQUESTS)
    }
}
