//! Public operations over a shared engine pool

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::capture::InterceptionConfig;
use crate::config::Config;
use crate::engine::{factory_from_config, EngineFactory};
use crate::pool::ResourcePool;
use crate::request::InterceptedRequest;
use crate::session::{InterceptionSession, PollTiming, ScriptPoller, GUARD_MARGIN_MS};
use crate::Result;

/// Pattern matching the reader request that carries the VRF token
pub const VRF_PATTERN: &str = r"/ajax/read/.*[?&]vrf=([^&]+)";

/// Query parameter holding the VRF token
pub const VRF_PARAMETER: &str = "vrf";

/// Default window for VRF token extraction
pub const DEFAULT_VRF_TIMEOUT_MS: u64 = 15_000;

/// Default window for URL capture
pub const DEFAULT_URL_CAPTURE_TIMEOUT_MS: u64 = 30_000;

/// Identity string used when the engine cannot report one
pub const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Android 14; Mobile; rv:128.0) Gecko/128.0 Firefox/128.0";

/// Entry point for interception and script evaluation
///
/// Cheap to clone; clones share one engine pool, so their operations run one
/// at a time in arrival order.
#[derive(Clone)]
pub struct Extractor {
    pool: ResourcePool,
    timing: PollTiming,
    guard_margin: Duration,
    filter_capacity: usize,
    vrf_pattern: Arc<Regex>,
}

impl Extractor {
    /// Create an extractor over engines built by `factory`
    ///
    /// # Errors
    ///
    /// Returns error if the engine pool cannot be started
    pub fn new(factory: Arc<dyn EngineFactory>) -> Result<Self> {
        Ok(Self {
            pool: ResourcePool::new(factory)?,
            timing: PollTiming::default(),
            guard_margin: Duration::from_millis(GUARD_MARGIN_MS),
            filter_capacity: crate::capture::DEFAULT_MAX_REQUESTS,
            vrf_pattern: Arc::new(Regex::new(VRF_PATTERN)?),
        })
    }

    /// Create an extractor as described by a configuration
    ///
    /// # Errors
    ///
    /// Returns error if the engine backend cannot be built
    pub fn from_config(config: &Config) -> Result<Self> {
        let factory = factory_from_config(&config.engine)?;
        let mut extractor = Self::new(factory)?;
        extractor.timing = config.poller.timing();
        extractor.guard_margin = config.timeouts.guard_margin();
        extractor.filter_capacity = config.timeouts.filter_max_requests;
        Ok(extractor)
    }

    /// Override script poller timing
    #[must_use]
    pub fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Override the teardown margin granted beyond each window
    #[must_use]
    pub fn with_guard_margin(mut self, margin: Duration) -> Self {
        self.guard_margin = margin;
        self
    }

    /// The shared engine pool
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Load `url` and capture the requests admitted by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the engine is
    /// unavailable, or the run was cancelled
    pub async fn intercept_requests(
        &self,
        url: &str,
        config: InterceptionConfig,
    ) -> Result<Vec<InterceptedRequest>> {
        self.session(config).run(url).await
    }

    /// Capture requests whose URL satisfies a `return url.includes(...)` filter
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable
    pub async fn intercept_with_filter(
        &self,
        url: &str,
        filter_script: &str,
        timeout: Duration,
    ) -> Result<Vec<InterceptedRequest>> {
        let config = InterceptionConfig::new(duration_ms(timeout), self.filter_capacity)
            .with_filter_script(filter_script);
        self.intercept_requests(url, config).await
    }

    /// URL of the first request matching `pattern`, as a one-element list
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable
    pub async fn capture_urls(
        &self,
        url: &str,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let config =
            InterceptionConfig::new(duration_ms(timeout), 1).with_url_pattern(pattern.clone());
        let requests = self.intercept_requests(url, config).await?;

        Ok(requests
            .into_iter()
            .map(|request| request.url().to_string())
            .collect())
    }

    /// Decoded `vrf` query parameter of the first reader request `url` issues
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable
    pub async fn extract_vrf_token(&self, url: &str, timeout: Duration) -> Result<Option<String>> {
        let config = InterceptionConfig::new(duration_ms(timeout), 1)
            .with_url_pattern(self.vrf_pattern.as_ref().clone());
        let requests = self.intercept_requests(url, config).await?;

        let token = requests
            .first()
            .and_then(|request| request.query_parameter(VRF_PARAMETER));
        match &token {
            Some(_) => info!("Extracted VRF token from {}", url),
            None => debug!("No VRF token observed on {}", url),
        }
        Ok(token)
    }

    /// Evaluate `script`, after loading `base_url` if given
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable or could not be reset
    pub async fn evaluate_script(
        &self,
        base_url: Option<&str>,
        script: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        self.poller().evaluate(base_url, script, timeout).await
    }

    /// Like [`evaluate_script`](Self::evaluate_script), presenting `user_agent`
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable or could not be reset
    pub async fn evaluate_script_as(
        &self,
        base_url: Option<&str>,
        script: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Option<String>> {
        self.poller()
            .with_user_agent(user_agent)
            .evaluate(base_url, script, timeout)
            .await
    }

    /// Identity string the engine presents by default
    ///
    /// Falls back to [`FALLBACK_USER_AGENT`] if the engine cannot report one.
    pub async fn default_user_agent(&self) -> String {
        match self.pool.default_user_agent().await {
            Ok(Some(user_agent)) if !user_agent.trim().is_empty() => user_agent.trim().to_string(),
            Ok(_) => FALLBACK_USER_AGENT.to_string(),
            Err(e) => {
                warn!("Failed to query default user agent: {}", e);
                FALLBACK_USER_AGENT.to_string()
            }
        }
    }

    /// Session over the shared pool, for callers that need its cancel token
    #[must_use]
    pub fn session(&self, config: InterceptionConfig) -> InterceptionSession {
        InterceptionSession::new(self.pool.clone(), config).with_guard_margin(self.guard_margin)
    }

    /// Poller over the shared pool, for callers that need its cancel token
    #[must_use]
    pub fn poller(&self) -> ScriptPoller {
        ScriptPoller::new(self.pool.clone())
            .with_timing(self.timing)
            .with_guard_margin(self.guard_margin)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptedEngineFactory, ScriptedPage, ScriptedSite};

    #[test]
    fn test_vrf_pattern() {
        let pattern = Regex::new(VRF_PATTERN).unwrap();
        assert!(pattern.is_match("https://x/ajax/read/12?vrf=AbC123&x=1"));
        assert!(pattern.is_match("https://x/ajax/read/12?page=1&vrf=AbC123"));
        assert!(!pattern.is_match("https://x/ajax/list?vrf=AbC123"));
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_secs(15)), 15_000);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_extract_vrf_token_decodes() {
        let site = ScriptedSite::default().with_page(
            ScriptedPage::new("https://x/read")
                .request("https://x/ajax/list?vrf=wrong")
                .request("https://x/ajax/read/12?vrf=Ab%2BC%3D%3D&x=1")
                .finished(),
        );
        let extractor = Extractor::new(Arc::new(ScriptedEngineFactory::new(site))).unwrap();

        let token = extractor
            .extract_vrf_token("https://x/read", Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(token.as_deref(), Some("Ab+C=="));
    }

    #[tokio::test]
    async fn test_default_user_agent() {
        let site = ScriptedSite::default().with_default_user_agent("  Engine/3.1  ");
        let extractor = Extractor::new(Arc::new(ScriptedEngineFactory::new(site))).unwrap();
        assert_eq!(extractor.default_user_agent().await, "Engine/3.1");
    }

    #[tokio::test]
    async fn test_default_user_agent_fallback() {
        let factory = Arc::new(ScriptedEngineFactory::new(ScriptedSite::default()));
        factory.fail_next_create();
        let extractor = Extractor::new(factory).unwrap();
        assert_eq!(extractor.default_user_agent().await, FALLBACK_USER_AGENT);
    }
}
