//! Evaluate a script until the page produces a value

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::engine::{EngineClient, BLANK_URL};
use crate::pool::{AcquireMode, Lease, Release, ResourcePool};
use crate::request::InterceptedRequest;
use crate::{Result, SnareError};

use super::{ready_value, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SETTLE_DELAY_MS, GUARD_MARGIN_MS};

/// Delays between page load and evaluations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    /// Pause after the page finished loading before the first evaluation
    pub settle_delay: Duration,
    /// Pause between evaluations
    pub poll_interval: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Loads a page on the pooled engine and polls a script
///
/// The engine is reused between calls and always reset before a call
/// resolves: loading stopped, client detached, blank page restored, history
/// cleared and the default identity string put back.
pub struct ScriptPoller {
    pool: ResourcePool,
    timing: PollTiming,
    user_agent: Option<String>,
    guard_margin: Duration,
    cancel: CancellationToken,
}

impl ScriptPoller {
    /// Create a poller over `pool`
    #[must_use]
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            pool,
            timing: PollTiming::default(),
            user_agent: None,
            guard_margin: Duration::from_millis(GUARD_MARGIN_MS),
            cancel: CancellationToken::new(),
        }
    }

    /// Override settle delay and poll interval
    #[must_use]
    pub fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Present `user_agent` while polling
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Bound on the reset performed before resolving
    #[must_use]
    pub fn with_guard_margin(mut self, margin: Duration) -> Self {
        self.guard_margin = margin;
        self
    }

    /// Token that cancels polling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Evaluate `script`, after loading `base_url` if given
    ///
    /// With a base URL the script is first evaluated once the page finished
    /// loading and settled, then repeatedly until it yields something other
    /// than nothing or `"null"`. Without one it is evaluated once, right away.
    /// Returns `None` when `timeout` (measured from the call) elapses first.
    ///
    /// # Errors
    ///
    /// Returns `ResourceUnavailable` if the engine could not be acquired or
    /// reset, and `Cancelled` if polling was cancelled
    pub async fn evaluate(
        &self,
        base_url: Option<&str>,
        script: &str,
        timeout_after: Duration,
    ) -> Result<Option<String>> {
        let guard = sleep(timeout_after);
        tokio::pin!(guard);

        let lease = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SnareError::Cancelled),
            () = guard.as_mut() => {
                debug!("Timed out waiting for the engine");
                return Ok(None);
            }
            lease = self.pool.acquire(AcquireMode::Reuse) => lease?,
        };

        let started = Instant::now();
        let outcome = match base_url.filter(|url| !url.is_empty()) {
            Some(url) => {
                self.poll_page(&lease, url, script, started, timeout_after, guard.as_mut())
                    .await
            }
            None => self.evaluate_once(&lease, script, guard.as_mut()).await,
        };

        match timeout(self.guard_margin, lease.release(Release::Reset)).await {
            Ok(Ok(())) => outcome,
            Ok(Err(e)) => {
                warn!("Failed to reset engine after polling: {}", e);
                outcome.and(Err(e))
            }
            Err(_) => {
                warn!("Engine reset did not finish within {:?}", self.guard_margin);
                outcome
            }
        }
    }

    async fn evaluate_once(
        &self,
        lease: &Lease,
        script: &str,
        guard: std::pin::Pin<&mut tokio::time::Sleep>,
    ) -> Result<Option<String>> {
        if let Some(user_agent) = self.user_agent.clone() {
            lease
                .with_engine(move |engine| engine.set_user_agent(Some(&user_agent)))
                .await?;
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SnareError::Cancelled),
            () = guard => Ok(None),
            value = lease.evaluate(script) => Ok(ready_value(value?)),
        }
    }

    async fn poll_page(
        &self,
        lease: &Lease,
        url: &str,
        script: &str,
        started: Instant,
        timeout_after: Duration,
        mut guard: std::pin::Pin<&mut tokio::time::Sleep>,
    ) -> Result<Option<String>> {
        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        let client = Arc::new(PollerClient {
            signals: signals_tx,
        });

        let page_url = url.to_string();
        let user_agent = self.user_agent.clone();
        lease
            .with_engine(move |engine| {
                engine.stop_loading();
                engine.clear_history();
                if let Some(user_agent) = &user_agent {
                    engine.set_user_agent(Some(user_agent))?;
                }
                engine.set_client(Some(client));
                engine.load_page(&page_url)
            })
            .await?;
        debug!("Polling {}", url);

        let mut loaded = false;
        let mut next_check: Option<Instant> = None;

        loop {
            let tick = async move {
                match next_check {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(SnareError::Cancelled),
                () = guard.as_mut() => {
                    debug!("Polling {} timed out", url);
                    return Ok(None);
                }
                Some(signal) = signals.recv() => match signal {
                    PageSignal::Started(at) => {
                        trace!("Page started: {}", at);
                        loaded = false;
                    }
                    PageSignal::Finished(at) => {
                        debug!("Page finished: {}", at);
                        loaded = true;
                        next_check = Some(Instant::now() + self.timing.settle_delay);
                    }
                },
                () = tick => {
                    if !loaded {
                        trace!("Waiting for page to finish loading");
                        next_check = Some(Instant::now() + self.timing.poll_interval);
                        continue;
                    }

                    let value = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(SnareError::Cancelled),
                        () = guard.as_mut() => return Ok(None),
                        value = lease.evaluate(script) => value?,
                    };

                    if let Some(value) = ready_value(value) {
                        debug!("Script produced a value after {:?}", started.elapsed());
                        return Ok(Some(value));
                    }

                    if started.elapsed() >= timeout_after {
                        debug!("Script never produced a value");
                        return Ok(None);
                    }

                    trace!("Script not ready, polling again");
                    next_check = Some(Instant::now() + self.timing.poll_interval);
                }
            }
        }
    }
}

#[derive(Debug)]
enum PageSignal {
    Started(String),
    Finished(String),
}

struct PollerClient {
    signals: mpsc::UnboundedSender<PageSignal>,
}

impl EngineClient for PollerClient {
    fn on_request(&self, _request: InterceptedRequest) {}

    fn on_page_started(&self, url: &str) {
        if url != BLANK_URL {
            let _ = self.signals.send(PageSignal::Started(url.to_string()));
        }
    }

    fn on_page_finished(&self, url: &str) {
        if url != BLANK_URL {
            let _ = self.signals.send(PageSignal::Finished(url.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, ScriptResult, ScriptedEngineFactory, ScriptedPage, ScriptedSite};

    const PAGE: &str = "https://reader.example/chapter/1";

    fn fast() -> PollTiming {
        PollTiming {
            settle_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn poller_with(site: ScriptedSite) -> (ScriptPoller, Arc<ScriptedEngineFactory>) {
        let factory = Arc::new(ScriptedEngineFactory::new(site));
        let pool = ResourcePool::new(Arc::clone(&factory) as Arc<dyn EngineFactory>).unwrap();
        (ScriptPoller::new(pool).with_timing(fast()), factory)
    }

    fn value(text: &str) -> ScriptResult {
        ScriptResult::Value {
            value: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_polls_until_ready() {
        let site = ScriptedSite::default()
            .with_page(ScriptedPage::new(PAGE).finished())
            .with_script_results(vec![ScriptResult::Null, ScriptResult::Absent, value("ready")]);
        let (poller, factory) = poller_with(site);

        let result = poller
            .evaluate(Some(PAGE), "window.token", Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("ready"));
        assert_eq!(factory.stats().evaluations().len(), 3);
        assert_eq!(factory.stats().resets(), 1);
    }

    #[tokio::test]
    async fn test_settle_delay_then_poll_interval() {
        let timing = PollTiming {
            settle_delay: Duration::from_millis(80),
            poll_interval: Duration::from_millis(40),
        };
        let load_delay = Duration::from_millis(100);
        let site = ScriptedSite::default()
            .with_page(ScriptedPage::new(PAGE).delay(100).finished())
            .with_script_results(vec![ScriptResult::Null, ScriptResult::Null, value("ready")]);
        let (poller, factory) = poller_with(site);
        let poller = poller.with_timing(timing);

        let called = std::time::Instant::now();
        let result = poller
            .evaluate(Some(PAGE), "window.token", Duration::from_secs(3))
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("ready"));
        let times = factory.stats().evaluation_times();
        assert_eq!(times.len(), 3);
        assert!(times[0] - called >= load_delay + timing.settle_delay);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= timing.poll_interval);
        }
    }

    #[tokio::test]
    async fn test_null_until_timeout() {
        let site = ScriptedSite::default()
            .with_page(ScriptedPage::new(PAGE).finished())
            .with_script_results(vec![ScriptResult::Null]);
        let (poller, _) = poller_with(site);

        let result = poller
            .evaluate(Some(PAGE), "window.token", Duration::from_millis(150))
            .await
            .unwrap();

        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_never_finishing_page_times_out() {
        let site = ScriptedSite::default()
            .with_page(ScriptedPage::new(PAGE).delay(5_000))
            .with_script_results(vec![value("too early")]);
        let (poller, factory) = poller_with(site);

        let result = poller
            .evaluate(Some(PAGE), "window.token", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(result, None);
        assert!(factory.stats().evaluations().is_empty());
    }

    #[tokio::test]
    async fn test_without_base_url_evaluates_once() {
        let site = ScriptedSite::default().with_script_results(vec![value("42")]);
        let (poller, factory) = poller_with(site);

        let result = poller
            .evaluate(None, "6 * 7", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("42"));
        assert!(factory.stats().loads().iter().all(|url| url == BLANK_URL));
    }

    #[tokio::test]
    async fn test_user_agent_is_restored() {
        let site = ScriptedSite::default()
            .with_default_user_agent("Default/1.0")
            .with_page(ScriptedPage::new(PAGE).finished())
            .with_script_results(vec![ScriptResult::UserAgent]);
        let (poller, _) = poller_with(site);
        let custom = ScriptPoller::new(poller.pool.clone())
            .with_timing(fast())
            .with_user_agent("Custom/9.0");

        let first = custom
            .evaluate(Some(PAGE), "navigator.userAgent", Duration::from_secs(1))
            .await
            .unwrap();
        let second = poller
            .evaluate(Some(PAGE), "navigator.userAgent", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first.as_deref(), Some("Custom/9.0"));
        assert_eq!(second.as_deref(), Some("Default/1.0"));
    }

    #[tokio::test]
    async fn test_cancelled_poll() {
        let site = ScriptedSite::default().with_page(ScriptedPage::new(PAGE).delay(5_000));
        let (poller, _) = poller_with(site);
        let token = poller.cancel_token();

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = poller
            .evaluate(Some(PAGE), "window.token", Duration::from_secs(5))
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(SnareError::Cancelled)));
    }
}
