//! Deterministic engine that replays scripted page loads
//!
//! Each page is a list of [`PageEvent`]s played on a background "network"
//! thread when the page is loaded, the way a real engine reports requests from
//! its own threads. Script evaluation answers from a fixed list of results.
//! Sites can be described in TOML:
//!
//! ```toml
//! default_user_agent = "Replay/1.0"
//!
//! [[pages]]
//! url = "https://reader.example/chapter/1"
//! events = [
//!     { kind = "request", url = "https://reader.example/app.js" },
//!     { kind = "delay", ms = 20 },
//!     { kind = "request", url = "https://reader.example/ajax/read/1?vrf=AbC123" },
//!     { kind = "finished" },
//! ]
//!
//! [[script_results]]
//! kind = "value"
//! value = "token"
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::request::InterceptedRequest;
use crate::{Result, SnareError};

use super::{EngineClient, EngineFactory, RenderingEngine, ScriptCallback, BLANK_URL};

/// Identity string used when a site does not configure one
pub const DEFAULT_SCRIPTED_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) SnareScripted/1.0";

type SharedClient = Arc<Mutex<Option<Arc<dyn EngineClient>>>>;

/// One step of a scripted page load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageEvent {
    /// The page issues a request
    Request {
        /// Request URL
        url: String,
        /// HTTP method
        #[serde(default = "default_method")]
        method: String,
        /// Request headers; a `User-Agent` header is added if missing
        #[serde(default)]
        headers: Vec<(String, String)>,
        /// Optional request body
        #[serde(default)]
        body: Option<String>,
    },
    /// A navigation started (defaults to the page URL)
    Started {
        /// Navigated URL
        #[serde(default)]
        url: Option<String>,
    },
    /// A navigation finished (defaults to the page URL)
    Finished {
        /// Navigated URL
        #[serde(default)]
        url: Option<String>,
    },
    /// The page failed to load
    Error {
        /// Failure description
        message: String,
    },
    /// Pause before the next event
    Delay {
        /// Pause length in milliseconds
        ms: u64,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

/// Scripted behaviour of one URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedPage {
    /// URL the page answers to
    pub url: String,
    /// Events played after the implicit `started` event
    #[serde(default)]
    pub events: Vec<PageEvent>,
}

impl ScriptedPage {
    /// Create a page with no events
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events: Vec::new(),
        }
    }

    /// Append a GET request
    #[must_use]
    pub fn request(mut self, url: impl Into<String>) -> Self {
        self.events.push(PageEvent::Request {
            url: url.into(),
            method: default_method(),
            headers: Vec::new(),
            body: None,
        });
        self
    }

    /// Append a pause
    #[must_use]
    pub fn delay(mut self, ms: u64) -> Self {
        self.events.push(PageEvent::Delay { ms });
        self
    }

    /// Append a finished signal for the page URL
    #[must_use]
    pub fn finished(mut self) -> Self {
        self.events.push(PageEvent::Finished { url: None });
        self
    }

    /// Append a started/finished pair for another URL
    #[must_use]
    pub fn navigation(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.events.push(PageEvent::Started {
            url: Some(url.clone()),
        });
        self.events.push(PageEvent::Finished { url: Some(url) });
        self
    }

    /// Append a load failure
    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.events.push(PageEvent::Error {
            message: message.into(),
        });
        self
    }
}

/// Answer to a script evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptResult {
    /// No value at all
    Absent,
    /// A JavaScript `null`
    Null,
    /// A concrete value
    Value {
        /// Result text
        value: String,
    },
    /// The identity string the engine currently presents
    UserAgent,
}

/// A set of scripted pages plus script answers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedSite {
    /// Default identity string of engines serving this site
    pub default_user_agent: Option<String>,
    /// Scripted pages
    pub pages: Vec<ScriptedPage>,
    /// Answers to successive evaluations on one page; the last one repeats
    pub script_results: Vec<ScriptResult>,
}

impl ScriptedSite {
    /// Load a site description from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnareError::InvalidFixture(format!("Failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| SnareError::InvalidFixture(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Add a page
    #[must_use]
    pub fn with_page(mut self, page: ScriptedPage) -> Self {
        self.pages.push(page);
        self
    }

    /// Set the evaluation answers
    #[must_use]
    pub fn with_script_results(mut self, results: Vec<ScriptResult>) -> Self {
        self.script_results = results;
        self
    }

    /// Set the default identity string
    #[must_use]
    pub fn with_default_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.default_user_agent = Some(user_agent.into());
        self
    }

    /// Look up the page for `url`
    pub fn page(&self, url: &str) -> Option<&ScriptedPage> {
        self.pages.iter().find(|page| page.url == url)
    }
}

/// Observable counters shared by all engines of one factory
#[derive(Debug, Default)]
pub struct EngineStats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    resets: AtomicUsize,
    loads: Mutex<Vec<String>>,
    evaluations: Mutex<Vec<String>>,
    evaluated_at: Mutex<Vec<Instant>>,
    threads: Mutex<Vec<String>>,
}

impl EngineStats {
    /// Engines created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Engines destroyed (or dropped) so far
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Engines currently alive
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }

    /// Number of resets performed
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Every URL loaded, in order
    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().clone()
    }

    /// Every script evaluated, in order
    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations.lock().clone()
    }

    /// When each evaluation ran, in order
    pub fn evaluation_times(&self) -> Vec<Instant> {
        self.evaluated_at.lock().clone()
    }

    /// Names of the threads engine operations ran on
    pub fn threads(&self) -> Vec<String> {
        self.threads.lock().clone()
    }

    fn record_thread(&self) {
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        self.threads.lock().push(name);
    }
}

/// Factory for [`ScriptedEngine`]s with failure injection
pub struct ScriptedEngineFactory {
    site: Arc<ScriptedSite>,
    stats: Arc<EngineStats>,
    fail_create: AtomicBool,
    fail_destroy: Arc<AtomicBool>,
    destroy_delay_ms: Arc<AtomicU64>,
}

impl ScriptedEngineFactory {
    /// Create a factory serving `site`
    #[must_use]
    pub fn new(site: ScriptedSite) -> Self {
        Self {
            site: Arc::new(site),
            stats: Arc::new(EngineStats::default()),
            fail_create: AtomicBool::new(false),
            fail_destroy: Arc::new(AtomicBool::new(false)),
            destroy_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counters shared by every engine this factory creates
    #[must_use]
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Make the next [`create`](EngineFactory::create) fail
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make the next engine destruction fail
    pub fn fail_next_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    /// Stall every engine destruction by `delay`
    pub fn set_destroy_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.destroy_delay_ms.store(millis, Ordering::SeqCst);
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create(&self) -> Result<Box<dyn RenderingEngine>> {
        self.stats.record_thread();

        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(SnareError::unavailable("scripted engine refused to start"));
        }

        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            site: Arc::clone(&self.site),
            stats: Arc::clone(&self.stats),
            client: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            user_agent: None,
            cursor: 0,
            fail_destroy: Arc::clone(&self.fail_destroy),
            destroy_delay_ms: Arc::clone(&self.destroy_delay_ms),
            destroyed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Engine replaying a [`ScriptedSite`]
pub struct ScriptedEngine {
    site: Arc<ScriptedSite>,
    stats: Arc<EngineStats>,
    client: SharedClient,
    generation: Arc<AtomicU64>,
    user_agent: Option<String>,
    cursor: usize,
    fail_destroy: Arc<AtomicBool>,
    destroy_delay_ms: Arc<AtomicU64>,
    destroyed: bool,
}

impl ScriptedEngine {
    fn current_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .or_else(|| self.default_user_agent())
            .unwrap_or_else(|| DEFAULT_SCRIPTED_USER_AGENT.to_string())
    }

    fn next_result(&mut self) -> Option<String> {
        let last = self.site.script_results.len().checked_sub(1)?;
        let index = self.cursor.min(last);
        self.cursor += 1;

        match &self.site.script_results[index] {
            ScriptResult::Absent => None,
            ScriptResult::Null => Some("null".to_string()),
            ScriptResult::Value { value } => Some(value.clone()),
            ScriptResult::UserAgent => Some(self.current_user_agent()),
        }
    }

    fn mark_destroyed(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.client.lock().take();
            self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl RenderingEngine for ScriptedEngine {
    fn load_page(&mut self, url: &str) -> Result<()> {
        self.stats.record_thread();
        if self.destroyed {
            return Err(SnareError::unavailable("scripted engine already destroyed"));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.loads.lock().push(url.to_string());
        self.cursor = 0;

        let mut events = vec![PageEvent::Started { url: None }];
        match self.site.page(url) {
            Some(page) => events.extend(page.events.iter().cloned()),
            None => events.push(PageEvent::Finished { url: None }),
        }

        debug!("Scripted load of {} ({} events)", url, events.len());

        let page_url = url.to_string();
        let user_agent = self.current_user_agent();
        let client = Arc::clone(&self.client);
        let current = Arc::clone(&self.generation);

        thread::Builder::new()
            .name("scripted-network".to_string())
            .spawn(move || play(&events, &page_url, &user_agent, generation, &current, &client))
            .map_err(|e| SnareError::unavailable(format!("failed to start page thread: {e}")))?;

        Ok(())
    }

    fn stop_loading(&mut self) {
        self.stats.record_thread();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn evaluate_script(&mut self, script: &str, callback: ScriptCallback) {
        self.stats.record_thread();
        self.stats.evaluations.lock().push(script.to_string());
        self.stats.evaluated_at.lock().push(Instant::now());
        let result = self.next_result();
        callback(result);
    }

    fn set_client(&mut self, client: Option<Arc<dyn EngineClient>>) {
        *self.client.lock() = client;
    }

    fn set_user_agent(&mut self, user_agent: Option<&str>) -> Result<()> {
        self.user_agent = user_agent.map(str::to_owned);
        Ok(())
    }

    fn user_agent(&self) -> Option<String> {
        Some(self.current_user_agent())
    }

    fn default_user_agent(&self) -> Option<String> {
        Some(
            self.site
                .default_user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_SCRIPTED_USER_AGENT.to_string()),
        )
    }

    fn reset(&mut self) -> Result<()> {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
        self.stop_loading();
        self.set_client(None);
        self.set_user_agent(None)?;
        self.load_page(BLANK_URL)?;
        self.clear_history();
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.stats.record_thread();
        if self.destroyed {
            return Ok(());
        }

        let delay = self.destroy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }

        if self.fail_destroy.swap(false, Ordering::SeqCst) {
            return Err(SnareError::unavailable("scripted engine failed to shut down"));
        }

        self.mark_destroyed();
        Ok(())
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.mark_destroyed();
    }
}

fn play(
    events: &[PageEvent],
    page_url: &str,
    user_agent: &str,
    generation: u64,
    current: &AtomicU64,
    client: &Mutex<Option<Arc<dyn EngineClient>>>,
) {
    for event in events {
        if let PageEvent::Delay { ms } = event {
            thread::sleep(Duration::from_millis(*ms));
            continue;
        }

        if current.load(Ordering::SeqCst) != generation {
            trace!("Scripted load of {} superseded", page_url);
            return;
        }

        let Some(client) = client.lock().clone() else {
            continue;
        };

        match event {
            PageEvent::Request {
                url,
                method,
                headers,
                body,
            } => {
                let mut headers = headers.clone();
                if !headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
                {
                    headers.push(("User-Agent".to_string(), user_agent.to_string()));
                }
                let mut request = InterceptedRequest::new(url.as_str(), method.as_str())
                    .with_headers(headers);
                if let Some(body) = body {
                    request = request.with_body(body.clone().into_bytes());
                }
                client.on_request(request);
            }
            PageEvent::Started { url } => client.on_page_started(url.as_deref().unwrap_or(page_url)),
            PageEvent::Finished { url } => {
                client.on_page_finished(url.as_deref().unwrap_or(page_url));
            }
            PageEvent::Error { message } => client.on_page_error(page_url, message),
            PageEvent::Delay { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct ChannelClient(Mutex<mpsc::Sender<String>>);

    impl EngineClient for ChannelClient {
        fn on_request(&self, request: InterceptedRequest) {
            let ua = request.header("user-agent").unwrap_or_default().to_string();
            let _ = self.0.lock().send(format!("request {} ua={ua}", request.url()));
        }

        fn on_page_started(&self, url: &str) {
            let _ = self.0.lock().send(format!("started {url}"));
        }

        fn on_page_finished(&self, url: &str) {
            let _ = self.0.lock().send(format!("finished {url}"));
        }
    }

    fn engine_with(site: ScriptedSite) -> (Box<dyn RenderingEngine>, Arc<EngineStats>) {
        let factory = ScriptedEngineFactory::new(site);
        (factory.create().unwrap(), factory.stats())
    }

    #[test]
    fn test_plays_events_in_order() {
        let site = ScriptedSite::default().with_page(
            ScriptedPage::new("https://a/")
                .request("https://a/1")
                .request("https://a/2")
                .finished(),
        );
        let (mut engine, _) = engine_with(site.with_default_user_agent("UA/1"));
        let (tx, rx) = mpsc::channel();
        engine.set_client(Some(Arc::new(ChannelClient(Mutex::new(tx)))));

        engine.load_page("https://a/").unwrap();

        let seen: Vec<String> = rx.iter().take(4).collect();
        assert_eq!(
            seen,
            vec![
                "started https://a/",
                "request https://a/1 ua=UA/1",
                "request https://a/2 ua=UA/1",
                "finished https://a/",
            ]
        );
    }

    #[test]
    fn test_stop_loading_cancels_pending_events() {
        let site = ScriptedSite::default().with_page(
            ScriptedPage::new("https://a/")
                .delay(100)
                .request("https://a/late"),
        );
        let (mut engine, _) = engine_with(site);
        let (tx, rx) = mpsc::channel();
        engine.set_client(Some(Arc::new(ChannelClient(Mutex::new(tx)))));

        engine.load_page("https://a/").unwrap();
        assert_eq!(rx.recv().unwrap(), "started https://a/");
        engine.stop_loading();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_script_results_sequence() {
        let site = ScriptedSite::default().with_script_results(vec![
            ScriptResult::Null,
            ScriptResult::Value {
                value: "ready".to_string(),
            },
        ]);
        let (mut engine, stats) = engine_with(site);
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let tx = tx.clone();
            engine.evaluate_script("probe()", Box::new(move |value| tx.send(value).unwrap()));
        }

        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            results,
            vec![
                Some("null".to_string()),
                Some("ready".to_string()),
                Some("ready".to_string()),
            ]
        );
        assert_eq!(stats.evaluations().len(), 3);
    }

    #[test]
    fn test_user_agent_override_and_reset() {
        let (mut engine, stats) = engine_with(ScriptedSite::default());
        engine.set_user_agent(Some("Custom/1.0")).unwrap();
        assert_eq!(engine.user_agent().as_deref(), Some("Custom/1.0"));

        engine.reset().unwrap();
        assert_eq!(engine.user_agent(), engine.default_user_agent());
        assert_eq!(stats.resets(), 1);
        assert_eq!(stats.loads(), vec![BLANK_URL.to_string()]);
    }

    #[test]
    fn test_destroy_accounting() {
        let factory = ScriptedEngineFactory::new(ScriptedSite::default());
        let stats = factory.stats();

        let mut engine = factory.create().unwrap();
        assert_eq!(stats.live(), 1);
        engine.destroy().unwrap();
        assert_eq!(stats.live(), 0);
        assert!(engine.load_page("https://a/").is_err());

        drop(factory.create().unwrap());
        assert_eq!(stats.created(), 2);
        assert_eq!(stats.destroyed(), 2);
    }

    #[test]
    fn test_failure_injection() {
        let factory = ScriptedEngineFactory::new(ScriptedSite::default());
        factory.fail_next_create();
        assert!(factory.create().is_err());

        let mut engine = factory.create().unwrap();
        factory.fail_next_destroy();
        assert!(engine.destroy().is_err());
        assert!(engine.destroy().is_ok());
    }

    #[test]
    fn test_site_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
                default_user_agent = "Replay/1.0"

                [[pages]]
                url = "https://reader.example/chapter/1"
                events = [
                    { kind = "request", url = "https://reader.example/ajax/read/1?vrf=AbC123" },
                    { kind = "delay", ms = 5 },
                    { kind = "finished" },
                ]

                [[script_results]]
                kind = "value"
                value = "token"
            "#,
        )
        .unwrap();

        let site = ScriptedSite::from_file(file.path()).unwrap();
        assert_eq!(site.default_user_agent.as_deref(), Some("Replay/1.0"));
        let page = site.page("https://reader.example/chapter/1").unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(matches!(&page.events[0], PageEvent::Request { method, .. } if method == "GET"));
        assert_eq!(
            site.script_results,
            vec![ScriptResult::Value {
                value: "token".to_string()
            }]
        );
    }
}
