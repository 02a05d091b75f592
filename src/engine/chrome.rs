//! Headless Chrome backend
//!
//! Requests are observed through the DevTools `Fetch` domain: every paused
//! request is reported to the client and then continued unchanged.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::browser::tab::RequestPausedDecision;
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::request::InterceptedRequest;
use crate::{Result, SnareError};

use super::{EngineClient, EngineFactory, RenderingEngine, ScriptCallback};

type SharedClient = Arc<Mutex<Option<Arc<dyn EngineClient>>>>;

const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn unavailable(context: &str, error: impl std::fmt::Display) -> SnareError {
    SnareError::unavailable(format!("{context}: {error}"))
}

/// Launches one Chrome process per engine
pub struct ChromeEngineFactory {
    headless: bool,
    path: Option<PathBuf>,
    args: Vec<String>,
    default_user_agent: Option<String>,
}

impl ChromeEngineFactory {
    /// Build a factory from the engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            headless: config.headless,
            path: config.chrome_path.clone(),
            args: config.chrome_args.clone(),
            default_user_agent: config.default_user_agent.clone(),
        }
    }
}

impl EngineFactory for ChromeEngineFactory {
    fn create(&self) -> Result<Box<dyn RenderingEngine>> {
        let args: Vec<&OsStr> = self.args.iter().map(OsStr::new).collect();
        let options = LaunchOptions::default_builder()
            .headless(self.headless)
            .path(self.path.clone())
            .args(args)
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| unavailable("invalid launch options", e))?;

        let browser = Browser::new(options).map_err(|e| unavailable("failed to launch chrome", e))?;
        let tab = browser
            .new_tab()
            .map_err(|e| unavailable("failed to open tab", e))?;

        let default_user_agent = match &self.default_user_agent {
            Some(user_agent) => user_agent.clone(),
            None => browser
                .get_version()
                .map_err(|e| unavailable("failed to query browser version", e))?
                .user_agent,
        };

        let client: SharedClient = Arc::new(Mutex::new(None));
        let current_url = Arc::new(Mutex::new(String::new()));
        install_hooks(&tab, &client, &current_url)?;

        debug!("Launched chrome engine");
        Ok(Box::new(ChromeEngine {
            _browser: browser,
            tab,
            client,
            current_url,
            default_user_agent,
            user_agent: None,
        }))
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}

fn install_hooks(tab: &Arc<Tab>, client: &SharedClient, current_url: &Arc<Mutex<String>>) -> Result<()> {
    tab.enable_fetch(None, None)
        .map_err(|e| unavailable("failed to enable request interception", e))?;

    let interceptor_client = Arc::clone(client);
    tab.enable_request_interception(Arc::new(
        move |_transport: Arc<Transport>, _session: SessionId, event: RequestPausedEvent| {
            let request = &event.params.request;
            let receiver = interceptor_client.lock().clone();
            if let Some(receiver) = receiver {
                let mut captured = InterceptedRequest::new(request.url.as_str(), request.method.as_str())
                    .with_headers(headers_of(request.headers.0.as_ref()));
                if let Some(body) = &request.post_data {
                    captured = captured.with_body(body.clone().into_bytes());
                }
                receiver.on_request(captured);
            }
            RequestPausedDecision::Continue(None)
        },
    ))
    .map_err(|e| unavailable("failed to install request interceptor", e))?;

    let listener_client = Arc::clone(client);
    let listener_url = Arc::clone(current_url);
    tab.add_event_listener(Arc::new(move |event: &Event| {
        if let Event::PageLoadEventFired(_) = event {
            let receiver = listener_client.lock().clone();
            if let Some(receiver) = receiver {
                let url = listener_url.lock().clone();
                receiver.on_page_finished(&url);
            }
        }
    }))
    .map_err(|e| unavailable("failed to install page listener", e))?;

    Ok(())
}

fn headers_of(headers: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = headers else {
        return Vec::new();
    };

    map.iter()
        .map(|(name, value)| {
            let value = value.as_str().map_or_else(|| value.to_string(), str::to_owned);
            (name.clone(), value)
        })
        .collect()
}

/// Script result as text: strings unquoted, `null` as `"null"`
fn script_value(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => Some("null".to_string()),
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// One Chrome process with a single tab
pub struct ChromeEngine {
    _browser: Browser,
    tab: Arc<Tab>,
    client: SharedClient,
    current_url: Arc<Mutex<String>>,
    default_user_agent: String,
    user_agent: Option<String>,
}

impl RenderingEngine for ChromeEngine {
    fn load_page(&mut self, url: &str) -> Result<()> {
        url.clone_into(&mut self.current_url.lock());

        let receiver = self.client.lock().clone();
        if let Some(receiver) = receiver {
            receiver.on_page_started(url);
        }

        self.tab
            .navigate_to(url)
            .map_err(|e| unavailable("navigation failed", e))?;
        Ok(())
    }

    fn stop_loading(&mut self) {
        if let Err(e) = self.tab.stop_loading() {
            warn!("Failed to stop loading: {}", e);
        }
    }

    fn evaluate_script(&mut self, script: &str, callback: ScriptCallback) {
        match self.tab.evaluate(script, false) {
            Ok(remote) => callback(script_value(remote.value)),
            Err(e) => {
                debug!("Script evaluation failed: {}", e);
                callback(None);
            }
        }
    }

    fn set_client(&mut self, client: Option<Arc<dyn EngineClient>>) {
        *self.client.lock() = client;
    }

    fn set_user_agent(&mut self, user_agent: Option<&str>) -> Result<()> {
        let effective = user_agent.unwrap_or(&self.default_user_agent);
        self.tab
            .set_user_agent(effective, None, None)
            .map_err(|e| unavailable("failed to set user agent", e))?;
        self.user_agent = user_agent.map(str::to_owned);
        Ok(())
    }

    fn user_agent(&self) -> Option<String> {
        Some(
            self.user_agent
                .clone()
                .unwrap_or_else(|| self.default_user_agent.clone()),
        )
    }

    fn default_user_agent(&self) -> Option<String> {
        Some(self.default_user_agent.clone())
    }

    fn destroy(&mut self) -> Result<()> {
        self.client.lock().take();
        self.tab
            .close(false)
            .map_err(|e| unavailable("failed to close tab", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_value_mapping() {
        assert_eq!(script_value(None), None);
        assert_eq!(script_value(Some(Value::Null)).as_deref(), Some("null"));
        assert_eq!(script_value(Some(json!("abc"))).as_deref(), Some("abc"));
        assert_eq!(script_value(Some(json!(42))).as_deref(), Some("42"));
        assert_eq!(script_value(Some(json!(true))).as_deref(), Some("true"));
    }

    #[test]
    fn test_headers_of() {
        let headers = json!({"User-Agent": "UA", "X-Count": 3});
        let mut parsed = headers_of(Some(&headers));
        parsed.sort();
        assert_eq!(
            parsed,
            vec![
                ("User-Agent".to_string(), "UA".to_string()),
                ("X-Count".to_string(), "3".to_string()),
            ]
        );
        assert!(headers_of(None).is_empty());
    }
}
