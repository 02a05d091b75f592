//! Rendering engine abstraction
//!
//! An engine instance is thread-affine: it is created, driven and destroyed on
//! the pool's affinity thread only, so [`RenderingEngine`] does not require
//! `Send`. Events flow back through an [`EngineClient`], whose hooks may be
//! invoked from whatever thread the engine's network stack runs on.

#[cfg(feature = "chrome")]
mod chrome;
mod scripted;

use std::sync::Arc;

#[cfg(feature = "chrome")]
pub use chrome::{ChromeEngine, ChromeEngineFactory};
pub use scripted::{
    EngineStats, PageEvent, ScriptResult, ScriptedEngine, ScriptedEngineFactory, ScriptedPage,
    ScriptedSite,
};

use crate::config::{Backend, EngineConfig};
use crate::request::InterceptedRequest;
use crate::Result;

/// Placeholder page the engine shows between operations
pub const BLANK_URL: &str = "about:blank";

/// Completion callback for [`RenderingEngine::evaluate_script`]
///
/// Receives the script result as text: strings unquoted, a JavaScript `null`
/// as the literal `"null"`, and `None` when the engine produced no value.
pub type ScriptCallback = Box<dyn FnOnce(Option<String>) + Send>;

/// Receiver of engine events
pub trait EngineClient: Send + Sync {
    /// Called synchronously for every outgoing request, before it is fulfilled
    fn on_request(&self, request: InterceptedRequest);

    /// Navigation to `url` started
    fn on_page_started(&self, _url: &str) {}

    /// Navigation to `url` finished
    fn on_page_finished(&self, _url: &str) {}

    /// The page failed to load
    fn on_page_error(&self, _url: &str, _message: &str) {}
}

/// A page-rendering engine with request interception and script evaluation
pub trait RenderingEngine {
    /// Start navigating to `url`; completion is reported through the client
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejected the navigation
    fn load_page(&mut self, url: &str) -> Result<()>;

    /// Abort any pending navigation
    fn stop_loading(&mut self);

    /// Evaluate `script` in the current page and report the result
    fn evaluate_script(&mut self, script: &str, callback: ScriptCallback);

    /// Attach or detach the event receiver
    fn set_client(&mut self, client: Option<Arc<dyn EngineClient>>);

    /// Override the identity string, or restore the default with `None`
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejected the override
    fn set_user_agent(&mut self, user_agent: Option<&str>) -> Result<()>;

    /// Identity string the engine currently presents
    fn user_agent(&self) -> Option<String>;

    /// Identity string the engine presents by default
    fn default_user_agent(&self) -> Option<String>;

    /// Forget navigation history
    fn clear_history(&mut self) {}

    /// Bring the engine back to a neutral state for the next caller
    ///
    /// # Errors
    ///
    /// Returns error if the engine could not restore its defaults
    fn reset(&mut self) -> Result<()> {
        self.stop_loading();
        self.set_client(None);
        self.set_user_agent(None)?;
        self.load_page(BLANK_URL)?;
        self.clear_history();
        Ok(())
    }

    /// Release every resource held by the engine
    ///
    /// # Errors
    ///
    /// Returns error if the engine could not be shut down cleanly
    fn destroy(&mut self) -> Result<()>;
}

/// Creates engine instances on the affinity thread
pub trait EngineFactory: Send + Sync {
    /// Create a fresh engine instance
    ///
    /// # Errors
    ///
    /// Returns error if the engine could not be started
    fn create(&self) -> Result<Box<dyn RenderingEngine>>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Build the engine factory selected by the configuration
///
/// # Errors
///
/// Returns error if the replay fixture cannot be loaded or the backend was not
/// compiled in
pub fn factory_from_config(config: &EngineConfig) -> Result<Arc<dyn EngineFactory>> {
    match config.backend {
        Backend::Scripted => {
            let mut site = match &config.replay_file {
                Some(path) => ScriptedSite::from_file(path)?,
                None => ScriptedSite::default(),
            };
            if site.default_user_agent.is_none() {
                site.default_user_agent.clone_from(&config.default_user_agent);
            }
            Ok(Arc::new(ScriptedEngineFactory::new(site)))
        }
        #[cfg(feature = "chrome")]
        Backend::Chrome => Ok(Arc::new(ChromeEngineFactory::from_config(config))),
        #[cfg(not(feature = "chrome"))]
        Backend::Chrome => Err(crate::SnareError::ConfigError(
            "chrome backend requires the `chrome` feature".to_string(),
        )),
    }
}
