//! One interception run

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{InterceptionConfig, RequestCapture};
use crate::engine::{EngineClient, BLANK_URL};
use crate::pool::{AcquireMode, EngineHandle, Lease, Release, ResourcePool};
use crate::request::InterceptedRequest;
use crate::{Result, SnareError};

use super::{SessionState, StateCell, GUARD_MARGIN_MS};

/// Loads a page on a fresh engine and collects the requests it issues
///
/// A session runs once. It waits for the engine without a time limit, then
/// two timers race: the capture window stops capture and yields what was
/// buffered; the guard (window plus margin) resolves the call even if engine
/// teardown stalls. Both start once the engine is held.
pub struct InterceptionSession {
    pool: ResourcePool,
    config: InterceptionConfig,
    guard_margin: Duration,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl InterceptionSession {
    /// Create a session over `pool`
    #[must_use]
    pub fn new(pool: ResourcePool, config: InterceptionConfig) -> Self {
        Self {
            pool,
            config,
            guard_margin: Duration::from_millis(GUARD_MARGIN_MS),
            state: Arc::new(StateCell::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the guard margin
    #[must_use]
    pub fn with_guard_margin(mut self, margin: Duration) -> Self {
        self.guard_margin = margin;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Token that cancels this session
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Load `url` and return the captured requests in observation order
    ///
    /// Timing out is not an error: the requests captured so far are returned.
    /// Dropping the returned future cancels the run.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` before touching the engine if the configuration
    /// is rejected, `ResourceUnavailable` if the engine could not be created or
    /// torn down, and `Cancelled` if the session was cancelled
    pub async fn run(&self, url: &str) -> Result<Vec<InterceptedRequest>> {
        self.config.validate()?;

        if !self.state.advance(SessionState::Idle, SessionState::Loading) {
            return Err(SnareError::Other(format!(
                "interception session already {}",
                self.state.get()
            )));
        }

        let mut guard = RunGuard {
            state: &self.state,
            capture: None,
            armed: true,
        };

        let acquired = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SnareError::Cancelled),
            lease = self.pool.acquire(AcquireMode::Fresh) => lease,
        };
        let lease = match acquired {
            Ok(lease) => lease,
            Err(e) => {
                guard.armed = false;
                return Err(self.conclude_error(url, e));
            }
        };

        let capture = Arc::new(RequestCapture::new(&self.config));
        guard.capture = Some(Arc::clone(&capture));

        let deadline = self.config.timeout() + self.guard_margin;
        let outcome = tokio::time::timeout(deadline, self.drive(url, lease, &capture)).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(requests)) => {
                self.state.finish(SessionState::Completed);
                info!("Intercepted {} request(s) from {}", requests.len(), url);
                Ok(requests)
            }
            Ok(Err(e)) => Err(self.conclude_error(url, e)),
            Err(_) => {
                capture.stop();
                if self.cancel.is_cancelled() {
                    self.state.finish(SessionState::Cancelled);
                    return Err(SnareError::Cancelled);
                }
                self.state.finish(SessionState::Completed);
                warn!(
                    "Interception of {} hit the guard timeout after {:?}",
                    url, deadline
                );
                Ok(capture.snapshot())
            }
        }
    }

    fn conclude_error(&self, url: &str, e: SnareError) -> SnareError {
        if e.is_cancelled() {
            self.state.finish(SessionState::Cancelled);
            info!("Interception of {} cancelled", url);
        } else {
            self.state.finish(SessionState::Failed);
            warn!("Interception of {} failed: {}", url, e);
        }
        e
    }

    async fn drive(
        &self,
        url: &str,
        lease: Lease,
        capture: &Arc<RequestCapture>,
    ) -> Result<Vec<InterceptedRequest>> {
        let client = Arc::new(CaptureClient {
            capture: Arc::clone(capture),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            page_script: self.config.page_script().map(str::to_owned),
            injected: AtomicBool::new(false),
            handle: lease.handle(),
        });

        let page_url = url.to_string();
        let user_agent = self.config.user_agent.clone();
        let started = lease
            .with_engine(move |engine| {
                if let Some(user_agent) = &user_agent {
                    engine.set_user_agent(Some(user_agent))?;
                }
                engine.set_client(Some(client));
                engine.load_page(&page_url)
            })
            .await;

        if let Err(e) = started {
            capture.stop();
            if let Err(release_error) = lease.release(Release::Destroy).await {
                warn!("Failed to release engine: {}", release_error);
            }
            return Err(e);
        }
        debug!("{} loading {}", lease.operation(), url);

        let cancelled = tokio::select! {
            biased;
            () = self.cancel.cancelled() => true,
            reason = capture.completed() => {
                debug!("Capture finished: {:?}", reason);
                false
            }
            () = tokio::time::sleep(capture.remaining()) => {
                debug!("Capture window elapsed with {} request(s)", capture.len());
                false
            }
        };

        capture.stop();
        if !self
            .state
            .advance(SessionState::Capturing, SessionState::Completing)
        {
            self.state
                .advance(SessionState::Loading, SessionState::Completing);
        }
        let requests = capture.snapshot();

        let released = lease.release(Release::Destroy).await;
        if cancelled || self.cancel.is_cancelled() {
            if let Err(e) = released {
                warn!("Failed to release engine after cancellation: {}", e);
            }
            return Err(SnareError::Cancelled);
        }
        released?;

        Ok(requests)
    }
}

/// Ends the session as cancelled if the run future is dropped
struct RunGuard<'a> {
    state: &'a StateCell,
    capture: Option<Arc<RequestCapture>>,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(capture) = &self.capture {
                capture.stop();
            }
            if self.state.finish(SessionState::Cancelled) {
                debug!("Interception dropped before completion");
            }
        }
    }
}

struct CaptureClient {
    capture: Arc<RequestCapture>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    page_script: Option<String>,
    injected: AtomicBool,
    handle: EngineHandle,
}

impl EngineClient for CaptureClient {
    fn on_request(&self, request: InterceptedRequest) {
        if self.cancel.is_cancelled() {
            self.capture.stop();
            return;
        }

        self.state
            .advance(SessionState::Loading, SessionState::Capturing);
        self.capture.offer(request);
    }

    fn on_page_finished(&self, url: &str) {
        if url == BLANK_URL {
            return;
        }

        self.state
            .advance(SessionState::Loading, SessionState::Capturing);

        if let Some(script) = &self.page_script {
            if self
                .injected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("Injecting page script into {}", url);
                if let Err(e) = self.handle.inject(script) {
                    warn!("Failed to inject page script: {}", e);
                }
            }
        }
    }

    fn on_page_error(&self, url: &str, message: &str) {
        warn!("Page error on {}: {}", url, message);
        self.capture.stop();
    }
}
