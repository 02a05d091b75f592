//! Request capture shared between the engine hook and the session

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::request::InterceptedRequest;

use super::{CaptureBuffer, InterceptionConfig, PushOutcome, RequestFilter};

/// Why capture stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The buffer reached its capacity
    Filled,
    /// Capture was stopped from outside (timeout, page error, cancellation)
    Stopped,
}

/// Filters incoming requests into a bounded buffer
///
/// [`offer`](Self::offer) is called from the engine's interception context,
/// [`snapshot`](Self::snapshot) from the orchestrating task. Both go through
/// the buffer lock; the lock is held across filtering so that the request
/// which fills the buffer is the last one ever evaluated.
pub struct RequestCapture {
    buffer: Mutex<CaptureBuffer>,
    filter: RequestFilter,
    capturing: AtomicBool,
    evaluated: AtomicUsize,
    started: Instant,
    window: Duration,
    done: watch::Sender<Option<StopReason>>,
}

impl RequestCapture {
    /// Create a capture for one session
    ///
    /// The capture window starts now, so build it once the engine is held.
    ///
    /// # Panics
    ///
    /// Panics if `config.max_requests` is 0
    #[must_use]
    pub fn new(config: &InterceptionConfig) -> Self {
        let (done, _) = watch::channel(None);

        Self {
            buffer: Mutex::new(CaptureBuffer::new(config.max_requests)),
            filter: RequestFilter::from_config(config),
            capturing: AtomicBool::new(true),
            evaluated: AtomicUsize::new(0),
            started: Instant::now(),
            window: config.timeout(),
            done,
        }
    }

    /// Filter decision for a request, without appending it
    pub fn should_capture(&self, request: &InterceptedRequest) -> bool {
        let buffer = self.buffer.lock();
        self.admits(&buffer, request)
    }

    /// Filter a request and append it if accepted
    ///
    /// Returns `true` if the request was captured. Filter panics are contained
    /// and count as a non-match.
    pub fn offer(&self, request: InterceptedRequest) -> bool {
        if !self.is_capturing() {
            return false;
        }

        if self.started.elapsed() > self.window {
            trace!("Capture window elapsed, ignoring {}", request.url());
            return false;
        }

        let mut buffer = self.buffer.lock();
        if !self.admits(&buffer, &request) {
            return false;
        }

        self.append_locked(&mut buffer, request)
    }

    /// Copy of the captured requests in observation order
    #[must_use]
    pub fn snapshot(&self) -> Vec<InterceptedRequest> {
        self.buffer.lock().snapshot()
    }

    /// Number of captured requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether nothing has been captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests that reached the filter
    #[must_use]
    pub fn evaluated(&self) -> usize {
        self.evaluated.load(Ordering::Relaxed)
    }

    /// Whether capture is still accepting requests
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    /// Time left in the capture window
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.started.elapsed())
    }

    /// Stop capturing
    ///
    /// Returns `true` for the call that actually stopped capture.
    pub fn stop(&self) -> bool {
        self.finish(StopReason::Stopped)
    }

    /// Reason capture stopped, if it has
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.done.borrow()
    }

    /// Wait until capture stops, by filling up or by [`stop`](Self::stop)
    pub async fn completed(&self) -> StopReason {
        let mut rx = self.done.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(StopReason::Stopped),
            Err(_) => StopReason::Stopped,
        };
        reason
    }

    fn admits(&self, buffer: &CaptureBuffer, request: &InterceptedRequest) -> bool {
        if buffer.is_full() || !self.is_capturing() {
            return false;
        }

        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let url = request.url();
        match catch_unwind(AssertUnwindSafe(|| self.filter.accepts(url))) {
            Ok(accepted) => {
                trace!(
                    "REQ {} {} match={}",
                    request.method(),
                    request.url(),
                    accepted
                );
                accepted
            }
            Err(_) => {
                warn!("Filter panicked for {}, treating as no match", url);
                false
            }
        }
    }

    fn append_locked(&self, buffer: &mut CaptureBuffer, request: InterceptedRequest) -> bool {
        let url = request.url().to_string();
        match buffer.push(request) {
            PushOutcome::Rejected => false,
            PushOutcome::Accepted => {
                debug!("Captured {} ({}/{})", url, buffer.len(), buffer.capacity());
                true
            }
            PushOutcome::Filled => {
                debug!(
                    "Captured {}, reached capacity ({}), stopping capture",
                    url,
                    buffer.capacity()
                );
                self.finish(StopReason::Filled);
                true
            }
        }
    }

    fn finish(&self, reason: StopReason) -> bool {
        if self
            .capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.done.send_replace(Some(reason));
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(url: &str) -> InterceptedRequest {
        InterceptedRequest::new(url, "GET")
    }

    #[test]
    fn test_capacity_stops_evaluation() {
        let capture = RequestCapture::new(&InterceptionConfig::new(10_000, 1));

        assert!(capture.offer(request("https://x/1")));
        assert!(!capture.offer(request("https://x/2")));

        assert_eq!(capture.len(), 1);
        assert_eq!(capture.evaluated(), 1);
        assert_eq!(capture.stop_reason(), Some(StopReason::Filled));
        assert_eq!(capture.snapshot()[0].url(), "https://x/1");
    }

    #[test]
    fn test_filtering_order() {
        let config = InterceptionConfig::new(10_000, 5)
            .with_pattern_str("ajax")
            .unwrap()
            .with_filter_script("return url.includes('vrf=');");
        let capture = RequestCapture::new(&config);

        assert!(!capture.offer(request("https://x/static.js?vrf=1")));
        assert!(!capture.offer(request("https://x/ajax/list")));
        assert!(capture.offer(request("https://x/ajax/read?vrf=1")));
        assert_eq!(capture.len(), 1);
        assert!(capture.is_capturing());
    }

    #[test]
    fn test_should_capture_does_not_append() {
        let capture = RequestCapture::new(&InterceptionConfig::new(10_000, 2));

        assert!(capture.should_capture(&request("https://x/1")));
        assert!(capture.is_empty());
    }

    #[test]
    fn test_stop_is_exactly_once() {
        let capture = RequestCapture::new(&InterceptionConfig::new(10_000, 3));

        assert!(capture.stop());
        assert!(!capture.stop());
        assert!(!capture.offer(request("https://x/late")));
        assert_eq!(capture.stop_reason(), Some(StopReason::Stopped));
    }

    #[test]
    fn test_requests_after_window_are_ignored() {
        let capture = RequestCapture::new(&InterceptionConfig::new(1, 3));
        std::thread::sleep(Duration::from_millis(5));

        assert!(!capture.offer(request("https://x/late")));
        assert_eq!(capture.evaluated(), 0);
    }

    #[test]
    fn test_concurrent_offers_respect_capacity() {
        let capture = Arc::new(RequestCapture::new(&InterceptionConfig::new(10_000, 7)));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let capture = Arc::clone(&capture);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        capture.offer(request(&format!("https://x/{t}/{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(capture.len(), 7);
        assert_eq!(capture.evaluated(), 7);
    }

    #[tokio::test]
    async fn test_completed_resolves_on_fill() {
        let capture = Arc::new(RequestCapture::new(&InterceptionConfig::new(10_000, 1)));

        let waiter = {
            let capture = Arc::clone(&capture);
            tokio::spawn(async move { capture.completed().await })
        };
        tokio::task::yield_now().await;
        capture.offer(request("https://x/1"));

        assert_eq!(waiter.await.unwrap(), StopReason::Filled);
    }

    #[tokio::test]
    async fn test_completed_after_stop() {
        let capture = RequestCapture::new(&InterceptionConfig::new(10_000, 1));
        capture.stop();
        assert_eq!(capture.completed().await, StopReason::Stopped);
    }
}
