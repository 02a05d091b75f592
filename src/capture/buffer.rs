//! Bounded, append-only capture buffer

use crate::request::InterceptedRequest;

/// Result of pushing a request into a [`CaptureBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffer was already full; the request was dropped
    Rejected,
    /// Request appended, room remains
    Accepted,
    /// Request appended and the buffer is now full
    Filled,
}

/// Ordered sequence of accepted requests with a fixed capacity
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    entries: Vec<InterceptedRequest>,
    capacity: usize,
}

impl CaptureBuffer {
    /// Create an empty buffer
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        Self {
            entries: Vec::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a request unless the buffer is full
    pub fn push(&mut self, request: InterceptedRequest) -> PushOutcome {
        if self.is_full() {
            return PushOutcome::Rejected;
        }

        self.entries.push(request);
        if self.is_full() {
            PushOutcome::Filled
        } else {
            PushOutcome::Accepted
        }
    }

    /// Whether the buffer reached its capacity
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Number of buffered requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of requests
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered requests in capture order
    #[must_use]
    pub fn as_slice(&self) -> &[InterceptedRequest] {
        &self.entries
    }

    /// Copy of the buffered requests
    #[must_use]
    pub fn snapshot(&self) -> Vec<InterceptedRequest> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(i: usize) -> InterceptedRequest {
        InterceptedRequest::new(format!("https://example.com/{i}"), "GET")
    }

    #[test]
    fn test_push_until_full() {
        let mut buffer = CaptureBuffer::new(2);

        assert_eq!(buffer.push(request(0)), PushOutcome::Accepted);
        assert_eq!(buffer.push(request(1)), PushOutcome::Filled);
        assert_eq!(buffer.push(request(2)), PushOutcome::Rejected);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_single_slot() {
        let mut buffer = CaptureBuffer::new(1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.push(request(0)), PushOutcome::Filled);
        assert_eq!(buffer.snapshot()[0].url(), "https://example.com/0");
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panic() {
        let _ = CaptureBuffer::new(0);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..16, pushes in 0usize..64) {
            let mut buffer = CaptureBuffer::new(capacity);
            for i in 0..pushes {
                buffer.push(request(i));
                prop_assert!(buffer.len() <= capacity);
            }
            prop_assert_eq!(buffer.len(), pushes.min(capacity));
        }

        #[test]
        fn prop_preserves_order(capacity in 1usize..16, pushes in 0usize..32) {
            let mut buffer = CaptureBuffer::new(capacity);
            for i in 0..pushes {
                buffer.push(request(i));
            }
            for (i, entry) in buffer.as_slice().iter().enumerate() {
                prop_assert_eq!(entry.url(), format!("https://example.com/{i}"));
            }
        }
    }
}
