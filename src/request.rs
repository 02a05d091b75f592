//! Intercepted request snapshots

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Serialize, Serializer};

/// A request observed by the rendering engine before it was fulfilled
///
/// Snapshots are built once by the engine's interception hook and never mutated
/// afterwards; accessors hand out borrowed views only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterceptedRequest {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    timestamp: u64,
    #[serde(serialize_with = "serialize_body", skip_serializing_if = "Option::is_none")]
    body: Option<Bytes>,
}

impl InterceptedRequest {
    /// Create a snapshot stamped with the current wall-clock time
    #[must_use]
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
            timestamp: now_millis(),
            body: None,
        }
    }

    /// Attach request headers, preserving their order
    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override the capture timestamp (milliseconds since the Unix epoch)
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Full request URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request headers in the order the engine reported them
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Capture time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Request body, when the engine exposed one
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Decoded value of the first query parameter called `name`
    ///
    /// `+` is treated as an encoded space. Values that do not decode to UTF-8
    /// are returned as they appear in the URL.
    pub fn query_parameter(&self, name: &str) -> Option<String> {
        query_parameter(&self.url, name)
    }
}

/// Decoded value of the first query parameter called `name` in `url`
pub fn query_parameter(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    let query = query.split_once('#').map_or(query, |(query, _)| query);

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key) == name).then(|| decode_component(value))
        })
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn serialize_body<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match body {
        Some(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parameter_basic() {
        let request = InterceptedRequest::new("https://x/ajax/read/12?vrf=AbC123&x=1", "GET");
        assert_eq!(request.query_parameter("vrf").as_deref(), Some("AbC123"));
        assert_eq!(request.query_parameter("x").as_deref(), Some("1"));
        assert_eq!(request.query_parameter("missing"), None);
    }

    #[test]
    fn test_query_parameter_decoding() {
        let url = "https://x/ajax/read/1?vrf=a%2Fb%3D%3D&q=hello+world#frag";
        assert_eq!(query_parameter(url, "vrf").as_deref(), Some("a/b=="));
        assert_eq!(query_parameter(url, "q").as_deref(), Some("hello world"));
    }

    #[test]
    fn test_query_parameter_first_wins() {
        let url = "https://x/?vrf=first&vrf=second";
        assert_eq!(query_parameter(url, "vrf").as_deref(), Some("first"));
    }

    #[test]
    fn test_query_parameter_no_query() {
        assert_eq!(query_parameter("https://x/path", "vrf"), None);
        assert_eq!(query_parameter("https://x/?flag", "flag").as_deref(), Some(""));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = InterceptedRequest::new("https://x/", "POST")
            .with_headers(vec![("Content-Type".to_string(), "text/plain".to_string())])
            .with_body(&b"payload"[..]);

        assert_eq!(request.header("content-type"), Some("text/plain"));
        assert_eq!(request.body().map(|b| b.as_ref()), Some(&b"payload"[..]));
    }

    #[test]
    fn test_serialize_snapshot() {
        let request = InterceptedRequest::new("https://x/", "GET").with_timestamp(42);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["url"], "https://x/");
        assert_eq!(json["timestamp"], 42);
        assert!(json.get("body").is_none());
    }
}
