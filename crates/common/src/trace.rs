//! Trace correlation carried from a send to every receive attempt.
//!
//! The `traceparent` header uses the W3C layout
//! `00-<32 hex trace id>-<16 hex span id>-01`. The span id on the wire is the
//! span of the send that produced the message, so every delivery of it,
//! retries included, names the same parent.

use std::fmt;

/// Identity of one span within a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
}

const VERSION: &str = "00";
const FLAGS: &str = "01";

impl TraceContext {
    /// Start a new trace.
    #[must_use]
    pub fn root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
        }
    }

    /// A new span in the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    /// Parse a `traceparent` value. Malformed values are ignored rather
    /// than failing the message.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let (version, trace_id, span_id, _flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some()
            || version != VERSION
            || !is_hex_id(trace_id, 32)
            || !is_hex_id(span_id, 16)
        {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn to_header(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{VERSION}-{}-{}-{FLAGS}", self.trace_id, self.span_id)
    }
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// All-zero ids are invalid.
fn is_hex_id(id: &str, len: usize) -> bool {
    id.len() == len && id.bytes().all(|b| b.is_ascii_hexdigit()) && id.bytes().any(|b| b != b'0')
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn header_value_parses_back() {
        let root = TraceContext::root();
        let header = root.to_header();
        assert_eq!(header.len(), 55);
        assert_eq!(TraceContext::parse(&header), Some(root));
    }

    #[test]
    fn child_keeps_the_trace_and_gets_a_new_span() {
        let root = TraceContext::root();
        let child = root.child();
        assert_eq!(child.trace_id(), root.trace_id());
        assert_ne!(child.span_id(), root.span_id());
        assert_eq!(child.span_id().len(), 16);
    }

    #[test]
    fn upper_case_ids_are_normalized() {
        let parsed =
            TraceContext::parse("00-4BF92F3577B34DA6A3CE929D0E0E4736-00F067AA0BA902B7-01").unwrap();
        assert_eq!(parsed.trace_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(parsed.span_id(), "00f067aa0ba902b7");
    }

    #[rstest]
    #[case::empty("")]
    #[case::unknown_version("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")]
    #[case::short_trace("00-4bf92f35-00f067aa0ba902b7-01")]
    #[case::zero_trace("00-00000000000000000000000000000000-00f067aa0ba902b7-01")]
    #[case::zero_span("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01")]
    #[case::not_hex("00-4bf92f3577b34da6a3ce929d0e0e473z-00f067aa0ba902b7-01")]
    #[case::trailing_part("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-ff")]
    fn malformed_values_are_ignored(#[case] value: &str) {
        assert_eq!(TraceContext::parse(value), None);
    }
}
