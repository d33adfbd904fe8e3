//! The daemon's own diagnostic messages.

use lf_common::{FlowControl, Message, Severity};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics;

pub const PROGRAM_NAME: &str = "logflowd";

/// Facility code of messages generated by the daemon itself.
pub const SYSLOG_FACILITY: u8 = 5;

/// Replaces control characters (below 0x20, and DEL) with spaces.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if (c as u32) < 0x20 || c == '\x7f' { ' ' } else { c })
        .collect()
}

/// `logflowd:` or, with an error code, `logflowd{code}:` (e.g. `logflowd-2040:`).
pub fn internal_tag(err_code: Option<i32>) -> String {
    match err_code {
        Some(code) => format!("{}{}:", PROGRAM_NAME, code),
        None => format!("{}:", PROGRAM_NAME),
    }
}

/// The `[origin ...]` prefix of status messages.
pub fn origin_prefix() -> String {
    format!(
        " [origin software=\"{}\" swVersion=\"{}\" x-pid=\"{}\"]",
        PROGRAM_NAME,
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    )
}

/// Builds a ready-to-route internal message. It never needs parsing and
/// never blocks its producer.
pub fn internal_message(
    severity: Severity,
    err_code: Option<i32>,
    text: &str,
    hostname: Option<Arc<str>>,
) -> Message {
    let tag = internal_tag(err_code);
    let text = sanitize(text);
    let pri = u16::from(SYSLOG_FACILITY) * 8 + u16::from(severity.code());

    let mut message = Message::new(format!("<{}>{} {}", pri, tag, text))
        .with_severity(severity)
        .with_flow_control(FlowControl::NoDelay);
    message.facility = SYSLOG_FACILITY;
    message.hostname = hostname;
    message.tag = Some(tag);
    message.text = Some(text);
    message.flags.internal = true;
    message.flags.needs_parsing = false;
    message
}

/// Holding area for internal messages while no main queue exists.
/// When full, the newest message is dropped.
#[derive(Debug)]
pub struct InternalBuffer {
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
    dropped: AtomicU64,
}

impl InternalBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false if the buffer was full and `message` was dropped.
    pub fn push(&self, message: Message) -> bool {
        let mut messages = self.messages.lock();
        if messages.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_internal_dropped();
            return false;
        }
        messages.push_back(message);
        true
    }

    /// Takes everything buffered, oldest first.
    pub fn drain(&self) -> Vec<Message> {
        self.messages.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_control_characters() {
        assert_eq!(sanitize("line1\nline2\ttab\x7f!"), "line1 line2 tab !");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn test_internal_tag() {
        assert_eq!(internal_tag(None), "logflowd:");
        assert_eq!(internal_tag(Some(-2040)), "logflowd-2040:");
    }

    #[test]
    fn test_internal_message_fields() {
        let msg = internal_message(Severity::Error, None, "disk\nfull", Some(Arc::from("host1")));
        assert!(msg.flags.internal);
        assert!(!msg.flags.needs_parsing);
        assert_eq!(msg.flow_control, FlowControl::NoDelay);
        assert_eq!(msg.payload(), "<43>logflowd: disk full");
        assert_eq!(msg.text.as_deref(), Some("disk full"));
        assert_eq!(msg.hostname.as_deref(), Some("host1"));
    }

    #[test]
    fn test_buffer_drops_newest_when_full() {
        let buffer = InternalBuffer::new(2);
        assert!(buffer.push(Message::new("a")));
        assert!(buffer.push(Message::new("b")));
        assert!(!buffer.push(Message::new("c")));
        assert_eq!(buffer.dropped(), 1);

        let drained: Vec<_> = buffer.drain().iter().map(|m| m.payload().into_owned()).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(buffer.is_empty());
    }
}
