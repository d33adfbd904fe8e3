//! Collaborators shipped with the standalone daemon.

use async_trait::async_trait;
use lf_common::{Message, Severity};
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::action::Action;
use crate::error::{ActionError, ParseError, ResolveError};
use crate::preprocess::{MessageParser, ResolvedIdentity, SenderAuthorizer};

/// Largest valid PRI value (facility 23, severity 7).
const MAX_PRI: u16 = 191;

/// Parses the `<PRI>` prefix and an optional `TAG:` token.
///
/// A message without a PRI keeps the default facility and severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriParser;

impl MessageParser for PriParser {
    fn name(&self) -> &str {
        "pri"
    }

    fn parse(&self, message: &mut Message) -> Result<(), ParseError> {
        let raw = message.payload().into_owned();
        if raw.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let rest = match raw.strip_prefix('<') {
            Some(after) => {
                let end = after
                    .find('>')
                    .ok_or_else(|| ParseError::MalformedPri("missing '>'".to_string()))?;
                let digits = &after[..end];
                if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::MalformedPri(format!("'{}' is not a number", digits)));
                }
                let pri: u16 = digits
                    .parse()
                    .map_err(|_| ParseError::MalformedPri(digits.to_string()))?;
                if pri > MAX_PRI {
                    return Err(ParseError::MalformedPri(format!("{} is out of range", pri)));
                }
                message.facility = (pri / 8) as u8;
                message.severity = Severity::from_code((pri % 8) as u8).unwrap_or(Severity::Notice);
                &after[end + 1..]
            }
            None => raw.as_str(),
        };

        let rest = rest.trim_start();
        match rest.split_once(' ') {
            Some((tag, text)) if tag.ends_with(':') => {
                message.tag = Some(tag.to_string());
                message.text = Some(text.to_string());
            }
            _ => message.text = Some(rest.to_string()),
        }
        Ok(())
    }
}

/// Permits every sender and uses the address as its name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllSenders;

#[async_trait]
impl SenderAuthorizer for AllowAllSenders {
    async fn resolve_identity(&self, addr: IpAddr) -> Result<ResolvedIdentity, ResolveError> {
        let name: Arc<str> = Arc::from(addr.to_string());
        Ok(ResolvedIdentity {
            local_name: name.clone(),
            fqdn: name.clone(),
            ip: name,
        })
    }

    fn is_allowed_sender(&self, _protocol: &str, _addr: IpAddr, _resolved_name: &str) -> bool {
        true
    }
}

/// Writes each message as one line to stdout.
#[derive(Debug, Default)]
pub struct ConsoleAction {
    written: AtomicU64,
}

impl ConsoleAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn format_line(message: &Message) -> String {
        let host = message.hostname.as_deref().unwrap_or("-");
        let body = match (&message.tag, &message.text) {
            (Some(tag), Some(text)) => format!("{} {}", tag, text),
            (None, Some(text)) => text.clone(),
            _ => message.payload().into_owned(),
        };
        format!(
            "{} {} {}.{} {}",
            message.received_at.format("%Y-%m-%dT%H:%M:%S%.6f%:z"),
            host,
            message.facility,
            message.severity,
            body
        )
    }
}

#[async_trait]
impl Action for ConsoleAction {
    fn name(&self) -> &str {
        "console"
    }

    async fn process_batch(&self, messages: &[&Message]) -> Result<(), ActionError> {
        let mut out = std::io::stdout().lock();
        for message in messages {
            writeln!(out, "{}", Self::format_line(message))
                .map_err(|e| ActionError::new("console", e.to_string()))?;
            self.written.fetch_add(1, Ordering::Relaxed);
        }
        out.flush().map_err(|e| ActionError::new("console", e.to_string()))
    }

    async fn destroy(&self) -> Result<(), ActionError> {
        std::io::stdout()
            .flush()
            .map_err(|e| ActionError::new("console", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pri_parser_sets_priority_and_tag() {
        let mut msg = Message::new("<34>sshd[42]: login failed");
        PriParser.parse(&mut msg).unwrap();

        assert_eq!(msg.facility, 4);
        assert_eq!(msg.severity, Severity::Critical);
        assert_eq!(msg.tag.as_deref(), Some("sshd[42]:"));
        assert_eq!(msg.text.as_deref(), Some("login failed"));
    }

    #[test]
    fn test_pri_parser_without_pri_keeps_defaults() {
        let mut msg = Message::new("just text");
        PriParser.parse(&mut msg).unwrap();
        assert_eq!(msg.severity, Severity::Notice);
        assert_eq!(msg.text.as_deref(), Some("just text"));
        assert_eq!(msg.tag, None);
    }

    #[test]
    fn test_pri_parser_rejects_malformed() {
        for raw in ["<abc>x", "<192>x", "<13 no close", ""] {
            let mut msg = Message::new(raw);
            assert!(PriParser.parse(&mut msg).is_err(), "{:?} should fail", raw);
        }
    }

    #[tokio::test]
    async fn test_allow_all_senders() {
        let addr: IpAddr = "192.0.2.7".parse().unwrap();
        let identity = AllowAllSenders.resolve_identity(addr).await.unwrap();
        assert_eq!(&*identity.fqdn, "192.0.2.7");
        assert!(AllowAllSenders.is_allowed_sender("UDP", addr, &identity.fqdn));
    }

    #[test]
    fn test_console_line_format() {
        let mut msg = Message::new("<13>app: hello").with_hostname("web01");
        PriParser.parse(&mut msg).unwrap();
        let line = ConsoleAction::format_line(&msg);
        assert!(line.ends_with(" web01 1.notice app: hello"), "{}", line);
    }
}
