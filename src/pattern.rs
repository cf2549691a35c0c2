//! Address extraction from log lines.
//!
//! A source pattern is an ordinary regular expression containing the
//! placeholder token `<IP>`. The first placeholder becomes a named capture
//! for a dotted-quad; any further placeholders match the same shape without
//! capturing.

use regex::Regex;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::error::BanwatchError;

/// Placeholder token operators write in patterns.
pub const PLACEHOLDER: &str = "<IP>";

const ADDRESS_FRAGMENT: &str = r"\b(?:\d{1,3}\.){3}\d{1,3}\b";
const CAPTURE_NAME: &str = "address";

/// Compiled per-source pattern.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    source: String,
    regex: Regex,
}

impl PatternMatcher {
    /// Compile `pattern`.
    ///
    /// Fails with [`BanwatchError::InvalidPattern`] when the placeholder is
    /// missing or the expanded expression does not compile.
    pub fn new(pattern: &str) -> Result<Self, BanwatchError> {
        let Some((head, tail)) = pattern.split_once(PLACEHOLDER) else {
            return Err(BanwatchError::invalid_pattern(
                pattern,
                format!("missing address placeholder {}", PLACEHOLDER),
            ));
        };

        let expanded = format!(
            "{}(?P<{}>{}){}",
            head,
            CAPTURE_NAME,
            ADDRESS_FRAGMENT,
            tail.replace(PLACEHOLDER, &format!("(?:{})", ADDRESS_FRAGMENT))
        );

        let regex =
            Regex::new(&expanded).map_err(|e| BanwatchError::invalid_pattern(pattern, e))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written by the operator.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Extract the offending address from `line`, if the line matches.
    ///
    /// A capture that is not a valid IPv4 address (an octet above 255) is
    /// treated as no match.
    pub fn extract(&self, line: &str) -> Option<Ipv4Addr> {
        let caps = self.regex.captures(line)?;
        let text = caps.name(CAPTURE_NAME)?.as_str();
        match text.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                debug!(candidate = %text, "Captured text is not an IPv4 address");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_address() {
        let m = PatternMatcher::new(r"^test.*<IP>.*300$").unwrap();
        assert_eq!(
            m.extract("test 1.2.3.4 300"),
            Some(Ipv4Addr::new(1, 2, 3, 4))
        );
    }

    #[test]
    fn test_non_matching_line() {
        let m = PatternMatcher::new(r"^test.*<IP>.*300$").unwrap();
        assert_eq!(m.extract("test 1.2.3.4 301"), None);
        assert_eq!(m.extract("nothing here"), None);
    }

    #[test]
    fn test_sshd_style_pattern() {
        let m = PatternMatcher::new(r"Failed password for .* from <IP> port \d+").unwrap();
        let line = "Jan 10 12:00:00 host sshd[42]: Failed password for root from 203.0.113.9 port 51234 ssh2";
        assert_eq!(m.extract(line), Some(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn test_out_of_range_octet_is_no_match() {
        let m = PatternMatcher::new(r"from <IP>").unwrap();
        assert_eq!(m.extract("from 300.1.1.1"), None);
        assert_eq!(m.extract("from 10.0.0.256"), None);
    }

    #[test]
    fn test_first_placeholder_is_captured() {
        let m = PatternMatcher::new(r"<IP> -> <IP>").unwrap();
        assert_eq!(
            m.extract("10.0.0.1 -> 10.0.0.2"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(m.extract("10.0.0.1 -> nowhere"), None);
    }

    #[test]
    fn test_missing_placeholder_rejected() {
        let err = PatternMatcher::new(r"^Failed password").unwrap_err();
        assert!(matches!(err, BanwatchError::InvalidPattern { .. }));
        assert!(err.to_string().contains(PLACEHOLDER));
    }

    #[test]
    fn test_broken_regex_rejected() {
        let err = PatternMatcher::new(r"^(unclosed <IP>").unwrap_err();
        match err {
            BanwatchError::InvalidPattern { pattern, .. } => {
                assert_eq!(pattern, r"^(unclosed <IP>")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_as_str_keeps_operator_text() {
        let m = PatternMatcher::new(r"from <IP>").unwrap();
        assert_eq!(m.as_str(), "from <IP>");
    }

    #[test]
    fn test_address_must_be_whole_word() {
        let m = PatternMatcher::new(r"ip=\S*<IP>").unwrap();
        assert_eq!(m.extract("ip=1.2.3.4"), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(m.extract("ip=x1.2.3.4x"), None);
    }
}
