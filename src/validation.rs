//! Centralized validation functions for banwatch.
//!
//! This module provides unified validation for:
//! - IPv4 addresses and CIDR ranges (ignore-list entries)
//! - Duration strings (`30s`, `10m`, `1h`, `7d`)
//! - Source identifiers

use anyhow::{bail, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Validate an IPv4 address string and return the parsed address.
///
/// # Examples
/// ```
/// use banwatch::validation::validate_ipv4;
/// assert!(validate_ipv4("192.168.1.1").is_ok());
/// assert!(validate_ipv4("::1").is_err());
/// assert!(validate_ipv4("invalid").is_err());
/// ```
pub fn validate_ipv4(ip_str: &str) -> Result<Ipv4Addr> {
    ip_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IPv4 address: {}", ip_str))
}

/// Validate an IPv4 address or CIDR string and return the parsed network.
///
/// A plain address (without /prefix) becomes a /32 network.
///
/// # Examples
/// ```
/// use banwatch::validation::validate_ipv4_or_cidr;
/// assert!(validate_ipv4_or_cidr("192.168.1.1").is_ok());
/// assert!(validate_ipv4_or_cidr("192.168.0.0/24").is_ok());
/// assert!(validate_ipv4_or_cidr("10.0.0.0/33").is_err());
/// ```
pub fn validate_ipv4_or_cidr(entry: &str) -> Result<Ipv4Net> {
    if entry.contains('/') {
        entry
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", entry))
    } else {
        let ip = validate_ipv4(entry)?;
        Ok(Ipv4Net::from(ip))
    }
}

/// Parse a duration string such as `30s`, `10m`, `4h` or `1d`.
///
/// Requires ASCII-only input to prevent Unicode-related edge cases.
///
/// # Examples
/// ```
/// use banwatch::validation::parse_interval;
/// use std::time::Duration;
/// assert_eq!(parse_interval("10m").unwrap(), Duration::from_secs(600));
/// assert!(parse_interval("10x").is_err());
/// ```
pub fn parse_interval(interval: &str) -> Result<Duration> {
    if interval.is_empty() {
        bail!("Interval cannot be empty");
    }

    if !interval.is_ascii() {
        bail!("Invalid interval '{}'. Only ASCII characters allowed", interval);
    }

    if interval.len() < 2 {
        bail!(
            "Invalid interval '{}'. Use format like '30s', '10m', '4h', '1d'",
            interval
        );
    }

    // ASCII-only, so slicing at len - 1 is on a char boundary
    let (num_part, suffix) = interval.split_at(interval.len() - 1);

    let unit: u64 = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => bail!(
            "Invalid interval '{}'. Suffix must be s, m, h, or d",
            interval
        ),
    };

    let value: u32 = num_part.parse().map_err(|_| {
        anyhow::anyhow!(
            "Invalid interval '{}'. Number part must be a positive integer",
            interval
        )
    })?;

    Ok(Duration::from_secs(u64::from(value) * unit))
}

/// Validate a source identifier: non-empty, ASCII alphanumerics, `-`, `_` or `.`.
pub fn validate_source_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("Source id cannot be empty");
    }
    if id.len() > 64 {
        bail!("Source id '{}' is longer than 64 characters", id);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
    {
        bail!(
            "Invalid source id '{}'. Use letters, digits, '-', '_' or '.'",
            id
        );
    }
    Ok(())
}

/// Serde helpers for durations written either as integer seconds or as an
/// interval string.
pub mod duration_serde {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_interval(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IntervalVisitor;

        impl<'de> Visitor<'de> for IntervalVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("seconds as an integer or an interval like '10m'")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(format!("negative duration: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_interval(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_any(IntervalVisitor)
    }
}

/// Format a duration with the largest unit that divides it exactly.
pub fn format_interval(d: Duration) -> String {
    let secs = d.as_secs();
    if secs != 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs != 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
