//! Check command: try a pattern against lines without running anything.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::net::Ipv4Addr;

use crate::ignore::IgnoreList;
use crate::pattern::PatternMatcher;

/// What a single line produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineVerdict {
    NoMatch,
    Match(Ipv4Addr),
    Ignored(Ipv4Addr),
}

pub fn check_line(matcher: &PatternMatcher, ignore: &IgnoreList, line: &str) -> LineVerdict {
    match matcher.extract(line) {
        None => LineVerdict::NoMatch,
        Some(addr) if ignore.is_ignored(addr) => LineVerdict::Ignored(addr),
        Some(addr) => LineVerdict::Match(addr),
    }
}

/// Run the check command
pub fn run(pattern: &str, ignore: &[String], lines: &[String]) -> Result<()> {
    let matcher = PatternMatcher::new(pattern)?;
    let ignore = IgnoreList::parse(ignore)?;

    let input: Vec<String> = if lines.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<_>>()
            .context("Failed to read lines from stdin")?
    } else {
        lines.to_vec()
    };

    let (mut matched, mut ignored) = (0, 0);
    for line in &input {
        match check_line(&matcher, &ignore, line) {
            LineVerdict::NoMatch => println!("  -       {}", line),
            LineVerdict::Match(addr) => {
                matched += 1;
                println!("  MATCH   {:<15} {}", addr, line);
            }
            LineVerdict::Ignored(addr) => {
                ignored += 1;
                println!("  IGNORED {:<15} {}", addr, line);
            }
        }
    }

    println!();
    println!(
        "{} line(s): {} match(es), {} ignored",
        input.len(),
        matched,
        ignored
    );
    Ok(())
}
