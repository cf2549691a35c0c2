//! Sample-config command implementation.

use crate::config::Config;

/// Print the commented default configuration
pub fn run() {
    print!("{}", Config::generate_default_yaml());
}
