//! ID generation utilities for Scryer
//!
//! Owner tokens identify one daemon process run. Every mutating store call
//! presents the token, so a run whose lease was reclaimed cannot touch the
//! item again.

use chrono::Utc;
use rand::Rng;

/// Generate an owner token for this process run
///
/// Format: `{host}-{pid}-{random_hex}`
/// Example: `buildbox-4211-9f3a1c2e`
pub fn generate_owner_token() -> String {
    let random: u32 = rand::rng().random();
    format!("{}-{}-{:08x}", host_name(), std::process::id(), random)
}

/// Compact UTC stamp used for run directory names
///
/// Format: `YYYYmmddTHHMMSSZ`
pub fn run_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Best-effort host name without shelling out
fn host_name() -> String {
    let raw = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .unwrap_or_default();
    let clean: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    if clean.is_empty() { "host".to_string() } else { clean }
}
