use std::{str::FromStr, time::Duration};

use tracing::warn;

/// Token-bucket burst bounding discovery invalidations.
pub const DISCOVERY_LIMITER_BURST: u32 = 30;

/// Runtime knobs. Every field has an environment override (see [`Settings::from_env`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `CTRLKIT_DISCOVERY_BURST`
    pub discovery_burst: u32,
    /// `CTRLKIT_DISCOVERY_REFILL_MS`: one token is added per interval.
    pub discovery_refill: Duration,
    /// `CTRLKIT_FIELD_MANAGER`
    pub field_manager: String,
    /// `CTRLKIT_FORCE_APPLY`
    pub force_apply: bool,
    /// `CTRLKIT_REQUEUE_SECS`
    pub requeue_after: Duration,
    /// `CTRLKIT_MAX_YAML_BYTES`
    pub max_yaml_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_burst: DISCOVERY_LIMITER_BURST,
            discovery_refill: Duration::from_secs(1),
            field_manager: "ctrlkit".to_string(),
            force_apply: false,
            requeue_after: Duration::from_secs(5),
            max_yaml_bytes: 1_000_000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut s = Self::default();
        if let Some(v) = parse(&lookup, "CTRLKIT_DISCOVERY_BURST") { s.discovery_burst = v; }
        if let Some(v) = parse::<u64>(&lookup, "CTRLKIT_DISCOVERY_REFILL_MS") { s.discovery_refill = Duration::from_millis(v.max(1)); }
        if let Some(v) = lookup("CTRLKIT_FIELD_MANAGER").filter(|v| !v.is_empty()) { s.field_manager = v; }
        if let Some(v) = lookup("CTRLKIT_FORCE_APPLY") { s.force_apply = v == "1" || v.eq_ignore_ascii_case("true"); }
        if let Some(v) = parse::<u64>(&lookup, "CTRLKIT_REQUEUE_SECS") { s.requeue_after = Duration::from_secs(v); }
        if let Some(v) = parse(&lookup, "CTRLKIT_MAX_YAML_BYTES") { s.max_yaml_bytes = v; }
        s
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
