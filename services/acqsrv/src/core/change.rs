//! Per-tag change detection
//!
//! A pure decision function over (previous record, fresh read, policy).
//! The same policy applies to every protocol; driver-native deadband
//! features stay disabled so behavior is uniform.

use chrono::{DateTime, Utc};
use edge_model::{ChangePolicy, DeadbandKind, Quality, Value};

/// Last published record for a tag
#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub value: Value,
    pub quality: Quality,
    pub ts: DateTime<Utc>,
}

impl LastSeen {
    pub fn new(value: Value, quality: Quality, ts: DateTime<Utc>) -> Self {
        Self { value, quality, ts }
    }
}

/// Decide whether a fresh read publishes
///
/// Rules evaluated in order:
/// 1. policy disabled
/// 2. no previous observation
/// 3. quality transition
/// 4. heartbeat due (>=, boundary counts)
/// 5. absolute deadband on numeric values
/// 6. percent deadband on numeric values, base = max(|prev|, 1)
/// 7. value inequality for everything else
///
/// Null on either side is treated as a change.
pub fn should_publish(
    prev: Option<&LastSeen>,
    value: &Value,
    quality: Quality,
    now: DateTime<Utc>,
    policy: &ChangePolicy,
) -> bool {
    if !policy.enabled {
        return true;
    }

    let prev = match prev {
        Some(prev) => prev,
        None => return true,
    };

    if prev.quality != quality {
        return true;
    }

    let elapsed_ms = now.signed_duration_since(prev.ts).num_milliseconds();
    if elapsed_ms >= policy.heartbeat_ms as i64 {
        return true;
    }

    if value.is_null() || prev.value.is_null() {
        return true;
    }

    if Value::both_numeric(&prev.value, value) && policy.deadband > 0.0 {
        // as_f64 cannot fail for numeric values
        let prev_num = prev.value.as_f64().unwrap_or(0.0);
        let new_num = value.as_f64().unwrap_or(0.0);
        let delta = (new_num - prev_num).abs();
        return match policy.deadband_kind {
            DeadbandKind::Absolute => delta >= policy.deadband,
            DeadbandKind::Percent => {
                let base = prev_num.abs().max(1.0);
                100.0 * delta / base >= policy.deadband
            },
        };
    }

    !Value::value_eq(&prev.value, value)
}
