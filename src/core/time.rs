//! Shared timestamp/event helpers for deterministic envelopes.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", Utc::now().timestamp())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Unix seconds as stored in the delegation tables.
pub fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

/// Inverse of [`to_unix`]; out-of-range values clamp to the epoch.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
