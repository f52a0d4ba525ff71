//! # Payload codec and hashing helpers
//!
//! Packing and unpacking never fail: a value that cannot be serialized packs to
//! `null`, and text that cannot be parsed unpacks to an empty object. Both cases
//! are logged as warnings.
//!
//! The hashing helpers are stable across processes and restarts, which is what
//! lets every process derive the same advisory lock key for a channel.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Serialized form of an absent or unserializable value
pub const NULL_JSON: &str = "null";

/// Namespace tag mixed into every channel lock key ("pgpubsub" in ASCII)
pub const LOCK_NAMESPACE: u64 = 0x7067_7075_6273_7562;

/// Serialize a value to compact JSON, degrading to `null` on failure
///
/// ```rust
/// use pg_pubsub::codec::pack;
/// use serde_json::json;
///
/// assert_eq!(pack(Some(&json!({"id": 1}))), r#"{"id":1}"#);
/// assert_eq!(pack::<serde_json::Value>(None), "null");
/// ```
pub fn pack<T: Serialize + ?Sized>(input: Option<&T>) -> String {
    pack_with(input, false)
}

/// Serialize a value to indented JSON, degrading to `null` on failure
pub fn pack_pretty<T: Serialize + ?Sized>(input: Option<&T>) -> String {
    pack_with(input, true)
}

fn pack_with<T: Serialize + ?Sized>(input: Option<&T>, pretty: bool) -> String {
    let Some(input) = input else {
        return NULL_JSON.to_string();
    };

    let packed = if pretty {
        serde_json::to_string_pretty(input)
    } else {
        serde_json::to_string(input)
    };

    packed.unwrap_or_else(|e| {
        warn!(error = %e, "pack() error");
        NULL_JSON.to_string()
    })
}

/// Deserialize JSON text, degrading to an empty object on failure
///
/// Absent input yields `Value::Null`.
///
/// ```rust
/// use pg_pubsub::codec::unpack;
/// use serde_json::json;
///
/// assert_eq!(unpack(Some("[1,2]")), json!([1, 2]));
/// assert_eq!(unpack(None), json!(null));
/// assert_eq!(unpack(Some("not json")), json!({}));
/// ```
pub fn unpack(input: Option<&str>) -> Value {
    let Some(input) = input else {
        return Value::Null;
    };

    serde_json::from_str(input).unwrap_or_else(|e| {
        warn!(error = %e, "unpack() error");
        Value::Object(Map::new())
    })
}

/// Hash of the ordered triple `(origin_id, channel, payload)`
///
/// Identical inputs produce identical signatures in every process.
pub fn signature(origin_id: i64, channel: &str, payload: &Value) -> u64 {
    let triple = Value::Array(vec![
        Value::from(origin_id),
        Value::from(channel),
        payload.clone(),
    ]);
    xxh3_64(triple.to_string().as_bytes())
}

/// Advisory lock key for a channel name
///
/// The 64-bit hash is seeded with [`LOCK_NAMESPACE`] so keys stay apart from
/// plain hashes other applications may use for their own advisory locks.
pub fn channel_key(channel: &str) -> i64 {
    xxh3_64_with_seed(channel.as_bytes(), LOCK_NAMESPACE) as i64
}
