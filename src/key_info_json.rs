//! Purpose: JSON view of a stored key for `lapis info`.
//! Exports: `key_info_json`.
//! Role: Keep the metadata envelope shape in one place.
//! Invariants: Stable key names; `exists: false` carries no other fields.
//! Invariants: Timestamps are RFC 3339 in UTC.

use lapis::api::{Config, Error, ErrorKind, KeyInfo};
use lapis::core::lock::{lock_is_live, now_unix_ms};
use lapis::core::record::Record;
use serde_json::{Map, Value, json};

pub(crate) fn key_info_json(
    store: &str,
    key: &str,
    entry: Option<&(Value, KeyInfo)>,
    config: &Config,
) -> Result<Value, Error> {
    let mut map = Map::new();
    map.insert("store".to_string(), json!(store));
    map.insert("key".to_string(), json!(key));
    let Some((value, info)) = entry else {
        map.insert("exists".to_string(), json!(false));
        return Ok(Value::Object(map));
    };

    let record = Record::decode(value).map_err(|err| err.with_key(key))?;
    let locked = record.lock_id.is_some()
        && lock_is_live(info.updated_at_ms, now_unix_ms(), config.lock_expire);
    map.insert("exists".to_string(), json!(true));
    map.insert("version".to_string(), json!(info.version));
    map.insert("created_at".to_string(), json!(format_ms(info.created_at_ms)?));
    map.insert("updated_at".to_string(), json!(format_ms(info.updated_at_ms)?));
    map.insert("user_ids".to_string(), json!(info.user_ids));
    map.insert("migration_version".to_string(), json!(record.migration_version));
    map.insert("locked".to_string(), json!(locked));
    Ok(Value::Object(map))
}

fn format_ms(timestamp_ms: u64) -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    let nanos = i128::from(timestamp_ms) * 1_000_000;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid timestamp")
            .with_source(err)
    })?;
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{format_ms, key_info_json};
    use lapis::api::{Config, ErrorKind, KeyInfo};
    use lapis::core::lock::now_unix_ms;
    use serde_json::json;

    fn info(updated_at_ms: u64) -> KeyInfo {
        KeyInfo {
            version: "abc".to_string(),
            created_at_ms: 0,
            updated_at_ms,
            user_ids: vec![4],
        }
    }

    #[test]
    fn missing_key_reports_absence_only() {
        let value = key_info_json("s", "k", None, &Config::default()).expect("json");
        assert_eq!(value, json!({"store": "s", "key": "k", "exists": false}));
    }

    #[test]
    fn fresh_lock_is_reported_as_held() {
        let record = json!({"migrationVersion": 1, "lockId": "me", "data": {}});
        let entry = (record, info(now_unix_ms()));
        let value = key_info_json("s", "k", Some(&entry), &Config::default()).expect("json");
        assert_eq!(value["locked"], true);
        assert_eq!(value["migration_version"], 1);
        assert_eq!(value["user_ids"], json!([4]));
        assert_eq!(value["created_at"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn expired_lock_is_reported_as_free() {
        let record = json!({"migrationVersion": 0, "lockId": "me", "data": {}});
        let entry = (record, info(1_000));
        let value = key_info_json("s", "k", Some(&entry), &Config::default()).expect("json");
        assert_eq!(value["locked"], false);
    }

    #[test]
    fn foreign_values_are_corrupt() {
        let entry = (json!([1, 2]), info(0));
        let err = key_info_json("s", "k", Some(&entry), &Config::default()).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn whole_seconds_format_without_fraction() {
        assert_eq!(format_ms(86_400_000).expect("format"), "1970-01-02T00:00:00Z");
    }
}
