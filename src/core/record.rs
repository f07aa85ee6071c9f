// Stored record envelope: migration version, session lock id, and user data.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub migration_version: usize,
    #[serde(default)]
    pub lock_id: Option<String>,
    pub data: Value,
}

impl Record {
    pub fn new(migration_version: usize, lock_id: Option<String>, data: Value) -> Self {
        Self {
            migration_version,
            lock_id,
            data,
        }
    }

    pub fn decode(value: &Value) -> Result<Self, Error> {
        Record::deserialize(value).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("stored value is not a document record")
                .with_source(err)
        })
    }

    pub fn encode(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode document record")
                .with_source(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Record;
    use crate::core::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn record_uses_camel_case_fields() {
        let record = Record::new(2, Some("abc".to_string()), json!({"coins": 1}));
        let value = record.encode().expect("encode");
        assert_eq!(
            value,
            json!({"migrationVersion": 2, "lockId": "abc", "data": {"coins": 1}})
        );
    }

    #[test]
    fn missing_lock_id_decodes_as_unlocked() {
        let record = Record::decode(&json!({"migrationVersion": 0, "data": null})).expect("decode");
        assert_eq!(record.lock_id, None);
    }

    #[test]
    fn foreign_value_is_corrupt() {
        let err = Record::decode(&json!([1, 2, 3])).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
