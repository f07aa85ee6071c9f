// Validation and migration glue between stored JSON and typed document data.
// Migrations run on raw JSON in declared order; only those past the stored version run.
// User callbacks are isolated: errors and panics become typed failures.
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::error::{CallbackError, Error, ErrorKind};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), BoxError> + Send + Sync>;
pub type Migration = Arc<dyn Fn(Value) -> Result<Value, BoxError> + Send + Sync>;

pub struct Schema<T> {
    validate: Validator<T>,
    migrations: Vec<Migration>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            validate: Arc::clone(&self.validate),
            migrations: self.migrations.clone(),
        }
    }
}

impl<T> Schema<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(validate: Validator<T>, migrations: Vec<Migration>) -> Self {
        Self {
            validate,
            migrations,
        }
    }

    /// Version written next to data that has been through every migration.
    pub fn migration_count(&self) -> usize {
        self.migrations.len()
    }

    pub fn check(&self, data: &T) -> Result<(), Error> {
        match isolate(|| (self.validate)(data)) {
            Ok(()) => Ok(()),
            Err(reason) => Err(Error::new(ErrorKind::ValidationFailed)
                .with_message(format!("invalid data: {reason}"))
                .with_source(CallbackError(reason))),
        }
    }

    /// Applies migrations `from_version..` to `data`.
    pub fn migrate(&self, from_version: usize, mut data: Value) -> Result<Value, Error> {
        if from_version > self.migrations.len() {
            return Err(Error::new(ErrorKind::MigrationFailed)
                .with_message(format!(
                    "stored migration version {from_version} is newer than the {} known migrations",
                    self.migrations.len()
                ))
                .with_hint("The data was written by a newer schema; do not downgrade migrations."));
        }
        for (index, migration) in self.migrations.iter().enumerate().skip(from_version) {
            data = isolate(|| migration(data)).map_err(|reason| {
                Error::new(ErrorKind::MigrationFailed)
                    .with_message(format!("migration {} failed: {reason}", index + 1))
                    .with_source(CallbackError(reason))
            })?;
            debug!(migration = index + 1, "migration applied");
        }
        Ok(data)
    }

    pub fn decode(&self, value: Value) -> Result<T, Error> {
        serde_json::from_value(value).map_err(|err| {
            Error::new(ErrorKind::ValidationFailed)
                .with_message(format!("data does not match the document type: {err}"))
                .with_source(err)
        })
    }

    pub fn encode(&self, data: &T) -> Result<Value, Error> {
        serde_json::to_value(data).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode document data")
                .with_source(err)
        })
    }

    /// Stored JSON at `version` to validated, current-schema data.
    pub fn upgrade(&self, version: usize, value: Value) -> Result<T, Error> {
        let migrated = self.migrate(version, value)?;
        let data = self.decode(migrated)?;
        self.check(&data)?;
        Ok(data)
    }
}

/// Runs a user callback, turning both errors and panics into a message.
pub(crate) fn isolate<R>(callback: impl FnOnce() -> Result<R, BoxError>) -> Result<R, String> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::{BoxError, Migration, Schema, isolate};
    use crate::core::error::ErrorKind;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        coins: i64,
        #[serde(default)]
        gems: i64,
    }

    fn schema(migrations: Vec<Migration>) -> Schema<Profile> {
        Schema::new(
            Arc::new(|profile: &Profile| -> Result<(), BoxError> {
                if profile.coins < 0 {
                    return Err("coins must not be negative".into());
                }
                Ok(())
            }),
            migrations,
        )
    }

    fn add_field(name: &'static str, amount: i64) -> Migration {
        Arc::new(move |mut value: Value| -> Result<Value, BoxError> {
            value[name] = json!(amount);
            Ok(value)
        })
    }

    #[test]
    fn only_pending_migrations_run() {
        let schema = schema(vec![add_field("coins", 10), add_field("gems", 3)]);
        let upgraded = schema.upgrade(1, json!({"coins": 50})).expect("upgrade");
        assert_eq!(upgraded, Profile { coins: 50, gems: 3 });
    }

    #[test]
    fn migrations_run_in_order() {
        let double: Migration = Arc::new(|mut value: Value| -> Result<Value, BoxError> {
            let coins = value["coins"].as_i64().ok_or("coins missing")?;
            value["coins"] = json!(coins * 2);
            Ok(value)
        });
        let schema = schema(vec![add_field("coins", 4), double]);
        assert_eq!(schema.upgrade(0, json!({})).expect("upgrade").coins, 8);
    }

    #[test]
    fn failing_migration_is_typed() {
        let broken: Migration = Arc::new(|_: Value| Err::<Value, BoxError>("no".into()));
        let err = schema(vec![broken]).upgrade(0, json!({})).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert!(err.message().unwrap_or_default().contains("migration 1"));
    }

    #[test]
    fn panicking_migration_is_typed() {
        let broken: Migration = Arc::new(|_: Value| -> Result<Value, BoxError> { panic!("boom") });
        let err = schema(vec![broken]).migrate(0, json!({})).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert!(err.message().unwrap_or_default().contains("boom"));
    }

    #[test]
    fn newer_stored_version_is_rejected() {
        let err = schema(Vec::new()).migrate(2, json!({})).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
    }

    #[test]
    fn shape_mismatch_is_validation_failure() {
        let err = schema(Vec::new())
            .upgrade(0, json!({"coins": "lots"}))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn validator_rejection_is_validation_failure() {
        let err = schema(Vec::new())
            .check(&Profile { coins: -1, gems: 0 })
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.message().unwrap_or_default().contains("negative"));
    }

    #[test]
    fn isolate_passes_values_through() {
        assert_eq!(isolate(|| Ok::<_, BoxError>(3)), Ok(3));
    }
}
