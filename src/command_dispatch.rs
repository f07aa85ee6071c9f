//! Purpose: Hold top-level CLI command dispatch for `lapis`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Documents opened by a command are closed before it returns, even on error.
//! Invariants: Command data is always a JSON object.

use super::*;

use lapis::api::{BoxError, Collection, CollectionOptions, FileStore, Lapis, RemoteStore};

use super::key_info_json::key_info_json;

pub(super) fn dispatch_command(
    command: Command,
    store_dir: PathBuf,
    config: Config,
) -> Result<RunOutcome, Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let output = runtime.block_on(run_command(command, store_dir, config))?;
    emit_json(output);
    Ok(RunOutcome::ok())
}

async fn run_command(command: Command, store_dir: PathBuf, config: Config) -> Result<Value, Error> {
    let store = FileStore::new(&store_dir);
    let lapis = Lapis::new(store.clone()).with_config(config.clone())?;
    match command {
        Command::Read { store, key } => {
            let data = json_collection(&lapis, &store)?.read(&key).await?;
            Ok(json!({ "store": store, "key": key, "data": data }))
        }
        Command::Write {
            store,
            key,
            data,
            user_ids,
        } => {
            let replacement = parse_inline_json(&data)?;
            let collection = json_collection(&lapis, &store)?;
            let data = edit(&collection, &key, &user_ids, Duration::ZERO, |data| {
                *data = replacement;
                Ok(data.clone())
            })
            .await?;
            Ok(json!({ "store": store, "key": key, "data": data }))
        }
        Command::Bump {
            store,
            key,
            field,
            by,
            user_ids,
            hold_ms,
        } => {
            let collection = json_collection(&lapis, &store)?;
            let hold = Duration::from_millis(hold_ms);
            let value = edit(&collection, &key, &user_ids, hold, |data| {
                let current = match data.get(&field) {
                    None | Some(Value::Null) => 0,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        Error::new(ErrorKind::Usage)
                            .with_message(format!("field {field:?} is not an integer"))
                            .with_key(key.as_str())
                    })?,
                };
                let next = current.checked_add(by).ok_or_else(|| {
                    Error::new(ErrorKind::Usage).with_message("integer overflow")
                })?;
                data[field.as_str()] = json!(next);
                Ok(json!(next))
            })
            .await?;
            Ok(json!({ "store": store, "key": key, "field": field, "value": value }))
        }
        Command::Info { store: name, key } => {
            let entry = store.open(&name)?.get(&key).await?;
            key_info_json(&name, &key, entry.as_ref(), &config)
        }
        Command::Remove { store, key } => {
            json_collection(&lapis, &store)?.remove(&key).await?;
            Ok(json!({ "store": store, "key": key, "removed": true }))
        }
    }
}

fn json_collection(lapis: &Lapis, name: &str) -> Result<Collection<Value>, Error> {
    let options = CollectionOptions::new(json!({})).validate(|data: &Value| -> Result<(), BoxError> {
        if data.is_object() {
            Ok(())
        } else {
            Err("document data must be a JSON object".into())
        }
    });
    lapis.create_collection(name, options)
}

/// Loads `key`, applies `apply`, and always closes. `hold` keeps the lock
/// before closing so contention can be observed from other processes.
async fn edit<F>(
    collection: &Collection<Value>,
    key: &str,
    user_ids: &[u64],
    hold: Duration,
    apply: F,
) -> Result<Value, Error>
where
    F: FnOnce(&mut Value) -> Result<Value, Error>,
{
    let document = collection.load(key, user_ids).await?;
    let edited = document.read().and_then(|mut data| {
        let output = apply(&mut data)?;
        document.write(data)?;
        Ok(output)
    });
    if !hold.is_zero() {
        tokio::time::sleep(hold).await;
    }
    let closed = document.close().await;
    let output = edited?;
    closed?;
    Ok(output)
}
