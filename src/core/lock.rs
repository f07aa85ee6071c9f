// Session lock decisions applied inside remote update transforms.
// Pure functions: callers feed the current stored value and commit what comes back.
// A lock is live while its record was updated less than `expire` ago.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use getrandom::fill as fill_random;
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;

const LOCK_ID_BYTES: usize = 16;

/// Outcome of a successful claim: the record to write and whether one existed.
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    pub record: Record,
    pub existed: bool,
}

pub fn generate_lock_id() -> Result<String, Error> {
    let mut bytes = [0u8; LOCK_ID_BYTES];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate lock id: {err}"))
    })?;
    Ok(hex_encode(&bytes))
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

pub fn lock_is_live(updated_at_ms: u64, now_ms: u64, expire: Duration) -> bool {
    let expire_ms = u64::try_from(expire.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_sub(updated_at_ms) < expire_ms
}

/// Claims the record for `lock_id`. A missing record is created from `initial`.
/// Fails with `LockUnavailable` while another live lock is present.
pub fn claim(
    current: Option<&Value>,
    updated_at_ms: Option<u64>,
    lock_id: &str,
    expire: Duration,
    now_ms: u64,
    initial: impl FnOnce() -> Record,
) -> Result<Claim, Error> {
    let Some(current) = current else {
        let mut record = initial();
        record.lock_id = Some(lock_id.to_string());
        return Ok(Claim {
            record,
            existed: false,
        });
    };

    let mut record = Record::decode(current)?;
    if let Some(holder) = record.lock_id.as_deref()
        && holder != lock_id
        && lock_is_live(updated_at_ms.unwrap_or(now_ms), now_ms, expire)
    {
        return Err(Error::new(ErrorKind::LockUnavailable)
            .with_message("document is locked by another session")
            .with_hint("The lock frees when its holder closes the document or after it expires."));
    }
    record.lock_id = Some(lock_id.to_string());
    Ok(Claim {
        record,
        existed: true,
    })
}

/// Record to write when giving up the lock without touching data, or `None`
/// when the lock is not ours anymore.
pub fn release(current: Option<&Value>, lock_id: &str) -> Result<Option<Record>, Error> {
    let Some(current) = current else {
        return Ok(None);
    };
    let mut record = Record::decode(current)?;
    if record.lock_id.as_deref() != Some(lock_id) {
        return Ok(None);
    }
    record.lock_id = None;
    Ok(Some(record))
}

/// Record to write for a save. `keep_lock` is false for the closing write,
/// which persists and unlocks in one update.
pub fn persist(
    current: Option<&Value>,
    lock_id: &str,
    migration_version: usize,
    data: Value,
    keep_lock: bool,
) -> Result<Record, Error> {
    let holder = match current {
        Some(current) => Record::decode(current)?.lock_id,
        None => None,
    };
    if holder.as_deref() != Some(lock_id) {
        return Err(Error::new(ErrorKind::LockLost)
            .with_message("session lock was taken by another session")
            .with_hint("The lock expired before this document saved; reload it."));
    }
    let lock_id = keep_lock.then(|| lock_id.to_string());
    Ok(Record::new(migration_version, lock_id, data))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{claim, generate_lock_id, lock_is_live, persist, release};
    use crate::core::error::ErrorKind;
    use crate::core::record::Record;
    use serde_json::json;
    use std::time::Duration;

    const EXPIRE: Duration = Duration::from_secs(1800);

    fn locked(lock: &str) -> serde_json::Value {
        Record::new(1, Some(lock.to_string()), json!({"coins": 5}))
            .encode()
            .expect("encode")
    }

    #[test]
    fn lock_ids_are_unique_hex() {
        let a = generate_lock_id().expect("id");
        let b = generate_lock_id().expect("id");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn claim_creates_missing_record() {
        let claim = claim(None, None, "me", EXPIRE, 0, || {
            Record::new(3, None, json!({"coins": 100}))
        })
        .expect("claim");
        assert!(!claim.existed);
        assert_eq!(claim.record.lock_id.as_deref(), Some("me"));
        assert_eq!(claim.record.migration_version, 3);
    }

    #[test]
    fn claim_rejects_live_foreign_lock() {
        let current = locked("other");
        let err = claim(Some(&current), Some(1_000), "me", EXPIRE, 2_000, || {
            unreachable!()
        })
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::LockUnavailable);
    }

    #[test]
    fn claim_takes_expired_lock() {
        let current = locked("other");
        let now = 10 + EXPIRE.as_millis() as u64;
        let claim = claim(Some(&current), Some(10), "me", EXPIRE, now, || unreachable!())
            .expect("claim");
        assert!(claim.existed);
        assert_eq!(claim.record.lock_id.as_deref(), Some("me"));
        assert_eq!(claim.record.data, json!({"coins": 5}));
    }

    #[test]
    fn claim_reclaims_own_lock() {
        let current = locked("me");
        let claim = claim(Some(&current), Some(5), "me", EXPIRE, 6, || unreachable!());
        assert!(claim.is_ok());
    }

    #[test]
    fn release_only_clears_our_lock() {
        let ours = locked("me");
        let released = release(Some(&ours), "me").expect("release").expect("record");
        assert_eq!(released.lock_id, None);

        let theirs = locked("other");
        assert!(release(Some(&theirs), "me").expect("release").is_none());
        assert!(release(None, "me").expect("release").is_none());
    }

    #[test]
    fn persist_requires_lock() {
        let theirs = locked("other");
        let err = persist(Some(&theirs), "me", 1, json!({}), true).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::LockLost);

        let ours = locked("me");
        let closing = persist(Some(&ours), "me", 2, json!({"coins": 7}), false).expect("record");
        assert_eq!(closing.lock_id, None);
        assert_eq!(closing.migration_version, 2);
    }

    #[test]
    fn liveness_is_bounded_by_expiry() {
        assert!(lock_is_live(1_000, 1_500, Duration::from_secs(1)));
        assert!(!lock_is_live(1_000, 2_000, Duration::from_secs(1)));
    }

    #[test]
    fn huge_expiry_never_wraps() {
        assert!(lock_is_live(0, u64::MAX - 1, Duration::MAX));
        assert!(lock_is_live(1_000, 1_000 + 86_400_000, Duration::from_secs(u64::MAX)));
    }
}
