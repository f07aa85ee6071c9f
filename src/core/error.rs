use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    AlreadyExists,
    LockUnavailable,
    LockLost,
    MigrationFailed,
    ValidationFailed,
    SaveFailed,
    BeforeSaveFailed,
    BeforeCloseFailed,
    Closed,
    AlreadySet,
    AlreadyOpen,
    Remote,
    Corrupt,
    Io,
    Permission,
}

/// Errors are cloned when one save outcome is delivered to every coalesced
/// caller, so the source chain is shared rather than boxed.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    key: Option<String>,
    path: Option<PathBuf>,
    attempts: Option<u32>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            key: None,
            path: None,
            attempts: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Re-labels an error while keeping the original as its source.
    pub(crate) fn wrap(kind: ErrorKind, inner: Error) -> Self {
        let key = inner.key.clone();
        let path = inner.path.clone();
        let attempts = inner.attempts;
        let message = inner.message.clone();
        let mut err = Error::new(kind).with_source(inner);
        err.key = key;
        err.path = path;
        err.attempts = attempts;
        err.message = message;
        err
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {key})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(attempts) = self.attempts {
            write!(f, " (attempts: {attempts})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Error produced by user callbacks (validators, migrations, hooks).
#[derive(Debug)]
pub(crate) struct CallbackError(pub(crate) String);

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for CallbackError {}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::AlreadyExists => 3,
        ErrorKind::LockUnavailable => 4,
        ErrorKind::LockLost => 5,
        ErrorKind::MigrationFailed => 6,
        ErrorKind::ValidationFailed => 7,
        ErrorKind::SaveFailed => 8,
        ErrorKind::BeforeSaveFailed => 9,
        ErrorKind::BeforeCloseFailed => 10,
        ErrorKind::Closed => 11,
        ErrorKind::AlreadySet => 12,
        ErrorKind::AlreadyOpen => 13,
        ErrorKind::Remote => 14,
        ErrorKind::Corrupt => 15,
        ErrorKind::Io => 16,
        ErrorKind::Permission => 17,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};
    use std::error::Error as StdError;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::LockUnavailable, 4),
            (ErrorKind::ValidationFailed, 7),
            (ErrorKind::SaveFailed, 8),
            (ErrorKind::Closed, 11),
            (ErrorKind::AlreadyOpen, 13),
            (ErrorKind::Permission, 17),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::LockUnavailable)
            .with_message("could not acquire lock")
            .with_key("Player1")
            .with_attempts(3);
        assert_eq!(
            err.to_string(),
            "LockUnavailable: could not acquire lock (key: Player1) (attempts: 3)"
        );
    }

    #[test]
    fn wrap_keeps_key_and_source() {
        let inner = Error::new(ErrorKind::Remote)
            .with_message("timeout")
            .with_key("k");
        let outer = Error::wrap(ErrorKind::SaveFailed, inner);
        assert_eq!(outer.kind(), ErrorKind::SaveFailed);
        assert_eq!(outer.key(), Some("k"));
        let source = outer.source().expect("source");
        assert!(source.to_string().contains("timeout"));
    }

    #[test]
    fn clones_share_source() {
        let err = Error::new(ErrorKind::Io).with_source(std::io::Error::other("disk"));
        let copy = err.clone();
        assert_eq!(
            copy.source().map(|source| source.to_string()),
            Some("disk".to_string())
        );
    }
}
