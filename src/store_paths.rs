//! Purpose: Default store-directory resolution for the CLI.
//! Exports: `default_store_dir`.
//! Invariants: Default store directory remains `~/.lapis/stores`.

use std::path::PathBuf;

pub(crate) fn default_store_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".lapis").join("stores")
}

#[cfg(test)]
mod tests {
    use super::default_store_dir;

    #[test]
    fn default_dir_lives_under_dot_lapis() {
        let dir = default_store_dir();
        assert!(dir.ends_with(".lapis/stores"));
    }
}
