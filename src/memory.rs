use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// CacheKey – content hash of a call
// ---------------------------------------------------------------------------

/// Hash of a function name plus everything its result depends on.
#[derive(Clone)]
pub struct CacheKey {
    func_name: String,
    hasher: Sha256,
}

impl CacheKey {
    pub fn new(func_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(func_name.as_bytes());
        CacheKey {
            func_name: func_name.to_string(),
            hasher,
        }
    }

    /// Add a named scalar parameter.
    pub fn param(mut self, name: &str, value: impl Display) -> Self {
        self.hasher.update(format!("|{name}={value}").as_bytes());
        self
    }

    /// Add a stream of floats by bit pattern.
    pub fn floats<'a>(mut self, values: impl IntoIterator<Item = &'a f64>) -> Self {
        self.hasher.update(b"|f64:");
        for v in values {
            self.hasher.update(v.to_le_bytes());
        }
        self
    }

    pub fn indices<'a>(mut self, values: impl IntoIterator<Item = &'a usize>) -> Self {
        self.hasher.update(b"|usize:");
        for v in values {
            self.hasher.update((*v as u64).to_le_bytes());
        }
        self
    }

    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    /// Hex digest.
    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

// ---------------------------------------------------------------------------
// Memory – on-disk memoization
// ---------------------------------------------------------------------------

/// Disk cache for expensive, deterministic computations.
///
/// Results live in `<cachedir>/<func_name>/<digest>.json`. A `Memory` without
/// a directory computes every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    cachedir: Option<PathBuf>,
}

impl Memory {
    pub fn new(cachedir: Option<PathBuf>) -> Self {
        Memory { cachedir }
    }

    pub fn disabled() -> Self {
        Memory::default()
    }

    pub fn cachedir(&self) -> Option<&Path> {
        self.cachedir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.cachedir.is_some()
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.cachedir.as_ref().map(|dir| {
            dir.join(key.func_name())
                .join(format!("{}.json", key.digest()))
        })
    }

    /// Return the cached result for `key`, or run `compute` and store its
    /// `Ok` value.
    ///
    /// Cache read/write failures are logged and otherwise ignored.
    pub fn cache<T, E, F>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        self.cache_checked(key, |_| true, compute)
    }

    /// Like [`Memory::cache`], but a stored value is only reused when
    /// `is_valid` accepts it. Rejected entries are recomputed and overwritten.
    pub fn cache_checked<T, E, V, F>(
        &self,
        key: &CacheKey,
        is_valid: V,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        V: Fn(&T) -> bool,
        F: FnOnce() -> Result<T, E>,
    {
        let Some(path) = self.entry_path(key) else {
            return compute();
        };

        if path.exists() {
            match read_entry(&path) {
                Ok(value) if is_valid(&value) => {
                    log::debug!("cache hit: {}", path.display());
                    return Ok(value);
                }
                Ok(_) => log::warn!("ignoring inconsistent cache entry {}", path.display()),
                Err(e) => log::warn!("ignoring unreadable cache entry {}: {e}", path.display()),
            }
        }

        let value = compute()?;
        if let Err(e) = write_entry(&path, &value) {
            log::warn!("failed to write cache entry {}: {e}", path.display());
        } else {
            log::debug!("cache store: {}", path.display());
        }
        Ok(value)
    }

    /// Remove every cached entry.
    pub fn clear(&self) -> std::io::Result<()> {
        match &self.cachedir {
            Some(dir) if dir.exists() => fs::remove_dir_all(dir),
            _ => Ok(()),
        }
    }
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_entry<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn disabled_memory_always_computes() {
        let memory = Memory::disabled();
        assert!(!memory.is_enabled());
        assert_eq!(memory.cachedir(), None);
        let calls = Cell::new(0);
        let key = CacheKey::new("f").param("n", 3);
        for _ in 0..2 {
            let v: Result<u32, ()> = memory.cache(&key, || {
                calls.set(calls.get() + 1);
                Ok(7)
            });
            assert_eq!(v, Ok(7));
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn enabled_memory_reuses_results() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Memory::new(Some(dir.path().to_path_buf()));
        let calls = Cell::new(0);
        let key = CacheKey::new("f").floats(&[1.0, 2.0]);
        for _ in 0..3 {
            let v: Result<Vec<usize>, ()> = memory.cache(&key, || {
                calls.set(calls.get() + 1);
                Ok(vec![1, 2, 3])
            });
            assert_eq!(v, Ok(vec![1, 2, 3]));
        }
        assert_eq!(calls.get(), 1);

        memory.clear().unwrap();
        assert!(!dir.path().exists());
    }

    #[test]
    fn rejected_entries_are_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Memory::new(Some(dir.path().to_path_buf()));
        assert!(memory.is_enabled());
        assert_eq!(memory.cachedir(), Some(dir.path()));

        let key = CacheKey::new("f").param("n", 4);
        let stored: Result<u32, ()> = memory.cache(&key, || Ok(99));
        assert_eq!(stored, Ok(99));

        let calls = Cell::new(0);
        let v: Result<u32, ()> = memory.cache_checked(
            &key,
            |v: &u32| *v < 10,
            || {
                calls.set(calls.get() + 1);
                Ok(3)
            },
        );
        assert_eq!(v, Ok(3));
        assert_eq!(calls.get(), 1);

        // The recomputed value replaced the rejected one.
        let again: Result<u32, ()> = memory.cache(&key, || Ok(0));
        assert_eq!(again, Ok(3));
    }

    #[test]
    fn errors_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Memory::new(Some(dir.path().join("cache")));
        let key = CacheKey::new("g");
        let first: Result<u8, &str> = memory.cache(&key, || Err("boom"));
        assert_eq!(first, Err("boom"));
        let second: Result<u8, &str> = memory.cache(&key, || Ok(1));
        assert_eq!(second, Ok(1));
    }

    #[test]
    fn keys_depend_on_every_part() {
        let a = CacheKey::new("f").param("n", 1).digest();
        let b = CacheKey::new("f").param("n", 2).digest();
        let c = CacheKey::new("h").param("n", 1).digest();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, CacheKey::new("f").param("n", 1).digest());
    }
}
