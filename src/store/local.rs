use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use tokio::sync::broadcast;
use tracing::debug;

/// Contract for the synchronous, profile-scoped key-value store.
///
/// Writes are durable before the call returns. [LocalStore::subscribe]
/// delivers the key of every change made through any handle sharing
/// the same backing store, including this handle's own writes, so one
/// open "tab" observes another's edits without a network round trip.
#[cfg_attr(test, mockall::automock)]
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<String>;
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Hash-map store. Clones share the map and the change channel, which
/// models several tabs over one browser profile.
#[derive(Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Arc::default(),
            changes,
        }
    }

    fn notify(&self, key: &str) {
        // No listeners is fine.
        let _ = self.changes.send(key.to_owned());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.notify(key);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// File-per-key store rooted at a directory. Values are opaque
/// strings; reads and writes take an advisory lock so another process
/// sharing the directory never observes a half-written value.
pub struct FileStore {
    dir: PathBuf,
    changes: broadcast::Sender<String>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {dir:?}"))?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { dir, changes })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn notify(&self, key: &str) {
        let _ = self.changes.send(key.to_owned());
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("opening {path:?}")),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        file.unlock()?;
        read.with_context(|| format!("reading {path:?}"))?;
        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        debug!("Writing {} bytes under {path:?}", value.len());
        let mut file = fs::File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {path:?} for writing"))?;
        file.lock_exclusive()?;
        let written = file
            .set_len(0)
            .and_then(|()| file.write_all(value.as_bytes()));
        file.unlock()?;
        written.with_context(|| format!("writing {path:?}"))?;
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => return Err(e).with_context(|| format!("removing {path:?}")),
        }
        self.notify(key);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
