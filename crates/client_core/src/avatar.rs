//! Local, username-keyed avatar store consulted when users join the roster.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use tracing::warn;

pub trait AvatarCache: Send + Sync {
    fn load(&self, username: &str) -> Option<String>;
    fn store(&self, username: &str, avatar: &str) -> Result<()>;
    fn remove(&self, username: &str) -> Result<()>;
}

/// Cache that never holds anything; every lookup is absent.
pub struct NoAvatarCache;

impl AvatarCache for NoAvatarCache {
    fn load(&self, _username: &str) -> Option<String> {
        None
    }

    fn store(&self, _username: &str, _avatar: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _username: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAvatarCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryAvatarCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, username: &str, avatar: &str) -> Self {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(username.to_string(), avatar.to_string());
        self
    }
}

impl AvatarCache for MemoryAvatarCache {
    fn load(&self, username: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(username)
            .cloned()
    }

    fn store(&self, username: &str, avatar: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(username.to_string(), avatar.to_string());
        Ok(())
    }

    fn remove(&self, username: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(username);
        Ok(())
    }
}

/// One file per user under a directory, holding the avatar reference (a data URL).
pub struct DirectoryAvatarCache {
    dir: PathBuf,
}

impl DirectoryAvatarCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.dir
            .join(format!("airchat-avatar-{}", file_safe_name(username)))
    }
}

impl AvatarCache for DirectoryAvatarCache {
    fn load(&self, username: &str) -> Option<String> {
        let path = self.path_for(username);
        match fs::read_to_string(&path) {
            Ok(avatar) => Some(avatar.trim().to_string()).filter(|avatar| !avatar.is_empty()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read cached avatar");
                None
            }
        }
    }

    fn store(&self, username: &str, avatar: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create avatar directory '{}'", self.dir.display())
        })?;
        let path = self.path_for(username);
        fs::write(&path, avatar)
            .with_context(|| format!("failed to write avatar '{}'", path.display()))
    }

    fn remove(&self, username: &str) -> Result<()> {
        let path = self.path_for(username);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove avatar '{}'", path.display()))
            }
        }
    }
}

fn file_safe_name(username: &str) -> String {
    let mut out = String::with_capacity(username.len());
    for byte in username.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}
