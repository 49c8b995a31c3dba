use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::Store;

/// Makes a session id known to the relay before it is used.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Must be idempotent.
    async fn register_session(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
impl SessionRegistry for Store {
    async fn register_session(&self, session_id: &str) -> Result<()> {
        self.ensure_session(session_id)
            .await
            .with_context(|| format!("Failed to register session {session_id}"))?;
        Ok(())
    }
}

/// Where the visitor's current session id lives between visits.
pub trait IdentityCache: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, session_id: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryIdentityCache {
    slot: Mutex<Option<String>>,
}

impl IdentityCache for MemoryIdentityCache {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("identity cache poisoned"))?
            .clone())
    }

    fn save(&self, session_id: &str) -> Result<()> {
        *self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("identity cache poisoned"))? = Some(session_id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("identity cache poisoned"))? = None;
        Ok(())
    }
}

/// Keeps the session id in a single small file.
pub struct FileIdentityCache {
    path: PathBuf,
}

impl FileIdentityCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityCache for FileIdentityCache {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read session id from {}", self.path.display())),
        }
    }

    fn save(&self, session_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session cache directory")?;
        }
        std::fs::write(&self.path, session_id)
            .with_context(|| format!("Failed to write session id to {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to clear cached session id"),
        }
    }
}

/// Hands out the visitor's session id, creating and registering one on first use.
pub struct SessionProvider<C, R> {
    cache: C,
    registry: R,
}

impl<C: IdentityCache, R: SessionRegistry> SessionProvider<C, R> {
    pub fn new(cache: C, registry: R) -> Self {
        Self { cache, registry }
    }

    pub async fn get_or_create_session(&self) -> Result<String> {
        if let Some(id) = self.cache.load()? {
            debug!(session_id = %id, "Using cached session");
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        // Register before caching so a failed registration is retried next time.
        self.registry.register_session(&id).await?;
        self.cache.save(&id)?;
        info!(session_id = %id, "Started new chat session");
        Ok(id)
    }

    /// Forget the current session and start a fresh one. Old messages stay stored.
    pub async fn reset_session(&self) -> Result<String> {
        self.cache.clear()?;
        self.get_or_create_session().await
    }
}
