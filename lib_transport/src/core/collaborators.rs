//! # External Collaborators
//!
//! Interfaces the transport layer consumes from the host application. They are
//! injected through constructors; nothing in this crate reads a global session.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;

/// Source of the current identity.
///
/// `None` from [`SessionProvider::access_token`] means "cannot operate": the
/// transport components skip work quietly instead of reporting an error.
pub trait SessionProvider: Send + Sync {
    /// Current access token, if logged in.
    fn access_token(&self) -> Option<String>;
    /// Current user id, if logged in.
    fn user_id(&self) -> Option<u64>;
}

/// A session whose credentials are set explicitly (CLI, tests, or a host app
/// that pushes login/logout changes).
#[derive(Debug, Default)]
pub struct StaticSession {
    inner: RwLock<Option<(String, u64)>>,
}

impl StaticSession {
    /// Logged-in session.
    pub fn new(access_token: impl Into<String>, user_id: u64) -> Self {
        Self {
            inner: RwLock::new(Some((access_token.into(), user_id))),
        }
    }

    /// Session without credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replaces the credentials; `None` logs out.
    pub fn set(&self, credentials: Option<(String, u64)>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = credentials;
        }
    }
}

impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        self.inner.read().ok()?.as_ref().map(|(token, _)| token.clone())
    }

    fn user_id(&self) -> Option<u64> {
        self.inner.read().ok()?.as_ref().map(|(_, id)| *id)
    }
}

/// Local message store hook used after a full media download.
#[async_trait]
pub trait LocalPersistence: Send + Sync {
    /// Associates a downloaded file with the message it belongs to.
    async fn update_local_media_path(&self, item_id: u64, path: &Path) -> anyhow::Result<()>;
}

/// Persistence that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl LocalPersistence for NoopPersistence {
    async fn update_local_media_path(&self, _item_id: u64, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}
