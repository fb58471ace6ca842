//! Identity provider with fixed users and tokens.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use basalt_core::extension::{IdentityProvider, Result, UserInfo};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Directory {
    users: HashMap<String, UserInfo>,
    /// token -> user id
    tokens: HashMap<String, String>,
    /// (user id, permission)
    grants: HashSet<(String, String)>,
}

/// In-memory identity provider for tests.
#[derive(Debug, Default)]
pub struct MockIdentity {
    directory: RwLock<Directory>,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` and a bearer `token` that resolves to it.
    pub fn with_user(self, user: UserInfo, token: impl Into<String>) -> Self {
        self.add_user(user, token);
        self
    }

    pub fn add_user(&self, user: UserInfo, token: impl Into<String>) {
        let mut dir = self.directory.write();
        dir.tokens.insert(token.into(), user.id.clone());
        dir.users.insert(user.id.clone(), user);
    }

    pub fn grant(&self, user_id: impl Into<String>, permission: impl Into<String>) {
        self.directory
            .write()
            .grants
            .insert((user_id.into(), permission.into()));
    }

    pub fn revoke_token(&self, token: &str) {
        self.directory.write().tokens.remove(token);
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn user(&self, id: &str) -> Result<Option<UserInfo>> {
        Ok(self.directory.read().users.get(id).cloned())
    }

    async fn validate_token(&self, token: &str) -> Result<Option<UserInfo>> {
        let dir = self.directory.read();
        Ok(dir
            .tokens
            .get(token)
            .and_then(|id| dir.users.get(id))
            .cloned())
    }

    async fn has_permission(&self, user_id: &str, permission: &str) -> Result<bool> {
        Ok(self
            .directory
            .read()
            .grants
            .contains(&(user_id.to_string(), permission.to_string())))
    }
}
