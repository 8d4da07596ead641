use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Error;
use crate::user::OidcUser;

/// Per-tab key/value storage holding the signed-in user record.
///
/// Implementations must be cheap and synchronous. The session client clears
/// the whole storage on logout, so it should hold nothing but auth state.
pub trait SessionStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    fn clear(&self);
}

/// In-process [`SessionStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Storage key of the user record for one provider/client pair.
#[must_use]
pub fn user_key(authority: &str, client_id: &str) -> String {
    format!("oidc.user:{authority}:{client_id}")
}

/// Read the stored user. A malformed record is logged and treated as absent.
pub fn load_user(storage: &dyn SessionStorage, key: &str) -> Option<OidcUser> {
    let raw = storage.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!(error = %e, key, "Discarding malformed stored user");
            None
        }
    }
}

/// Persist the user record.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the record cannot be serialized.
pub fn store_user(storage: &dyn SessionStorage, key: &str, user: &OidcUser) -> Result<(), Error> {
    let raw = serde_json::to_string(user).map_err(|e| Error::Storage(e.to_string()))?;
    storage.set(key, raw);
    Ok(())
}
