//! Local preview references for not-yet-confirmed messages.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use uuid::Uuid;

/// Tracks which preview references are still live. Handles unregister
/// themselves on drop, so a leaked reference means a leaked entity.
#[derive(Default, Clone)]
pub struct PreviewRegistry {
    live: Arc<Mutex<HashSet<Uuid>>>,
}

impl PreviewRegistry {
    /// Mints a unique, display-safe local reference. Never shared between
    /// entities.
    pub fn allocate(&self) -> PreviewHandle {
        let id = Uuid::new_v4();
        if let Ok(mut live) = self.live.lock() {
            live.insert(id);
        }
        PreviewHandle {
            id,
            uri: format!("preview://{id}"),
            live: Arc::downgrade(&self.live),
        }
    }

    pub fn live_previews(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.live
            .lock()
            .map(|live| live.contains(&id))
            .unwrap_or(false)
    }
}

/// Revocable reference to locally held image content. The URI is only
/// meaningful inside this process and only while the handle is alive.
pub struct PreviewHandle {
    id: Uuid,
    uri: String,
    live: Weak<Mutex<HashSet<Uuid>>>,
}

impl PreviewHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

// Drop is synchronous, so the live set sits behind a std mutex.
impl Drop for PreviewHandle {
    fn drop(&mut self) {
        if let Some(live) = self.live.upgrade() {
            if let Ok(mut live) = live.lock() {
                live.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_unique_uris() {
        let registry = PreviewRegistry::default();
        let first = registry.allocate();
        let second = registry.allocate();
        assert_ne!(first.uri(), second.uri());
        assert_eq!(registry.live_previews(), 2);
    }

    #[test]
    fn dropping_a_handle_revokes_it() {
        let registry = PreviewRegistry::default();
        let handle = registry.allocate();
        let id = handle.id();
        assert!(registry.is_live(id));
        drop(handle);
        assert!(!registry.is_live(id));
        assert_eq!(registry.live_previews(), 0);
    }
}
