use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    waiters: usize,
}

/// Process-wide key → exclusive lock map, used to collapse concurrent
/// upstream fetches for the same fingerprint. Slots with no waiters are
/// dropped on release so the map stays bounded by in-flight keys.
#[derive(Clone, Default)]
pub struct KeyMutex {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl KeyMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut slots = self.slots.lock().expect("key mutex map");
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            Arc::clone(&slot.lock)
        };

        let guard = lock.lock_owned().await;

        KeyGuard {
            slots: Arc::clone(&self.slots),
            key: key.to_string(),
            _guard: guard,
        }
    }
}

pub struct KeyGuard {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().expect("key mutex map");
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                slots.remove(&self.key);
            }
        }
    }
}
