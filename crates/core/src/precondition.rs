//! Observable assistant-provider API key.
//!
//! The connection manager refuses to connect while no key is present and
//! tears an established session down when the key is removed. Removal is
//! reported to registered observers before `clear()` or `set()` returns.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Called inline whenever the key goes from present to absent.
pub(crate) trait KeyRemovalObserver: Send + Sync {
    fn key_removed(&self);
}

#[derive(Clone)]
pub struct ProviderKeySource {
    shared: Arc<Shared>,
}

struct Shared {
    tx: watch::Sender<Option<SecretString>>,
    observers: Mutex<Vec<Weak<dyn KeyRemovalObserver>>>,
}

impl ProviderKeySource {
    pub fn new(initial: Option<SecretString>) -> Self {
        let (tx, _rx) = watch::channel(normalize(initial));
        Self {
            shared: Arc::new(Shared {
                tx,
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Stores a key. A blank key counts as no key.
    pub fn set(&self, key: impl Into<String>) {
        let key = normalize(Some(SecretString::from(key.into())));
        let mut removed = false;
        self.shared.tx.send_modify(|current| {
            removed = current.is_some() && key.is_none();
            *current = key;
        });
        if removed {
            self.notify_removed();
        }
    }

    pub fn clear(&self) {
        if self.shared.tx.send_if_modified(|current| current.take().is_some()) {
            self.notify_removed();
        }
    }

    pub fn is_present(&self) -> bool {
        self.shared.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SecretString>> {
        self.shared.tx.subscribe()
    }

    pub(crate) fn observe(&self, observer: Weak<dyn KeyRemovalObserver>) {
        let mut observers = self.observers();
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    fn notify_removed(&self) {
        // Collected first so observers run without the list locked.
        let live: Vec<_> = {
            let mut observers = self.observers();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.key_removed();
        }
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Weak<dyn KeyRemovalObserver>>> {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProviderKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeySource")
            .field("present", &self.is_present())
            .finish()
    }
}

impl Default for ProviderKeySource {
    fn default() -> Self {
        Self::empty()
    }
}

fn normalize(key: Option<SecretString>) -> Option<SecretString> {
    key.filter(|k| !k.expose_secret().trim().is_empty())
}
