use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::domain::{MembershipState, Message};
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ListenerRegistry<T: ?Sized> {
    name: &'static str,
    listeners: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T: ?Sized> ListenerRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Callback<T>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: ListenerId, callback: Callback<T>) {
        self.listeners().push((id, callback));
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners().clear();
    }

    /// Calls every registered listener; returns how many panicked.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot = self.listeners().clone();
        let mut failed = 0;
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                failed += 1;
                warn!(registry = self.name, listener = %id, "listeners: callback panicked");
            }
        }
        failed
    }
}

impl<T: ?Sized> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct SessionListeners {
    next_id: AtomicU64,
    messages: ListenerRegistry<[Message]>,
    membership: ListenerRegistry<MembershipState>,
    errors: ListenerRegistry<SyncError>,
}

impl SessionListeners {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            messages: ListenerRegistry::new("messages"),
            membership: ListenerRegistry::new("membership"),
            errors: ListenerRegistry::new("errors"),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_messages_changed(
        &self,
        listener: impl Fn(&[Message]) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.messages.insert(id, Arc::new(listener));
        id
    }

    pub fn on_membership_changed(
        &self,
        listener: impl Fn(&MembershipState) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.membership.insert(id, Arc::new(listener));
        id
    }

    pub fn on_error(&self, listener: impl Fn(&SyncError) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.errors.insert(id, Arc::new(listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.messages.remove(id) || self.membership.remove(id) || self.errors.remove(id)
    }

    pub fn notify_messages(&self, messages: &[Message]) {
        self.messages.notify(messages);
    }

    pub fn notify_membership(&self, state: MembershipState) {
        self.membership.notify(&state);
    }

    pub fn notify_error(&self, error: &SyncError) {
        self.errors.notify(error);
    }

    pub fn clear(&self) {
        self.messages.clear();
        self.membership.clear();
        self.errors.clear();
    }
}

impl Default for SessionListeners {
    fn default() -> Self {
        Self::new()
    }
}
