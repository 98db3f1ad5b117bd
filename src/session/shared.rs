//! Thread-safe SessionStore adapter shared across connection threads.

use std::sync::{Arc, Mutex, MutexGuard};

use super::store::{SessionStore, SessionView, StoreError};

/// The store-wide mutex. Every operation acquires it first, then the
/// per-session mutex inside, and releases both before returning.
pub struct SharedSessionStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSessionStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SharedSessionStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().expect("session store lock poisoned")
    }
}

impl<S: SessionStore> SessionStore for SharedSessionStore<S> {
    fn initialise(&mut self, client_id: &str, sequence: Vec<u32>) -> Result<SessionView, StoreError> {
        self.lock().initialise(client_id, sequence)
    }

    fn get(&mut self, client_id: &str) -> Result<SessionView, StoreError> {
        self.lock().get(client_id)
    }

    fn next(
        &mut self,
        client_id: &str,
        offset_override: Option<usize>,
        fresh_connection: bool,
    ) -> Result<(u32, usize), StoreError> {
        self.lock().next(client_id, offset_override, fresh_connection)
    }

    fn ack(&mut self, client_id: &str, index: usize) -> Result<bool, StoreError> {
        self.lock().ack(client_id, index)
    }
}
