//! In-memory session store with idle expiry and tombstones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::store::{NextOutcome, SessionStore, SessionView, StoreError, resolve_next};

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct InMemoryStoreParams {
    /// Seconds a session may sit untouched before it tombstones.
    pub expire_after_idle_secs: u64,
}

pub struct InMemoryStore {
    params: InMemoryStoreParams,
    sessions: HashMap<String, Arc<Mutex<SessionRecord>>>,
    clock: Clock,
}

#[derive(Debug)]
struct SessionRecord {
    sequence: Arc<[u32]>,
    acknowledged: Vec<bool>,
    next_index: usize,
    last_accessed: u64,
    // Soft-delete marker. Distinguishes a session that was never created
    // from one that has been discarded, so the same client id cannot be
    // re-initialised after it idles out. Records are never reclaimed;
    // tombstones accumulate for the life of the process.
    expired: bool,
}

impl InMemoryStore {
    pub fn new(params: InMemoryStoreParams) -> Self {
        Self::with_clock(params, Arc::new(unix_now))
    }

    /// As `new`, with an injected seconds clock.
    pub fn with_clock(params: InMemoryStoreParams, clock: Clock) -> Self {
        Self {
            params,
            sessions: HashMap::new(),
            clock,
        }
    }

    fn load_existing(
        &self,
        client_id: &str,
    ) -> Result<Option<Arc<Mutex<SessionRecord>>>, StoreError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Ok(None);
        };

        let expired = {
            let mut record = session.lock().expect("session lock poisoned");
            self.check_expired_and_touch(&mut record)
        };
        if expired {
            return Err(StoreError::Expired {
                client_id: client_id.to_string(),
            });
        }

        Ok(Some(Arc::clone(session)))
    }

    /// Tombstone the record if it has idled past the expiry window,
    /// comparing against the pre-refresh timestamp, then refresh
    /// `last_accessed`. Already-expired records are left untouched.
    fn check_expired_and_touch(&self, record: &mut SessionRecord) -> bool {
        if record.expired {
            return true;
        }

        let now = (self.clock)();
        if record.last_accessed + self.params.expire_after_idle_secs < now {
            tracing::debug!(
                last_accessed = record.last_accessed,
                now,
                "session idled out; tombstoning"
            );
            record.expired = true;
        }
        record.last_accessed = now;

        record.expired
    }
}

impl SessionStore for InMemoryStore {
    fn initialise(
        &mut self,
        client_id: &str,
        sequence: Vec<u32>,
    ) -> Result<SessionView, StoreError> {
        if let Some(session) = self.load_existing(client_id)? {
            // The session keeps its original sequence; the proposal is
            // dropped.
            let record = session.lock().expect("session lock poisoned");
            return Ok(SessionView::new(
                Arc::clone(&record.sequence),
                record.acknowledged.clone(),
            ));
        }

        let acknowledged = vec![false; sequence.len()];
        let sequence: Arc<[u32]> = sequence.into();
        let record = SessionRecord {
            sequence: Arc::clone(&sequence),
            acknowledged: acknowledged.clone(),
            next_index: 0,
            last_accessed: (self.clock)(),
            expired: false,
        };
        self.sessions
            .insert(client_id.to_string(), Arc::new(Mutex::new(record)));

        Ok(SessionView::new(sequence, acknowledged))
    }

    fn get(&mut self, client_id: &str) -> Result<SessionView, StoreError> {
        match self.load_existing(client_id)? {
            Some(session) => {
                let record = session.lock().expect("session lock poisoned");
                Ok(SessionView::new(
                    Arc::clone(&record.sequence),
                    record.acknowledged.clone(),
                ))
            }
            None => Err(StoreError::NotFound {
                client_id: client_id.to_string(),
            }),
        }
    }

    fn next(
        &mut self,
        client_id: &str,
        offset_override: Option<usize>,
        fresh_connection: bool,
    ) -> Result<(u32, usize), StoreError> {
        let session = self
            .load_existing(client_id)?
            .ok_or_else(|| StoreError::NotFound {
                client_id: client_id.to_string(),
            })?;
        let mut record = session.lock().expect("session lock poisoned");

        let len = record.sequence.len();
        let outcome = resolve_next(
            len,
            record.next_index,
            &record.acknowledged,
            offset_override,
            fresh_connection,
        );
        match outcome {
            NextOutcome::FromOverride(index) => {
                tracing::debug!(index, client_id, "resuming from client-supplied offset");
                record.next_index = index + 1;
                Ok((record.sequence[index], index))
            }
            NextOutcome::FromFirstGap(index) => {
                tracing::debug!(
                    index,
                    next_index = record.next_index,
                    client_id,
                    "resuming from first unacknowledged index"
                );
                record.next_index = index + 1;
                Ok((record.sequence[index], index))
            }
            NextOutcome::Normal(index) => {
                record.next_index = index + 1;
                Ok((record.sequence[index], index))
            }
            NextOutcome::Consumed => Err(StoreError::SequenceConsumed {
                client_id: client_id.to_string(),
            }),
        }
    }

    fn ack(&mut self, client_id: &str, index: usize) -> Result<bool, StoreError> {
        let session = self
            .load_existing(client_id)?
            .ok_or_else(|| StoreError::NotFound {
                client_id: client_id.to_string(),
            })?;
        let mut record = session.lock().expect("session lock poisoned");

        let len = record.sequence.len();
        if index >= len {
            return Err(StoreError::AckOutOfRange {
                client_id: client_id.to_string(),
                index,
                len,
            });
        }
        record.acknowledged[index] = true;

        Ok(index == len - 1)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
