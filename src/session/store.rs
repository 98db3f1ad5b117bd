//! Session store contract and the resume-arbitration rule.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session has expired for client id ({client_id})")]
    Expired { client_id: String },
    #[error("no session exists for client id ({client_id})")]
    NotFound { client_id: String },
    #[error("sequence consumed for session with client id ({client_id})")]
    SequenceConsumed { client_id: String },
    #[error(
        "acknowledged index {index} out of range for sequence of length {len} (client id {client_id})"
    )]
    AckOutOfRange {
        client_id: String,
        index: usize,
        len: usize,
    },
}

/// Read-only view of a session: the immutable sequence plus a snapshot
/// of the acknowledgement bitmap. The sequence is shared, not copied,
/// so holders read it without touching any lock.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    sequence: Arc<[u32]>,
    acknowledged: Vec<bool>,
}

impl SessionView {
    pub(crate) fn new(sequence: Arc<[u32]>, acknowledged: Vec<bool>) -> Self {
        Self {
            sequence,
            acknowledged,
        }
    }

    pub fn sequence(&self) -> &[u32] {
        &self.sequence
    }

    pub fn acknowledged(&self) -> &[bool] {
        &self.acknowledged
    }
}

/// How a call to `next` resolved, in arbitration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOutcome {
    /// The index chosen from the client-supplied `lastReceived`.
    FromOverride(usize),
    /// The smallest unacknowledged index, taken on a fresh connection.
    FromFirstGap(usize),
    /// The cursor's own next index.
    Normal(usize),
    Consumed,
}

/// Select the index to emit. First match wins:
///
/// 1. A client reporting `last received = o` resumes delivery at `o + 1`;
///    a client that already holds the whole sequence gets the terminal
///    element again so the checksum hand-off can finish.
/// 2. On a fresh connection, the smallest unacknowledged index wins when
///    it trails the cursor. Covers the window where the server advanced
///    the cursor but the client never saw the frame.
/// 3. Otherwise the cursor advances normally until the sequence is
///    consumed.
pub fn resolve_next(
    len: usize,
    next_index: usize,
    acknowledged: &[bool],
    offset_override: Option<usize>,
    fresh_connection: bool,
) -> NextOutcome {
    if let Some(last_received) = offset_override {
        if last_received < len {
            return NextOutcome::FromOverride((last_received + 1).min(len - 1));
        }
    }

    if fresh_connection {
        if let Some(gap) = first_unacknowledged(acknowledged) {
            if gap != next_index {
                return NextOutcome::FromFirstGap(gap);
            }
        }
    }

    if next_index < len {
        NextOutcome::Normal(next_index)
    } else {
        NextOutcome::Consumed
    }
}

fn first_unacknowledged(acknowledged: &[bool]) -> Option<usize> {
    acknowledged.iter().position(|acked| !acked)
}

pub trait SessionStore {
    /// Create a session for `client_id`, or return the existing one's
    /// view with the proposed sequence discarded. Tombstoned ids fail
    /// with `Expired`.
    fn initialise(&mut self, client_id: &str, sequence: Vec<u32>) -> Result<SessionView, StoreError>;

    fn get(&mut self, client_id: &str) -> Result<SessionView, StoreError>;

    /// Return the next `(value, index)` to transmit, per `resolve_next`.
    fn next(
        &mut self,
        client_id: &str,
        offset_override: Option<usize>,
        fresh_connection: bool,
    ) -> Result<(u32, usize), StoreError>;

    /// Record the client's acknowledgement of `index`. Returns whether
    /// the index is the final one in the sequence.
    fn ack(&mut self, client_id: &str, index: usize) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_resumes_after_the_reported_index() {
        let acked = vec![false; 5];
        assert_eq!(
            resolve_next(5, 0, &acked, Some(1), true),
            NextOutcome::FromOverride(2)
        );
        // Stale cursor state never outranks the override.
        assert_eq!(
            resolve_next(5, 4, &acked, Some(0), true),
            NextOutcome::FromOverride(1)
        );
    }

    #[test]
    fn override_at_the_last_index_redelivers_the_terminal_element() {
        let acked = vec![true; 5];
        assert_eq!(
            resolve_next(5, 5, &acked, Some(4), true),
            NextOutcome::FromOverride(4)
        );
    }

    #[test]
    fn out_of_range_override_is_ignored() {
        let acked = vec![false; 3];
        assert_eq!(
            resolve_next(3, 1, &acked, Some(3), false),
            NextOutcome::Normal(1)
        );
    }

    #[test]
    fn first_gap_wins_on_fresh_connections_when_it_trails_the_cursor() {
        let acked = vec![true, true, false, false];
        assert_eq!(
            resolve_next(4, 3, &acked, None, true),
            NextOutcome::FromFirstGap(2)
        );
    }

    #[test]
    fn first_gap_matching_the_cursor_advances_normally() {
        let acked = vec![true, true, false, false];
        assert_eq!(resolve_next(4, 2, &acked, None, true), NextOutcome::Normal(2));
    }

    #[test]
    fn gap_rule_only_applies_to_fresh_connections() {
        let acked = vec![true, false, true, false];
        assert_eq!(resolve_next(4, 3, &acked, None, false), NextOutcome::Normal(3));
    }

    #[test]
    fn override_outranks_the_gap_rule() {
        let acked = vec![false, false, false];
        assert_eq!(
            resolve_next(3, 2, &acked, Some(0), true),
            NextOutcome::FromOverride(1)
        );
    }

    #[test]
    fn exhausted_cursor_reports_consumed() {
        let acked = vec![true, true];
        assert_eq!(resolve_next(2, 2, &acked, None, false), NextOutcome::Consumed);
    }

    #[test]
    fn zero_length_sequences_are_consumed_immediately() {
        assert_eq!(resolve_next(0, 0, &[], None, true), NextOutcome::Consumed);
        assert_eq!(resolve_next(0, 0, &[], Some(0), true), NextOutcome::Consumed);
    }
}
