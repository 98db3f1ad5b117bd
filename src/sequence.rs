//! Pseudo-random sequence generation.

use rand::Rng;

/// Upper bound (exclusive) for generated element values, and the
/// inclusive bound for `sequenceCount` / `lastReceived` query values.
pub const MAX_SEQUENCE_NUMBER_VALUE: u32 = 0xffff;

/// Where the server gets the sequence for a new session.
pub trait SequenceSource: Send + Sync {
    fn generate(&self, len: usize) -> Vec<u32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSequenceSource;

impl SequenceSource for RandomSequenceSource {
    fn generate(&self, len: usize) -> Vec<u32> {
        let mut rng = rand::rng();
        (0..len)
            .map(|_| rng.random_range(0..MAX_SEQUENCE_NUMBER_VALUE))
            .collect()
    }
}

/// Always yields the same configured sequence, ignoring the requested
/// length. Lets tests pin the payload a server session will carry.
#[derive(Debug, Clone)]
pub struct FixedSequenceSource {
    sequence: Vec<u32>,
}

impl FixedSequenceSource {
    pub fn new(sequence: Vec<u32>) -> Self {
        Self { sequence }
    }
}

impl SequenceSource for FixedSequenceSource {
    fn generate(&self, _len: usize) -> Vec<u32> {
        self.sequence.clone()
    }
}

/// Length used when the client does not request one.
pub fn random_sequence_count() -> usize {
    rand::rng().random_range(0..MAX_SEQUENCE_NUMBER_VALUE) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_source_bounds_values() {
        let sequence = RandomSequenceSource.generate(256);
        assert_eq!(sequence.len(), 256);
        assert!(sequence.iter().all(|value| *value < MAX_SEQUENCE_NUMBER_VALUE));
    }

    #[test]
    fn fixed_source_ignores_requested_length() {
        let source = FixedSequenceSource::new(vec![1, 2, 3]);
        assert_eq!(source.generate(10), vec![1, 2, 3]);
    }

    #[test]
    fn random_count_stays_in_range() {
        for _ in 0..64 {
            assert!(random_sequence_count() < MAX_SEQUENCE_NUMBER_VALUE as usize);
        }
    }
}
