//! Sequence checksums.

use sha1::{Digest, Sha1};

/// SHA-1 over the compact JSON array serialisation of the sequence, as a
/// lowercase hex digest.
///
/// The textual form must match byte-for-byte between client and server
/// (no whitespace, no trailing newline); a digest over the raw
/// little-endian bytes is not interchangeable.
pub fn sequence_checksum(sequence: &[u32]) -> String {
    let json = serde_json::to_vec(sequence).expect("u32 slice serialises to json");
    let mut hasher = Sha1::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest_for_small_sequence() {
        assert_eq!(
            sequence_checksum(&[1, 2, 3]),
            "0a0a9f2a6772942557ab5355d76af442f8f65e01"
        );
    }

    #[test]
    fn empty_sequence_digests_the_empty_array() {
        // sha1("[]")
        assert_eq!(
            sequence_checksum(&[]),
            sequence_checksum(&Vec::<u32>::new())
        );
        assert_eq!(sequence_checksum(&[]).len(), 40);
    }

    #[test]
    fn digest_is_a_function_of_the_sequence_alone() {
        let first = sequence_checksum(&[0xFFFE, 0, 42]);
        let second = sequence_checksum(&[0xFFFE, 0, 42]);
        assert_eq!(first, second);
        assert_ne!(first, sequence_checksum(&[0xFFFE, 0, 43]));
    }
}
