// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Small shared utilities.

use uuid::Uuid;

/// Generate a fresh request id: an RFC 4122 UUID v4 in hyphenated lowercase
/// form (e.g. `550e8400-e29b-41d4-a716-446655440000`).
///
/// Thread-safe with no shared state on the hot path: the generator draws
/// from a per-thread RNG.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Check whether `s` has the hyphenated UUID shape used for request ids.
///
/// Clients use this to drop malformed ids replayed from durable history
/// before even consulting their outstanding-request table.
pub fn is_request_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert_eq!(id.len(), 36);
        assert!(is_request_id(&id));
    }

    #[test]
    fn test_request_id_is_v4() {
        for _ in 0..64 {
            let id = new_request_id();
            let bytes = id.as_bytes();
            // Version nibble at position 14 must be 4.
            assert_eq!(bytes[14], b'4', "version nibble in {}", id);
            // Variant: the character at position 19 encodes the two high
            // bits 10, i.e. one of 8, 9, a, b.
            assert!(
                matches!(bytes[19], b'8' | b'9' | b'a' | b'b'),
                "variant nibble in {}",
                id
            );
        }
    }

    #[test]
    fn test_request_ids_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_request_id_rejects_malformed() {
        assert!(!is_request_id(""));
        assert!(!is_request_id("not-a-uuid"));
        assert!(!is_request_id("550e8400e29b41d4a716446655440000"));
        assert!(!is_request_id("550e8400-e29b-41d4-a716-44665544000z"));
        assert!(is_request_id("550e8400-e29b-41d4-a716-446655440000"));
    }
}
