// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

use rand::RngCore;

/// Length of the hex portion of instance and volume IDs.
pub const AWS_ID_LEN: usize = 17;

/// Length of the unique suffix appended to main-substrate names.
pub const SUFFIX_LEN: usize = 8;

/// Create a cryptographically secure lowercase hex ID of length `len`.
pub fn hex_id(len: usize) -> String {
    let mut bytes = vec![0u8; (len + 1) / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = hex::encode(bytes);
    id.truncate(len);
    id
}

/// Mint a fresh instance ID.
pub fn instance_id() -> String {
    hex_id(AWS_ID_LEN)
}

/// Mint a fresh volume ID.
pub fn volume_id() -> String {
    hex_id(AWS_ID_LEN)
}

/// Mint the unique suffix for a main container and volume pair.
pub fn unique_suffix() -> String {
    hex_id(SUFFIX_LEN)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_have_the_requested_length() {
        for len in [1, 2, 8, AWS_ID_LEN, 32] {
            assert_eq!(hex_id(len).len(), len);
        }
        assert_eq!(instance_id().len(), AWS_ID_LEN);
        assert_eq!(volume_id().len(), AWS_ID_LEN);
        assert_eq!(unique_suffix().len(), SUFFIX_LEN);
    }

    #[test]
    fn ids_are_lowercase_hex() {
        for _ in 0..1000 {
            let id = instance_id();
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn ids_do_not_collide() {
        let mut seen = HashSet::new();
        for _ in 0..1_000_000 {
            assert!(seen.insert(instance_id()), "duplicate ID generated");
        }
    }
}
