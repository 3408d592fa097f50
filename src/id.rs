// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use uuid::Uuid;

/// Mints identifiers for newly pushed tasks. Pluggable so callers can bring
/// their own identifier scheme (e.g. ULIDs, or IDs assigned upstream).
///
/// The canonical default, [`UuidGenerator`], mints a random 128-bit value.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Mints a random UUIDv4, rendered as its hyphenated textual form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_unique_non_empty_ids() {
        let gen = UuidGenerator;
        let a = gen.generate();
        let b = gen.generate();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
