//! Sortable identifiers.
//!
//! Dispatch ids, event ids, and role ids are 26-character Crockford base-32
//! ULIDs: a Unix-millisecond prefix followed by randomness, so id order
//! equals creation order. Event ids within one process additionally use a
//! monotonic generator so that two events minted in the same millisecond
//! still sort in insertion order.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use ulid::{Generator, Ulid};

static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

/// Mint a new sortable id.
pub fn sortable_id() -> String {
    let mut gen = match GENERATOR.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    match gen.generate() {
        Ok(id) => id.to_string(),
        // Randomness overflow within a single millisecond — fall back to a
        // fresh random ULID rather than blocking.
        Err(_) => Ulid::new().to_string(),
    }
}
