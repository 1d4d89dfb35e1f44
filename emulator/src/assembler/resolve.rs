//! Assembler pass 2
//!
//! A pure walk over the laid-out memory in address order. Symbolic slots
//! are looked up in the symbol table; `CALL_` keys fall back to the
//! `label:label` form so CALL can reach another section's entry point.
//! Unresolved symbols become 0 with a warning.

use tracing::warn;

use super::layout::{Layout, Slot};
use super::parse_number;
use super::symbol::SymbolTable;
use crate::constants as C;

/// Resolve the sparse layout into the dense image
pub(crate) fn resolve_image(layout: &Layout) -> Vec<C::Word> {
    let mut image = Vec::with_capacity(layout.memory.len());
    for (&address, placement) in &layout.memory {
        debug_assert_eq!(usize::from(address), image.len());
        let word = match &placement.slot {
            Slot::Value(word) => *word,
            Slot::Symbolic(key) => resolve_key(&layout.symbols, key),
        };
        image.push(word);
    }
    image
}

pub(crate) fn resolve_key(symbols: &SymbolTable, key: &str) -> C::Word {
    if key.starts_with('#') {
        if let Some(value) = parse_number(key) {
            return value;
        }
    }

    if let Some(address) = symbols.resolve(key) {
        return address;
    }

    if let Some(stripped) = key.strip_prefix("CALL_") {
        if let Some(address) = symbols.resolve(stripped) {
            return address;
        }
        // Cross-scope fallback: a bare label may name another section's
        // entry, recorded under label:label
        if let Some(label) = key.rsplit(':').next() {
            if let Some(address) = symbols.resolve(&format!("{label}:{label}")) {
                return address;
            }
        }
    }

    if let Some(value) = parse_number(key) {
        return value;
    }

    warn!(key, "unresolved symbol, emitting 0");
    0
}
