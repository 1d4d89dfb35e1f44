//! Scoped symbol table
//!
//! Keys are `scope:label` pairs; literal pool entries use their synthetic
//! `=value_N` key unchanged. A symbol either holds a resolved address or
//! aliases another key (produced by START entry aliasing); the alias graph
//! is a forest, so resolution follows links with a small depth bound.

use std::collections::HashMap;

use crate::constants as C;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SymbolValue {
    Address(C::Address),
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SymbolEntry {
    pub value: SymbolValue,
    pub line: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    entries: HashMap<String, SymbolEntry>,
}

impl SymbolTable {
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: String, value: SymbolValue, line: usize) {
        self.entries.insert(key, SymbolEntry { value, line });
    }

    pub fn resolve(&self, key: &str) -> Option<C::Address> {
        let mut key = key;
        for _ in 0..32 {
            match &self.entries.get(key)?.value {
                SymbolValue::Address(address) => return Some(*address),
                SymbolValue::Alias(next) => key = next,
            }
        }
        None
    }

    /// Iterate over defined symbols
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SymbolEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_follows_aliases_test() {
        let mut table = SymbolTable::default();
        table.insert("MAIN:MAIN".to_string(), SymbolValue::Alias("MAIN:ENTRY".to_string()), 1);
        table.insert("MAIN:ENTRY".to_string(), SymbolValue::Address(5), 3);

        assert_eq!(table.resolve("MAIN:MAIN"), Some(5));
        assert_eq!(table.resolve("MAIN:ENTRY"), Some(5));
        assert_eq!(table.resolve("MAIN:OTHER"), None);
    }
}
