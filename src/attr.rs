//! Attribute store (C1): name → string value with per-entry flags.

use std::collections::HashMap;

use crate::error::BrokerError;

/// Flag bits for an attribute entry (§3: immutable, readonly, active).
pub struct AttrFlags;

impl AttrFlags {
    pub const IMMUTABLE: u8 = 0b001;
    pub const READONLY: u8 = 0b010;
    pub const ACTIVE: u8 = 0b100;
}

#[derive(Debug, Clone)]
struct Attribute {
    value: Option<String>,
    flags: u8,
}

/// `{name, value, flags: {immutable, readonly, active}}` (§3, §4.1).
///
/// Active attributes are not modeled with a stored getter closure here —
/// instead they're attributes whose value is recomputed by the owner on
/// every `set` before storage, keeping the store itself free of `Fn`
/// trait objects, which would otherwise need to cross the single-reactor
/// boundary by value.
#[derive(Debug, Default)]
pub struct AttrStore {
    entries: HashMap<String, Attribute>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>, flags: u8) -> Result<(), BrokerError> {
        if self.entries.contains_key(name) {
            return Err(BrokerError::Exists(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            Attribute {
                value: Some(value.into()),
                flags,
            },
        );
        Ok(())
    }

    /// Add and immediately promote to immutable, the pattern used for the
    /// bootstrap-seeded attributes (`session-id`, `rank`, `size`, ...).
    pub fn add_immutable(&mut self, name: &str, value: impl Into<String>) -> Result<(), BrokerError> {
        self.add(name, value, AttrFlags::IMMUTABLE)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), BrokerError> {
        match self.entries.get_mut(name) {
            None => Err(BrokerError::NotFound(name.to_string())),
            Some(attr) if attr.flags & AttrFlags::IMMUTABLE != 0 => {
                Err(BrokerError::Immutable(name.to_string()))
            }
            Some(attr) => {
                attr.value = Some(value.into());
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<&str, BrokerError> {
        self.entries
            .get(name)
            .and_then(|a| a.value.as_deref())
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))
    }

    pub fn set_flags(&mut self, name: &str, flags: u8) -> Result<(), BrokerError> {
        match self.entries.get_mut(name) {
            None => Err(BrokerError::NotFound(name.to_string())),
            Some(attr) => {
                // Immutability is monotonic: once set, OR it in and never
                // clear it, regardless of what the caller asked for.
                if attr.flags & AttrFlags::IMMUTABLE != 0 {
                    attr.flags = flags | AttrFlags::IMMUTABLE;
                } else {
                    attr.flags = flags;
                }
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, name: &str, force: bool) -> Result<(), BrokerError> {
        match self.entries.get(name) {
            None => Err(BrokerError::NotFound(name.to_string())),
            Some(attr) if attr.flags & AttrFlags::IMMUTABLE != 0 && !force => {
                Err(BrokerError::Immutable(name.to_string()))
            }
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
        }
    }

    pub fn is_immutable(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|a| a.flags & AttrFlags::IMMUTABLE != 0)
            .unwrap_or(false)
    }

    /// List `(name, value)` pairs for `attr.list`.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(k, v)| v.value.clone().map(|val| (k.clone(), val)))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get() {
        let mut store = AttrStore::new();
        store.add("rank", "0", 0).unwrap();
        assert_eq!(store.get("rank").unwrap(), "0");
    }

    #[test]
    fn add_duplicate_fails_exists() {
        let mut store = AttrStore::new();
        store.add("x", "1", 0).unwrap();
        assert!(matches!(store.add("x", "2", 0), Err(BrokerError::Exists(_))));
    }

    #[test]
    fn set_then_get_roundtrips_for_mutable_attribute() {
        let mut store = AttrStore::new();
        store.add("k", "v1", 0).unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap(), "v2");
    }

    #[test]
    fn immutable_rejects_writes() {
        let mut store = AttrStore::new();
        store.add_immutable("session-id", "abc123").unwrap();
        assert!(matches!(
            store.set("session-id", "zzz"),
            Err(BrokerError::Immutable(_))
        ));
        assert_eq!(store.get("session-id").unwrap(), "abc123");
    }

    #[test]
    fn immutability_is_monotonic_once_set() {
        let mut store = AttrStore::new();
        store.add("k", "v", 0).unwrap();
        store.set_flags("k", AttrFlags::IMMUTABLE).unwrap();
        // Attempting to clear all flags must not clear IMMUTABLE.
        store.set_flags("k", 0).unwrap();
        assert!(store.is_immutable("k"));
        assert!(matches!(store.set("k", "v2"), Err(BrokerError::Immutable(_))));
    }

    #[test]
    fn delete_requires_force_for_immutable() {
        let mut store = AttrStore::new();
        store.add_immutable("k", "v").unwrap();
        assert!(matches!(store.delete("k", false), Err(BrokerError::Immutable(_))));
        store.delete("k", true).unwrap();
        assert!(matches!(store.get("k"), Err(BrokerError::NotFound(_))));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let mut store = AttrStore::new();
        assert!(matches!(store.delete("nope", false), Err(BrokerError::NotFound(_))));
    }

    #[test]
    fn list_is_sorted_by_name() {
        let mut store = AttrStore::new();
        store.add("b", "2", 0).unwrap();
        store.add("a", "1", 0).unwrap();
        assert_eq!(
            store.list(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }
}
