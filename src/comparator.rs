//! Key ordering for column families.
//!
//! Every column family resolves its comparator by name at create/open time.
//! The empty name and `"memcmp"` select plain byte order.

use crate::error::{Result, StorageError};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Total order over keys. `compare` must return `Equal` only for identical
/// byte strings, as bloom filters hash raw key bytes.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// True when the order is plain byte order, which lets SSTables store
    /// truncated key prefixes in their block index.
    fn is_bytewise(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparator").field("name", &self.name()).finish()
    }
}

pub struct MemcmpComparator;

impl Comparator for MemcmpComparator {
    fn name(&self) -> &str {
        "memcmp"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn is_bytewise(&self) -> bool {
        true
    }
}

pub struct ReverseComparator;

impl Comparator for ReverseComparator {
    fn name(&self) -> &str {
        "reverse"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

/// Shorter keys first, byte order among equal lengths.
pub struct LengthFirstComparator;

impl Comparator for LengthFirstComparator {
    fn name(&self) -> &str {
        "length_first"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

/// Adapts a closure into a named comparator.
pub struct FnComparator<F> {
    name: String,
    f: F,
}

impl<F> FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnComparator {
            name: name.into(),
            f,
        }
    }
}

impl<F> Comparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.f)(a, b)
    }
}

struct Registered {
    comparator: Arc<dyn Comparator>,
    context: Option<String>,
}

/// Named comparators available to column families of one database.
pub struct ComparatorRegistry {
    entries: RwLock<HashMap<String, Registered>>,
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        let registry = ComparatorRegistry {
            entries: RwLock::new(HashMap::new()),
        };
        {
            let mut entries = registry.entries.write();
            let builtins: [Arc<dyn Comparator>; 3] = [
                Arc::new(MemcmpComparator),
                Arc::new(ReverseComparator),
                Arc::new(LengthFirstComparator),
            ];
            for cmp in builtins {
                entries.insert(
                    cmp.name().to_string(),
                    Registered {
                        comparator: cmp,
                        context: None,
                    },
                );
            }
        }
        registry
    }

    pub fn register(
        &self,
        name: &str,
        comparator: Arc<dyn Comparator>,
        context: Option<String>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::InvalidArgs("comparator name is empty".into()));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(StorageError::Exists(format!("comparator {}", name)));
        }
        entries.insert(
            name.to_string(),
            Registered {
                comparator,
                context,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Comparator>> {
        let name = if name.is_empty() { "memcmp" } else { name };
        self.entries
            .read()
            .get(name)
            .map(|r| Arc::clone(&r.comparator))
            .ok_or_else(|| StorageError::NotFound(format!("comparator {}", name)))
    }

    pub fn context(&self, name: &str) -> Option<String> {
        self.entries.read().get(name).and_then(|r| r.context.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
