//! Registry of published tries per table.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{PoisonError, RwLock},
};

use crate::trie::{TableName, TrieKey, TriePath, LEVEL_WIDTH};

/// Metadata of one newly published trie.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddedTrie {
    /// Table the trie belongs to.
    pub table: TableName,
    /// Identity of the trie.
    pub trie_key: TrieKey,
    /// Size of its data file in bytes.
    pub data_file_size: u64,
    /// Rows across its pages.
    pub row_count: u64,
}

/// Receives tries once a job has written them to storage.
///
/// Registration must be idempotent per `(table, trie_key)`: a job may be
/// retried after a crash between registration and the log append.
pub trait Catalog: Send + Sync + fmt::Debug {
    /// Register `tries`.
    fn add_tries(&self, tries: &[AddedTrie]);
}

/// Whether a registered trie still serves reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrieState {
    /// Current input for reads and compaction.
    Live,
    /// Fully replaced by the next level; eligible for removal.
    Garbage,
}

/// Catalog entry of one trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrieEntry {
    /// Size of the data file in bytes.
    pub data_file_size: u64,
    /// Rows across all pages.
    pub row_count: u64,
    /// Live or garbage.
    pub state: TrieState,
}

/// In-memory catalog used by the leveled policy.
///
/// When the four partition outputs `(L+1, current, P+[i], b)` are all
/// registered, every live current trie at `(L, P)` up to block `b` becomes
/// garbage.
#[derive(Debug, Default)]
pub struct TrieCatalog {
    tables: RwLock<BTreeMap<TableName, BTreeMap<TrieKey, TrieEntry>>>,
}

impl TrieCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables with at least one registered trie.
    pub fn tables(&self) -> Vec<TableName> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.keys().cloned().collect()
    }

    /// Every registered trie of `table`, in key order.
    pub fn tries(&self, table: &TableName) -> Vec<(TrieKey, TrieEntry)> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .map(|tries| tries.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// Keys of live tries of `table`, in key order.
    pub fn live_tries(&self, table: &TableName) -> Vec<TrieKey> {
        self.tries(table)
            .into_iter()
            .filter(|(_, entry)| entry.state == TrieState::Live)
            .map(|(key, _)| key)
            .collect()
    }

    /// Entry of one trie.
    pub fn get(&self, table: &TableName, key: &TrieKey) -> Option<TrieEntry> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).and_then(|tries| tries.get(key)).copied()
    }

    /// Whether `key` is registered for `table`, live or not.
    pub fn contains(&self, table: &TableName, key: &TrieKey) -> bool {
        self.get(table, key).is_some()
    }
}

fn parent_part(part: &TriePath) -> Option<TriePath> {
    let (_, parent) = part.split_last()?;
    Some(TriePath::from_nibbles(parent.iter().copied()))
}

fn mark_superseded(tries: &mut BTreeMap<TrieKey, TrieEntry>, added: &TrieKey) {
    if !added.is_current() || added.level == 0 {
        return;
    }
    let Some(parent) = parent_part(&added.part_path()) else {
        return;
    };

    let all_outputs = (0..LEVEL_WIDTH as u8).all(|nibble| {
        tries.contains_key(&TrieKey {
            level: added.level,
            recency: None,
            part: Some(parent.conj(nibble)),
            block_index: added.block_index,
        })
    });
    if !all_outputs {
        return;
    }

    let input_level = added.level - 1;
    for (key, entry) in tries.iter_mut() {
        if key.level == input_level
            && key.is_current()
            && key.part_path() == parent
            && key.block_index <= added.block_index
        {
            entry.state = TrieState::Garbage;
        }
    }
}

impl Catalog for TrieCatalog {
    fn add_tries(&self, added: &[AddedTrie]) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for trie in added {
            let tries = tables.entry(trie.table.clone()).or_default();
            if tries.contains_key(&trie.trie_key) {
                continue;
            }
            tries.insert(
                trie.trie_key.clone(),
                TrieEntry {
                    data_file_size: trie.data_file_size,
                    row_count: trie.row_count,
                    state: TrieState::Live,
                },
            );
            mark_superseded(tries, &trie.trie_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(table: &TableName, trie_key: TrieKey) -> AddedTrie {
        AddedTrie {
            table: table.clone(),
            trie_key,
            data_file_size: 10,
            row_count: 1,
        }
    }

    fn l1(nibble: u8, block_index: u64) -> TrieKey {
        TrieKey {
            level: 1,
            recency: None,
            part: Some(TriePath::from_nibbles([nibble])),
            block_index,
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let table = TableName::new("docs");
        let catalog = TrieCatalog::new();
        let trie = added(&table, TrieKey::l0(0));
        catalog.add_tries(&[trie.clone()]);
        catalog.add_tries(&[AddedTrie {
            row_count: 99,
            ..trie
        }]);
        assert_eq!(catalog.tries(&table).len(), 1);
        assert_eq!(
            catalog.get(&table, &TrieKey::l0(0)).map(|e| e.row_count),
            Some(1)
        );
    }

    #[test]
    fn inputs_become_garbage_once_every_partition_is_written() {
        let table = TableName::new("docs");
        let catalog = TrieCatalog::new();
        let l0s = (0..5).map(|b| added(&table, TrieKey::l0(b))).collect::<Vec<_>>();
        catalog.add_tries(&l0s);

        catalog.add_tries(&[added(&table, l1(0, 3)), added(&table, l1(1, 3))]);
        assert_eq!(catalog.live_tries(&table).len(), 7);

        catalog.add_tries(&[added(&table, l1(2, 3)), added(&table, l1(3, 3))]);
        let live = catalog.live_tries(&table);
        assert_eq!(
            live,
            vec![TrieKey::l0(4), l1(0, 3), l1(1, 3), l1(2, 3), l1(3, 3)]
        );
        assert_eq!(
            catalog.get(&table, &TrieKey::l0(0)).map(|e| e.state),
            Some(TrieState::Garbage)
        );
    }
}
