//! Trie keys and table names, and the object paths derived from them.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

use super::{TrieError, TriePath};

const RECENCY_FMT: &str = "%Y%m%d";

static TABLE_DIR_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[./]").expect("static table escape pattern"));

/// Logical table whose tries are compacted together.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(String);

impl TableName {
    /// Wrap a table name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Table name as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage directory holding the table's tries.
    pub fn table_path(&self) -> PathBuf {
        let escaped = TABLE_DIR_ESCAPE.replace_all(&self.0, NoExpand("$"));
        PathBuf::from("tables").join(escaped.as_ref())
    }

    /// Data file of `key` within this table.
    pub fn data_file_path(&self, key: &TrieKey) -> PathBuf {
        self.table_path()
            .join("data")
            .join(format!("{key}.parquet"))
    }

    /// Metadata file of `key` within this table.
    pub fn meta_file_path(&self, key: &TrieKey) -> PathBuf {
        self.table_path().join("meta").join(format!("{key}.trie"))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of one trie: `(level, recency bucket, hash partition, block)`.
///
/// Rendered as `l<lexhex>-r<yyyymmdd|c>[-p<nibbles>]-b<lexhex>`; lexhex
/// prefixes the hex body with its length minus one so keys sort numerically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrieKey {
    /// Compaction level, 0 for freshly written tries.
    pub level: u64,
    /// Recency bucket for historical tries, `None` for current.
    pub recency: Option<NaiveDate>,
    /// Hash partition covered by the trie, `None` for unpartitioned.
    pub part: Option<TriePath>,
    /// Last storage block whose data the trie contains.
    pub block_index: u64,
}

impl TrieKey {
    /// Key of a level-0 trie written for `block_index`.
    pub fn l0(block_index: u64) -> Self {
        Self {
            level: 0,
            recency: None,
            part: None,
            block_index,
        }
    }

    /// Whether this trie holds current (not historical) data.
    pub fn is_current(&self) -> bool {
        self.recency.is_none()
    }

    /// Partition path, empty when unpartitioned.
    pub fn part_path(&self) -> TriePath {
        self.part.clone().unwrap_or_default()
    }
}

fn lex_hex(value: u64) -> String {
    let body = format!("{value:x}");
    format!("{:x}{body}", body.len() - 1)
}

fn parse_lex_hex(s: &str) -> Option<u64> {
    let mut chars = s.chars();
    let len_digit = chars.next()?.to_digit(16)? as usize;
    let body = chars.as_str();
    if body.len() != len_digit + 1 {
        return None;
    }
    u64::from_str_radix(body, 16).ok()
}

impl fmt::Display for TrieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", lex_hex(self.level))?;
        match self.recency {
            Some(date) => write!(f, "-r{}", date.format(RECENCY_FMT))?,
            None => f.write_str("-rc")?,
        }
        if let Some(part) = self.part.as_ref().filter(|part| !part.is_empty()) {
            write!(f, "-p{part}")?;
        }
        write!(f, "-b{}", lex_hex(self.block_index))
    }
}

impl FromStr for TrieKey {
    type Err = TrieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TrieError::InvalidKey(s.to_string());
        let mut level = None;
        let mut recency = None;
        let mut part = None;
        let mut block_index = None;

        for segment in s.split('-') {
            let mut chars = segment.chars();
            let tag = chars.next().ok_or_else(invalid)?;
            let arg = chars.as_str();
            match tag {
                'l' => level = Some(parse_lex_hex(arg).ok_or_else(invalid)?),
                'r' if arg == "c" => recency = None,
                'r' => {
                    recency = Some(
                        NaiveDate::parse_from_str(arg, RECENCY_FMT).map_err(|_| invalid())?,
                    )
                }
                'p' => {
                    let nibbles = arg
                        .chars()
                        .map(|c| c.to_digit(4).map(|d| d as u8))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(invalid)?;
                    part = Some(TriePath::from_nibbles(nibbles));
                }
                'b' => block_index = Some(parse_lex_hex(arg).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            }
        }

        Ok(Self {
            level: level.ok_or_else(invalid)?,
            recency,
            part,
            block_index: block_index.ok_or_else(invalid)?,
        })
    }
}
