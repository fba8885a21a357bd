//! Index Model
//!
//! Logical tables of the node store. Each table has a fixed policy: either
//! one value per key (writes overwrite) or an ordered list of values per key
//! (writes append).

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// A logical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Index {
    /// Chain metadata (best block, versions, flags)
    Main = 0,
    /// Block index entries by block hash
    BlockIndex = 1,
    /// Serialized blocks
    Blocks = 2,
    /// Transaction index
    Tx = 3,
    /// Token-protocol transactions
    Ntp1Tx = 4,
    /// Token names to token ids (duplicates allowed)
    Ntp1TokenNames = 5,
    /// Address-book entries: addresses to public keys
    AddrsVsPubKeys = 6,
}

impl Index {
    /// Number of tables; bounds iteration over every table
    pub const COUNT: usize = 7;

    /// Every table, in id order
    pub const ALL: [Index; Index::COUNT] = [
        Index::Main,
        Index::BlockIndex,
        Index::Blocks,
        Index::Tx,
        Index::Ntp1Tx,
        Index::Ntp1TokenNames,
        Index::AddrsVsPubKeys,
    ];

    /// Whether a key may hold several values in this table
    pub const fn duplicate_keys_allowed(self) -> bool {
        matches!(self, Index::Ntp1TokenNames)
    }

    /// Stable numeric id, used on disk
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Position in per-table arrays
    pub(crate) const fn slot(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Index::Main => "main",
            Index::BlockIndex => "block_index",
            Index::Blocks => "blocks",
            Index::Tx => "tx",
            Index::Ntp1Tx => "ntp1_tx",
            Index::Ntp1TokenNames => "ntp1_token_names",
            Index::AddrsVsPubKeys => "addrs_vs_pubkeys",
        }
    }
}

impl TryFrom<u8> for Index {
    type Error = StoreError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Index::ALL
            .get(id as usize)
            .copied()
            .ok_or_else(|| StoreError::InvalidIndex(format!("unknown index id {}", id)))
    }
}

impl FromStr for Index {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Index::ALL
            .iter()
            .copied()
            .find(|index| index.as_str() == s)
            .ok_or_else(|| StoreError::InvalidIndex(format!("unknown index name '{}'", s)))
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
