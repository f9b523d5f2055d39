// Lock modes and their conflict matrix
//
// Table-level modes follow PostgreSQL's explicit locking table, row-level modes
// follow its SELECT ... FOR KEY SHARE / SHARE / NO KEY UPDATE / UPDATE clauses.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Granularity a lock mode applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Table,
    Row,
}

/// Lock modes, ordered from weakest to strongest within each granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
    ForKeyShare,
    ForShare,
    ForNoKeyUpdate,
    ForUpdate,
}

const fn bit(mode: LockMode) -> u16 {
    1 << mode as u16
}

const ALL_TABLE_MODES: u16 = 0x00ff;
const ALL_ROW_MODES: u16 = 0x0f00;

/// `CONFLICTS[m]` has bit `n` set iff mode `m` conflicts with mode `n`
const CONFLICTS: [u16; LockMode::COUNT] = [
    // AccessShare
    bit(LockMode::AccessExclusive),
    // RowShare
    bit(LockMode::Exclusive) | bit(LockMode::AccessExclusive),
    // RowExclusive
    bit(LockMode::Share)
        | bit(LockMode::ShareRowExclusive)
        | bit(LockMode::Exclusive)
        | bit(LockMode::AccessExclusive),
    // ShareUpdateExclusive
    bit(LockMode::ShareUpdateExclusive)
        | bit(LockMode::Share)
        | bit(LockMode::ShareRowExclusive)
        | bit(LockMode::Exclusive)
        | bit(LockMode::AccessExclusive),
    // Share
    bit(LockMode::RowExclusive)
        | bit(LockMode::ShareUpdateExclusive)
        | bit(LockMode::ShareRowExclusive)
        | bit(LockMode::Exclusive)
        | bit(LockMode::AccessExclusive),
    // ShareRowExclusive
    bit(LockMode::RowExclusive)
        | bit(LockMode::ShareUpdateExclusive)
        | bit(LockMode::Share)
        | bit(LockMode::ShareRowExclusive)
        | bit(LockMode::Exclusive)
        | bit(LockMode::AccessExclusive),
    // Exclusive
    ALL_TABLE_MODES & !bit(LockMode::AccessShare),
    // AccessExclusive
    ALL_TABLE_MODES,
    // ForKeyShare
    bit(LockMode::ForUpdate),
    // ForShare
    bit(LockMode::ForNoKeyUpdate) | bit(LockMode::ForUpdate),
    // ForNoKeyUpdate
    bit(LockMode::ForShare) | bit(LockMode::ForNoKeyUpdate) | bit(LockMode::ForUpdate),
    // ForUpdate
    ALL_ROW_MODES,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown lock mode: {0}")]
pub struct ParseLockModeError(pub String);

impl LockMode {
    pub const COUNT: usize = 12;

    pub const ALL: [LockMode; LockMode::COUNT] = [
        LockMode::AccessShare,
        LockMode::RowShare,
        LockMode::RowExclusive,
        LockMode::ShareUpdateExclusive,
        LockMode::Share,
        LockMode::ShareRowExclusive,
        LockMode::Exclusive,
        LockMode::AccessExclusive,
        LockMode::ForKeyShare,
        LockMode::ForShare,
        LockMode::ForNoKeyUpdate,
        LockMode::ForUpdate,
    ];

    pub fn granularity(self) -> Granularity {
        if bit(self) & ALL_TABLE_MODES != 0 {
            Granularity::Table
        } else {
            Granularity::Row
        }
    }

    /// Whether two different transactions may not hold `self` and `other` at once
    #[inline]
    pub fn conflicts_with(self, other: LockMode) -> bool {
        CONFLICTS[self as usize] & bit(other) != 0
    }

    #[inline]
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        !self.conflicts_with(other)
    }

    pub fn is_self_conflicting(self) -> bool {
        self.conflicts_with(self)
    }

    /// Holding `self` already blocks everything `requested` would block,
    /// so granting `requested` on top of it changes nothing for other transactions.
    #[inline]
    pub fn covers(self, requested: LockMode) -> bool {
        if self.granularity() != requested.granularity() {
            return false;
        }
        let held = CONFLICTS[self as usize];
        let wanted = CONFLICTS[requested as usize];
        held & wanted == wanted
    }

    pub fn name(self) -> &'static str {
        match self {
            LockMode::AccessShare => "ACCESS SHARE",
            LockMode::RowShare => "ROW SHARE",
            LockMode::RowExclusive => "ROW EXCLUSIVE",
            LockMode::ShareUpdateExclusive => "SHARE UPDATE EXCLUSIVE",
            LockMode::Share => "SHARE",
            LockMode::ShareRowExclusive => "SHARE ROW EXCLUSIVE",
            LockMode::Exclusive => "EXCLUSIVE",
            LockMode::AccessExclusive => "ACCESS EXCLUSIVE",
            LockMode::ForKeyShare => "FOR KEY SHARE",
            LockMode::ForShare => "FOR SHARE",
            LockMode::ForNoKeyUpdate => "FOR NO KEY UPDATE",
            LockMode::ForUpdate => "FOR UPDATE",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts the SQL spelling in any case, with spaces, underscores or dashes
/// between words ("row exclusive", "ROW_EXCLUSIVE", "for-update").
impl FromStr for LockMode {
    type Err = ParseLockModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();

        LockMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.name() == normalized)
            .ok_or_else(|| ParseLockModeError(s.to_string()))
    }
}
