// ODB - Origin Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Origin tokens: per-value identifiers for provenance tracking.

use serde::{Deserialize, Serialize};

/// Origin token: the identity of one produced guest value.
///
/// A token packs the producing thread and the per-thread instruction counter
/// at which the value was produced into a single 64-bit word:
/// the upper 16 bits hold the thread id, the lower 48 bits the counter.
/// Tokens are unique across a trace. [`Tok::NONE`] (the all-zero token) is
/// reserved for "unknown / constant without history".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Tok(u64);

impl Tok {
    /// Number of bits reserved for the per-thread counter.
    pub const COUNTER_BITS: u32 = 48;
    /// Mask extracting the counter part.
    pub const COUNTER_MASK: u64 = (1 << Self::COUNTER_BITS) - 1;
    /// Reserved token for values with no recorded history.
    pub const NONE: Self = Self(0);

    /// Pack a thread id and counter into a token.
    ///
    /// Counters are 48-bit; the recorder aborts a session long before the
    /// counter space is exhausted, so the truncating mask never loses bits in
    /// practice.
    pub fn new(thread_id: u16, counter: u64) -> Self {
        Self(((thread_id as u64) << Self::COUNTER_BITS) | (counter & Self::COUNTER_MASK))
    }

    /// The raw 64-bit representation.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a token from its raw 64-bit representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The thread that produced this value.
    pub fn thread_id(self) -> u16 {
        (self.0 >> Self::COUNTER_BITS) as u16
    }

    /// The instruction counter at which this value was produced.
    pub fn counter(self) -> u64 {
        self.0 & Self::COUNTER_MASK
    }

    /// Whether this is the reserved no-history token.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "{}:{}", self.thread_id(), self.counter())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_packing() {
        let tok = Tok::new(3, 0x1234_5678_9abc);
        assert_eq!(tok.thread_id(), 3);
        assert_eq!(tok.counter(), 0x1234_5678_9abc);
        assert!(!tok.is_none());
    }

    #[test]
    fn test_none_token() {
        assert!(Tok::NONE.is_none());
        assert_eq!(Tok::NONE.counter(), 0);
        assert_eq!(Tok::new(0, 0), Tok::NONE);
        assert_eq!(format!("{}", Tok::NONE), "-");
    }

    #[test]
    fn test_counter_truncation() {
        // 49-bit counter loses its top bit but never bleeds into the thread id
        let tok = Tok::new(1, 1 << 48);
        assert_eq!(tok.thread_id(), 1);
        assert_eq!(tok.counter(), 0);
    }
}
