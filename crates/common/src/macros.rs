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

//! Conditional assertion macros for ODB testing
//!
//! These macros provide assertions that only execute when the `ODB_ASSERT`
//! environment variable is set at compile time. This allows for optional strict
//! validation during testing without affecting production runs. The recorder's
//! fatal invariant checks (I1-I5) do NOT go through these macros; they always
//! run and report through the error path instead of panicking.

/// Assert a condition only when the `ODB_ASSERT` environment variable is set.
///
/// This macro behaves like the standard `assert!` macro, but only executes when
/// the `ODB_ASSERT` environment variable is set at compile time.
///
/// # Examples
///
/// ```ignore
/// use odb_common::odb_assert;
///
/// let depth = 3;
/// odb_assert!(depth == 3);
/// odb_assert!(depth == 3, "shadow depth should be 3, got {}", depth);
/// ```
#[macro_export]
macro_rules! odb_assert {
    ($($arg:tt)*) => {
        if option_env!("ODB_ASSERT").is_some() {
            assert!($($arg)*);
        }
    };
}

/// Assert two expressions are equal only when `ODB_ASSERT` is set.
///
/// This macro behaves like the standard `assert_eq!` macro, but only executes
/// when the `ODB_ASSERT` environment variable is set at compile time.
#[macro_export]
macro_rules! odb_assert_eq {
    ($($arg:tt)*) => {
        if option_env!("ODB_ASSERT").is_some() {
            assert_eq!($($arg)*);
        }
    };
}
