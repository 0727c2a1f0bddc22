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

//! Dynamically-typed guest values.

use serde::{Deserialize, Serialize};

/// A value of the recorded guest language.
///
/// The recorder itself never interprets guest values; it only needs their
/// display renderings for binding records. This enum is the value model of
/// the bundled evaluator and of hosts that choose to share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuestValue {
    /// The unit/absent value
    None,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Immutable string
    Str(String),
    /// Heterogeneous list
    List(Vec<GuestValue>),
    /// Reference to a guest function by code id
    Function(u32),
    /// Opaque host callable, identified by its fully-qualified name
    Builtin(String),
}

impl GuestValue {
    /// Guest truthiness: everything is truthy except `None`, `false`, zero,
    /// the empty string and the empty list.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Function(_) | Self::Builtin(_) => true,
        }
    }

    /// Concrete display rendering used in binding records and query results.
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                // Keep a trailing ".0" so integers and floats render distinctly
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Self::Str(s) => format!("{s:?}"),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Function(code_id) => format!("<function code:{code_id}>"),
            Self::Builtin(name) => format!("<builtin {name}>"),
        }
    }
}

impl std::fmt::Display for GuestValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!GuestValue::None.is_truthy());
        assert!(!GuestValue::Int(0).is_truthy());
        assert!(GuestValue::Int(-1).is_truthy());
        assert!(!GuestValue::Str(String::new()).is_truthy());
        assert!(GuestValue::List(vec![GuestValue::None]).is_truthy());
    }

    #[test]
    fn test_repr() {
        assert_eq!(GuestValue::Int(30).repr(), "30");
        assert_eq!(GuestValue::Float(0.27).repr(), "0.27");
        assert_eq!(GuestValue::Float(3.0).repr(), "3.0");
        assert_eq!(GuestValue::Str("hi".into()).repr(), "\"hi\"");
        assert_eq!(
            GuestValue::List(vec![GuestValue::Int(1), GuestValue::Bool(true)]).repr(),
            "[1, True]"
        );
    }
}
