// Copyright 2020-2026 Simserve developers.
// This file is part of Simserve.

// Simserve is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Simserve is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Simserve.  If not, see <http://www.gnu.org/licenses/>.

use std::fmt;

/// A totally ordered binding name, with synthetic end markers.
///
/// Real names order lexicographically on their bytes. `First` sorts
/// below every name and is never stored as a cache entry; `Last` sorts
/// above every name and backs the single upper sentinel entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum BindingKey {
    First,
    Name(String),
    Last,
}

impl BindingKey {
    pub fn for_name(name: &str) -> Self {
        BindingKey::Name(name.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, BindingKey::Name(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BindingKey::First => write!(f, "<first>"),
            BindingKey::Name(name) => write!(f, "{name}"),
            BindingKey::Last => write!(f, "<last>"),
        }
    }
}
