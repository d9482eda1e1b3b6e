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

/// Store and cache errors surfaced to the calling transaction, which is
/// expected to abort and, for the recoverable kinds, retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Waited past the deadline. Recoverable by abort and retry.
    Timeout,
    /// A wait was cooperatively cancelled.
    Interrupted,
    /// The transaction's locker was chosen as a deadlock victim and must
    /// be discarded.
    Deadlock,
    /// A no-wait lock attempt found the lock held.
    Blocked,
    /// The server node is unreachable and considered down.
    PeerDown,
    /// The operation was performed on the server and failed there; not
    /// retried automatically.
    RequestFailed(String),
    /// An internal invariant does not hold. Fatal.
    InvalidState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let s = match *self {
            Error::Timeout => "Operation timed out".into(),
            Error::Interrupted => "Operation was interrupted".into(),
            Error::Deadlock => "Transaction must abort: deadlock".into(),
            Error::Blocked => "Lock is held by another transaction".into(),
            Error::PeerDown => "Server node is down".into(),
            Error::RequestFailed(ref msg) => format!("Request failed on the server: {msg}"),
            Error::InvalidState(ref msg) => format!("Invalid cache state: {msg}"),
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for Error {}

impl From<simserve_queue::Error> for Error {
    fn from(err: simserve_queue::Error) -> Self {
        match err {
            simserve_queue::Error::PeerDown => Error::PeerDown,
            simserve_queue::Error::RequestFailed(msg) => Error::RequestFailed(msg),
            simserve_queue::Error::Cancelled => Error::RequestFailed("request cancelled".into()),
            simserve_queue::Error::Shutdown | simserve_queue::Error::Config(_) => {
                Error::InvalidState(err.to_string())
            }
        }
    }
}
