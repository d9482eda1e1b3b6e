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

/// Request-queue errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The peer made no progress for `max.retry` milliseconds and the
    /// node must be considered down.
    PeerDown,
    /// The request was dropped because the queue shut down.
    Cancelled,
    /// The request was performed on the server and failed there. The
    /// message describes the server-side failure. Not retried.
    RequestFailed(String),
    /// The queue has been shut down and accepts no further requests.
    Shutdown,
    /// A configuration option had an invalid value.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let s = match *self {
            Error::PeerDown => "Peer made no progress and is considered down".into(),
            Error::Cancelled => "Request cancelled by shutdown".into(),
            Error::RequestFailed(ref msg) => format!("Request failed on the server: {msg}"),
            Error::Shutdown => "Request queue has been shut down".into(),
            Error::Config(ref msg) => format!("Invalid configuration: {msg}"),
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for Error {}
