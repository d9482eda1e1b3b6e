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

//! A reliable, ordered request channel between a client node and a
//! server node.
//!
//! Requests are delivered in submission order and performed at most once
//! successfully, across arbitrary transient disconnects. The client keeps
//! a bounded window of sent-but-unacknowledged requests and retransmits
//! it, with the original sequence numbers, after reconnecting; the server
//! recognizes sequence numbers it has already processed and replays the
//! recorded acknowledgment instead of executing the request again.
//!
//! Transport failures never surface to callers: the client reconnects
//! internally and only reports [`Error::PeerDown`] once `max.retry`
//! milliseconds pass without an acknowledgment. Failures of the request
//! itself on the server are delivered to the originating request's
//! completion callback and are not retried.

#[macro_use]
extern crate log;

use std::time::{SystemTime, UNIX_EPOCH};

mod client;
mod config;
mod error;
pub mod frame;
mod server;

pub use client::{Connector, Request, RequestQueueClient, TcpConnector};
pub use config::Config;
pub use error::Error;
pub use server::{
    HandlerError, RequestHandler, RequestQueueListener, RequestQueueServer, ServerConfig,
    ServerDispatcher,
};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
