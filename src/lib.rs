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

//! Facade over the data service core: the client-side binding cache, the
//! keyed lock manager, and the reliable request queue that connects a node
//! to the central store.

pub extern crate simserve_cache as cache;
pub extern crate simserve_locks as locks;
pub extern crate simserve_queue as queue;

pub use cache::{BindingCache, BindingKey, BindingStore};
pub use locks::{LockManager, Locker};
pub use queue::{RequestQueueClient, RequestQueueListener, RequestQueueServer};
