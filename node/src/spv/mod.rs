// Copyright 2020 The Keel Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The SPV coordinator: a single-threaded reactor that owns all sync
//! state, reacts to peer events and client requests, schedules downloads
//! and keeps wallet delivery in order.

mod coordinator;
mod state;

pub use self::coordinator::SpvCoordinator;
pub use self::state::SpvState;

use keel_core::core::bloom::BloomFilter;
use keel_core::core::transaction::Transaction;
use keel_p2p::PeerEvent;

/// Seconds after which an unanswered request counts as stalled. The
/// heartbeat fires on the same cadence.
pub const STALL_TIMEOUT_SECS: i64 = 120;

/// Largest number of Merkle blocks requested from one peer in one batch.
pub const MAX_MERKLE_BATCH: usize = 500;

/// What a client may ask of the running node. There is no reply channel;
/// effects reach the wallet through its sink.
pub enum ClientRequest {
	/// Replace the bloom filter; empty filters are ignored
	UpdateBloom(BloomFilter),
	/// Broadcast a transaction, now or as soon as a peer connects
	PublishTx(Transaction),
	/// Redownload Merkle blocks from the given timestamp on
	Rescan(u32),
	/// Periodic tick driving stall recovery
	Heartbeat,
}

/// Everything arriving in the coordinator mailbox.
pub enum SpvEvent {
	/// From a peer connection
	Peer(PeerEvent),
	/// From the client handle or the heartbeat task
	Client(ClientRequest),
}
