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

//! All mutable sync state, owned and touched only by the coordinator
//! thread. Plain data; the decisions live in the coordinator.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use keel_core::core::bloom::BloomFilter;
use keel_core::core::hash::Hash;
use keel_core::core::merkle::DecodedMerkleBlock;
use keel_core::core::transaction::Transaction;
use keel_p2p::PeerId;

/// The coordinator's working state.
pub struct SpvState {
	/// Peer we are currently pulling headers from, none once synced
	pub sync_peer: Option<PeerId>,
	/// The wallet's filter; block download is gated on its presence
	pub bloom: Option<BloomFilter>,
	/// Blocks waiting to be fetched as Merkle blocks, keyed by height,
	/// insertion order preserved within a height
	pub blocks_to_download: BTreeMap<u32, Vec<Hash>>,
	/// Merkle blocks that arrived out of order, awaiting in-order import
	pub received_merkle: BTreeMap<u32, Vec<DecodedMerkleBlock>>,
	/// Transactions received outside a Merkle block while not yet in
	/// sync, keyed by txid
	pub solo_txs: HashMap<Hash, Transaction>,
	/// Client transactions waiting for a connected peer
	pub pending_broadcast: Vec<Transaction>,
	/// A rescan waiting for inflight Merkle blocks to drain
	pub pending_rescan: Option<u32>,
	/// Headers older than this are not fetched as Merkle blocks
	pub fast_catchup: u32,
	/// Blocks a peer announced that we haven't linked into the chain yet
	pub peer_broadcast_blocks: HashMap<PeerId, Vec<Hash>>,
	/// Merkle blocks requested per peer, with request time
	pub inflight_merkles: HashMap<PeerId, Vec<((u32, Hash), DateTime<Utc>)>>,
	/// Transactions requested per peer, with request time
	pub inflight_txs: HashMap<PeerId, Vec<(Hash, DateTime<Utc>)>>,
}

impl SpvState {
	/// Fresh state with the configured catchup floor.
	pub fn new(fast_catchup: u32) -> SpvState {
		SpvState {
			sync_peer: None,
			bloom: None,
			blocks_to_download: BTreeMap::new(),
			received_merkle: BTreeMap::new(),
			solo_txs: HashMap::new(),
			pending_broadcast: vec![],
			pending_rescan: None,
			fast_catchup,
			peer_broadcast_blocks: HashMap::new(),
			inflight_merkles: HashMap::new(),
			inflight_txs: HashMap::new(),
		}
	}

	/// Queue a block for download unless it's already queued.
	pub fn queue_block(&mut self, height: u32, hash: Hash) {
		let entry = self.blocks_to_download.entry(height).or_default();
		if !entry.contains(&hash) {
			entry.push(hash);
		}
	}

	/// Whether the block is waiting in the download queue.
	pub fn is_block_queued(&self, hash: &Hash) -> bool {
		self.blocks_to_download
			.values()
			.any(|hashes| hashes.contains(hash))
	}

	/// Whether the block is currently requested from some peer.
	pub fn is_merkle_inflight(&self, hash: &Hash) -> bool {
		self.inflight_merkles
			.values()
			.any(|entries| entries.iter().any(|((_, h), _)| h == hash))
	}

	/// Whether any peer owes us a Merkle block.
	pub fn any_merkles_inflight(&self) -> bool {
		self.inflight_merkles.values().any(|v| !v.is_empty())
	}

	/// Whether any peer owes us a transaction.
	pub fn any_txs_inflight(&self) -> bool {
		self.inflight_txs.values().any(|v| !v.is_empty())
	}

	/// Pulls the next download batch: up to `limit` queued blocks in
	/// ascending (height, insertion) order, cut down to the prefix the
	/// peer can serve (`max_height`). Everything else goes back into the
	/// queue unchanged.
	pub fn take_download_batch(&mut self, limit: usize, max_height: u32) -> Vec<(u32, Hash)> {
		let mut flat: Vec<(u32, Hash)> = vec![];
		for (height, hashes) in std::mem::take(&mut self.blocks_to_download) {
			for hash in hashes {
				flat.push((height, hash));
			}
		}

		let take = flat.len().min(limit);
		let mut cut = 0;
		while cut < take && flat[cut].0 <= max_height {
			cut += 1;
		}
		let rest = flat.split_off(cut);
		for (height, hash) in rest {
			self.blocks_to_download
				.entry(height)
				.or_default()
				.push(hash);
		}
		flat
	}

	/// Put blocks back into the download queue, e.g. when their peer
	/// disconnected or stalled.
	pub fn requeue_blocks(&mut self, blocks: Vec<(u32, Hash)>) {
		for (height, hash) in blocks {
			self.queue_block(height, hash);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn h(n: u8) -> Hash {
		Hash([n; 32])
	}

	#[test]
	fn batch_respects_limit_and_height() {
		let mut state = SpvState::new(0);
		for n in 1..=6u8 {
			state.queue_block(n as u32, h(n));
		}
		// peer serves only up to height 4
		let batch = state.take_download_batch(3, 4);
		assert_eq!(batch, vec![(1, h(1)), (2, h(2)), (3, h(3))]);
		// the rest is still queued, in order
		let batch = state.take_download_batch(10, 4);
		assert_eq!(batch, vec![(4, h(4))]);
		let batch = state.take_download_batch(10, 100);
		assert_eq!(batch, vec![(5, h(5)), (6, h(6))]);
		assert!(state.blocks_to_download.is_empty());
	}

	#[test]
	fn batch_stops_at_unserveable_height() {
		let mut state = SpvState::new(0);
		state.queue_block(8, h(8));
		state.queue_block(9, h(9));
		let batch = state.take_download_batch(10, 7);
		assert!(batch.is_empty());
		assert_eq!(state.blocks_to_download.len(), 2);
	}

	#[test]
	fn queue_deduplicates() {
		let mut state = SpvState::new(0);
		state.queue_block(1, h(1));
		state.queue_block(1, h(1));
		state.queue_block(1, h(2));
		assert_eq!(state.blocks_to_download.get(&1).unwrap().len(), 2);
		assert!(state.is_block_queued(&h(1)));
		assert!(!state.is_block_queued(&h(3)));
	}
}
