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

use std::sync::Arc;

use keel_chain::{ChainKVStore, HeaderChain, HeaderNode};
use keel_core::consensus::{decode_compact, hash_to_num};
use keel_core::core::hash::{Hash, Hashed};
use keel_core::core::header::BlockHeader;
use keel_core::params::NetworkParams;

fn mine(parent: &HeaderNode, timestamp: u32, bits: u32) -> BlockHeader {
	let mut header = BlockHeader {
		version: 2,
		prev_hash: parent.hash,
		merkle_root: Hash([0; 32]),
		timestamp,
		bits,
		nonce: 0,
	};
	let target = decode_compact(bits);
	while hash_to_num(&header.hash()) >= target {
		header.nonce += 1;
	}
	header
}

#[test]
fn chain_survives_reopen() {
	let dir = tempfile::tempdir().unwrap();
	let env = Arc::new(keel_store::new_env(dir.path().to_str().unwrap().to_owned()).unwrap());

	{
		let store = ChainKVStore::new(env.clone()).unwrap();
		let chain = HeaderChain::new(store, NetworkParams::regtest());
		chain.init(0).unwrap();

		let mut parent = chain.best_tip().unwrap();
		for _ in 0..5 {
			let header = mine(
				&parent,
				parent.header.timestamp + 600,
				chain.params().pow_limit_bits,
			);
			let action = chain
				.connect_header(&header, header.timestamp + 60, true)
				.unwrap();
			parent = action.accepted_node().unwrap().clone();
		}
		assert_eq!(chain.best_tip().unwrap().height, 5);

		// deliver the first two blocks so the pointer moves
		for height in 1..=2 {
			let hash = chain.block_locator_at(height).unwrap()[0];
			chain.connect_block(&hash, 0).unwrap().unwrap();
		}
	}

	// a fresh chain on the same environment picks everything back up
	let store = ChainKVStore::new(env).unwrap();
	let chain = HeaderChain::new(store, NetworkParams::regtest());
	chain.init(0).unwrap();

	let tip = chain.best_tip().unwrap();
	assert_eq!(tip.height, 5);
	assert_eq!(chain.best_block().unwrap().height, 2);
	assert_eq!(chain.blocks_to_download(0).unwrap().len(), 3);

	// the persisted chain links all the way back to genesis
	let mut node = tip;
	while node.height > 0 {
		node = chain.get_node(&node.header.prev_hash).unwrap().unwrap();
	}
	assert_eq!(node.header, chain.params().genesis);
}
