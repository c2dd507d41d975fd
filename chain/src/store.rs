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

//! Implementations of the `HeaderStore` capability: an LMDB-backed store
//! for running nodes and a hash-map store for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use keel_core::core::hash::Hash;
use keel_store::lmdb_zero as lmdb;
use keel_store::{self as store, to_key, u32_to_key, Store};

use crate::types::{HeaderNode, HeaderStore};

const STORE_NAME: &str = "header_chain";

const NODE_PREFIX: u8 = b'N';
const HEIGHT_PREFIX: u8 = b'I';
const HEAD_KEY: &[u8] = b"T";
const BLOCK_HEAD_KEY: &[u8] = b"B";

/// An implementation of the `HeaderStore` capability backed by the keel
/// key-value store.
pub struct ChainKVStore {
	db: Store,
}

impl ChainKVStore {
	/// Opens the header database within the provided LMDB environment.
	pub fn new(env: Arc<lmdb::Environment>) -> Result<ChainKVStore, store::Error> {
		let db = Store::open(env, STORE_NAME)?;
		Ok(ChainKVStore { db })
	}
}

impl HeaderStore for ChainKVStore {
	fn get_node(&self, hash: &Hash) -> Result<Option<HeaderNode>, store::Error> {
		self.db.get_ser(&to_key(NODE_PREFIX, hash.to_slice()))
	}

	fn put_node(&self, node: &HeaderNode) -> Result<(), store::Error> {
		let batch = self.db.batch()?;
		batch.put_ser(&to_key(NODE_PREFIX, node.hash.to_slice()), node)?;
		batch.commit()
	}

	fn put_height(&self, node: &HeaderNode) -> Result<(), store::Error> {
		let batch = self.db.batch()?;
		batch.put_ser(&u32_to_key(HEIGHT_PREFIX, node.height), &node.hash)?;
		batch.commit()
	}

	fn get_by_height(&self, height: u32) -> Result<Option<Hash>, store::Error> {
		self.db.get_ser(&u32_to_key(HEIGHT_PREFIX, height))
	}

	fn get_best(&self) -> Result<Option<Hash>, store::Error> {
		self.db.get_ser(HEAD_KEY)
	}

	fn set_best(&self, node: &HeaderNode) -> Result<(), store::Error> {
		let batch = self.db.batch()?;
		batch.put_ser(HEAD_KEY, &node.hash)?;
		batch.commit()
	}

	fn get_best_block(&self) -> Result<Option<Hash>, store::Error> {
		self.db.get_ser(BLOCK_HEAD_KEY)
	}

	fn set_best_block(&self, node: &HeaderNode) -> Result<(), store::Error> {
		let batch = self.db.batch()?;
		batch.put_ser(BLOCK_HEAD_KEY, &node.hash)?;
		batch.commit()
	}
}

/// `HeaderStore` kept entirely in memory. Used by the test suites; also
/// handy for throwaway sync experiments where persistence is not wanted.
#[derive(Default)]
pub struct MemoryStore {
	inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
	nodes: HashMap<Hash, HeaderNode>,
	heights: HashMap<u32, Hash>,
	best: Option<Hash>,
	best_block: Option<Hash>,
}

impl MemoryStore {
	/// An empty in-memory store.
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}
}

impl HeaderStore for MemoryStore {
	fn get_node(&self, hash: &Hash) -> Result<Option<HeaderNode>, store::Error> {
		Ok(self.inner.read().unwrap().nodes.get(hash).cloned())
	}

	fn put_node(&self, node: &HeaderNode) -> Result<(), store::Error> {
		self.inner
			.write()
			.unwrap()
			.nodes
			.insert(node.hash, node.clone());
		Ok(())
	}

	fn put_height(&self, node: &HeaderNode) -> Result<(), store::Error> {
		self.inner
			.write()
			.unwrap()
			.heights
			.insert(node.height, node.hash);
		Ok(())
	}

	fn get_by_height(&self, height: u32) -> Result<Option<Hash>, store::Error> {
		Ok(self.inner.read().unwrap().heights.get(&height).cloned())
	}

	fn get_best(&self) -> Result<Option<Hash>, store::Error> {
		Ok(self.inner.read().unwrap().best)
	}

	fn set_best(&self, node: &HeaderNode) -> Result<(), store::Error> {
		self.inner.write().unwrap().best = Some(node.hash);
		Ok(())
	}

	fn get_best_block(&self) -> Result<Option<Hash>, store::Error> {
		Ok(self.inner.read().unwrap().best_block)
	}

	fn set_best_block(&self, node: &HeaderNode) -> Result<(), store::Error> {
		self.inner.write().unwrap().best_block = Some(node.hash);
		Ok(())
	}
}
