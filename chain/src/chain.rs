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

//! Facade and handler for the header chain: validation pipeline, chain
//! selection, commits and the queries the SPV layer drives downloads with.

use std::cell::RefCell;
use std::collections::HashMap;

use lru_cache::LruCache;
use num_bigint::BigUint;

use keel_core::consensus::{
	self, clamp_timespan, decode_compact, hash_to_num, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN,
};
use keel_core::core::hash::{Hash, Hashed};
use keel_core::core::header::BlockHeader;
use keel_core::params::NetworkParams;

use crate::error::{Error, ErrorKind};
use crate::types::{ChainAction, HeaderNode, HeaderStore};

// Number of recently touched nodes kept in front of the store.
const NODE_CACHE_SIZE: usize = 2_000;

/// The single authority on chain structure. Wraps a `HeaderStore` with the
/// validation pipeline, chain selection and the height index, and owns the
/// best-block pointer that orders Merkle-block delivery.
pub struct HeaderChain<S> {
	store: S,
	params: NetworkParams,
	cache: RefCell<LruCache<Hash, HeaderNode>>,
}

impl<S: HeaderStore> HeaderChain<S> {
	/// Builds a chain on the given store. Call `init` before anything else.
	pub fn new(store: S, params: NetworkParams) -> HeaderChain<S> {
		HeaderChain {
			store,
			params,
			cache: RefCell::new(LruCache::new(NODE_CACHE_SIZE)),
		}
	}

	/// The network parameters this chain enforces.
	pub fn params(&self) -> &NetworkParams {
		&self.params
	}

	/// Ensures the genesis node is present and committed, and positions the
	/// best-block pointer past anything older than `fast_catchup`.
	/// Idempotent.
	pub fn init(&self, fast_catchup: u32) -> Result<(), Error> {
		if self.store.get_best()?.is_none() {
			let genesis = self.params.genesis;
			let node = HeaderNode {
				hash: genesis.hash(),
				header: genesis,
				height: 0,
				chain_work: consensus::work(genesis.bits),
				child_hash: None,
				median_times: vec![genesis.timestamp],
				min_work: genesis.bits,
			};
			self.put_node(&node)?;
			self.store.put_height(&node)?;
			self.store.set_best(&node)?;
			self.store.set_best_block(&node)?;
			info!(
				"chain init: saved genesis {} for {}",
				node.hash, self.params.name
			);
		}
		self.advance_best_block(fast_catchup)?;
		Ok(())
	}

	/// Gets a node from its header hash.
	pub fn get_node(&self, hash: &Hash) -> Result<Option<HeaderNode>, Error> {
		if let Some(node) = self.cache.borrow_mut().get_mut(hash) {
			return Ok(Some(node.clone()));
		}
		let node = self.store.get_node(hash)?;
		if let Some(ref node) = node {
			self.cache.borrow_mut().insert(*hash, node.clone());
		}
		Ok(node)
	}

	/// The tip of the most worked validated header chain.
	pub fn best_tip(&self) -> Result<HeaderNode, Error> {
		let hash = self
			.store
			.get_best()?
			.ok_or_else(|| ErrorKind::NotFound("best tip".to_owned()))?;
		self.expect_node(&hash)
	}

	/// The highest Merkle block delivered to the wallet.
	pub fn best_block(&self) -> Result<HeaderNode, Error> {
		let hash = self
			.store
			.get_best_block()?
			.ok_or_else(|| ErrorKind::NotFound("best block".to_owned()))?;
		self.expect_node(&hash)
	}

	/// Whether the node is on the current best chain.
	pub fn is_main_chain(&self, node: &HeaderNode) -> Result<bool, Error> {
		Ok(self.store.get_by_height(node.height)? == Some(node.hash))
	}

	/// Validate and persist a single header. See `connect_headers`.
	pub fn connect_header(
		&self,
		header: &BlockHeader,
		adjusted_time: u32,
		commit: bool,
	) -> Result<ChainAction, Error> {
		self.connect_headers(std::slice::from_ref(header), adjusted_time, commit)
	}

	/// Validate and persist a batch of headers. The batch must be
	/// internally linked; validation fails fast and does not touch the
	/// store on error. With `commit` unset the caller receives the action
	/// but must call `commit_action` itself to make it durable.
	pub fn connect_headers(
		&self,
		headers: &[BlockHeader],
		adjusted_time: u32,
		commit: bool,
	) -> Result<ChainAction, Error> {
		if headers.is_empty() {
			return Ok(ChainAction::KnownChain(vec![]));
		}
		for pair in headers.windows(2) {
			if pair[1].prev_hash != pair[0].hash() {
				return Err(ErrorKind::NotLinked.into());
			}
		}

		// validate everything up front against a batch overlay, so a bad
		// header in the middle leaves no partial state behind
		let mut overlay: HashMap<Hash, HeaderNode> = HashMap::new();
		let mut new_nodes: Vec<HeaderNode> = vec![];
		let mut known: Vec<HeaderNode> = vec![];
		for header in headers {
			let hash = header.hash();
			if let Some(node) = self.get_node(&hash)? {
				known.push(node);
				continue;
			}
			// the checks that need only the header itself come before the
			// parent lookup, so e.g. a garbage proof of work on an orphan
			// reads as bad work, not as a missing parent
			self.verify_header_alone(header, adjusted_time)?;
			let parent = match self.lookup(&overlay, &header.prev_hash)? {
				Some(parent) => parent,
				None => return Err(ErrorKind::ParentUnknown.into()),
			};
			self.verify_header(header, &parent, &overlay)?;
			let node = self.make_node(&parent, header);
			overlay.insert(node.hash, node.clone());
			new_nodes.push(node);
		}

		if new_nodes.is_empty() {
			return Ok(ChainAction::KnownChain(known));
		}
		for node in &new_nodes {
			self.put_node(node)?;
		}
		let action = self.eval_new_chain(&new_nodes)?;
		if commit {
			self.commit_action(&action)?;
		}
		Ok(action)
	}

	/// Chain selection for a freshly validated, linked segment whose nodes
	/// are already persisted. Compares the segment's branch to the current
	/// best chain at their common ancestor.
	pub fn eval_new_chain(&self, new_nodes: &[HeaderNode]) -> Result<ChainAction, Error> {
		let tip = self.best_tip()?;
		let last = match new_nodes.last() {
			Some(last) => last.clone(),
			None => return Ok(ChainAction::KnownChain(vec![])),
		};

		let split = self.common_ancestor(&tip, &last)?;

		// main-chain nodes strictly above the split
		let mut old = vec![];
		for height in (split.height + 1)..=tip.height {
			old.push(self.node_by_height(height)?);
		}
		// the new branch strictly above the split, walking parents so a
		// segment extending an older side chain carries the whole branch
		let mut new = vec![];
		let mut cursor = last;
		while cursor.hash != split.hash {
			new.push(cursor.clone());
			cursor = self.parent_of(&cursor)?;
		}
		new.reverse();

		if new.is_empty() {
			Ok(ChainAction::KnownChain(new_nodes.to_vec()))
		} else if old.is_empty() {
			Ok(ChainAction::BestChain(new))
		} else if new.last().map(|n| &n.chain_work) > old.last().map(|n| &n.chain_work) {
			Ok(ChainAction::ChainReorg { split, old, new })
		} else {
			let mut nodes = vec![split];
			nodes.extend(new);
			Ok(ChainAction::SideChain(nodes))
		}
	}

	/// The only operation that rewrites the height index and the best-tip
	/// pointer. `SideChain` and `KnownChain` are no-ops.
	pub fn commit_action(&self, action: &ChainAction) -> Result<(), Error> {
		let new = match action {
			ChainAction::BestChain(new) => new,
			ChainAction::ChainReorg { new, .. } => new,
			ChainAction::SideChain(_) | ChainAction::KnownChain(_) => return Ok(()),
		};
		let first = match new.first() {
			Some(first) => first,
			None => return Ok(()),
		};

		let mut parent = self
			.get_node(&first.header.prev_hash)?
			.ok_or_else(|| ErrorKind::NotFound(format!("split {}", first.header.prev_hash)))?;
		parent.child_hash = Some(first.hash);
		self.put_node(&parent)?;

		for (i, node) in new.iter().enumerate() {
			let mut node = node.clone();
			node.child_hash = new.get(i + 1).map(|n| n.hash);
			self.put_node(&node)?;
			self.store.put_height(&node)?;
		}
		if let Some(last) = new.last() {
			self.store.set_best(last)?;
		}
		Ok(())
	}

	/// Evaluate a downloaded Merkle block against the best-block pointer.
	/// Returns `None` when the block cannot be placed yet (a gap on the
	/// canonical path), which keeps wallet delivery contiguous. Advances
	/// the pointer through main-chain blocks predating `fast_catchup`,
	/// which are never downloaded.
	pub fn connect_block(
		&self,
		hash: &Hash,
		fast_catchup: u32,
	) -> Result<Option<ChainAction>, Error> {
		let node = match self.get_node(hash)? {
			Some(node) => node,
			None => return Ok(None),
		};
		self.advance_best_block(fast_catchup)?;
		let best = self.best_block()?;

		if node.hash == best.hash {
			return Ok(Some(ChainAction::KnownChain(vec![node])));
		}

		let split = self.common_ancestor(&best, &node)?;
		if split.hash == node.hash {
			// ancestor of something already delivered
			return Ok(Some(ChainAction::KnownChain(vec![node])));
		}

		let on_main = self.is_main_chain(&node)?;
		if node.header.prev_hash == split.hash {
			if split.hash == best.hash && on_main {
				self.store.set_best_block(&node)?;
				return Ok(Some(ChainAction::BestChain(vec![node])));
			}
			if on_main {
				// the delivered tip moves from a stale branch onto the
				// main chain
				let mut old = vec![];
				let mut cursor = best;
				while cursor.hash != split.hash {
					old.push(cursor.clone());
					cursor = self.parent_of(&cursor)?;
				}
				old.reverse();
				self.store.set_best_block(&node)?;
				return Ok(Some(ChainAction::ChainReorg {
					split,
					old,
					new: vec![node],
				}));
			}
			return Ok(Some(ChainAction::SideChain(vec![split, node])));
		}

		if on_main {
			// a canonical block beyond the next expected one, wait for
			// its predecessors
			Ok(None)
		} else {
			Ok(Some(ChainAction::SideChain(vec![split, node])))
		}
	}

	/// Sparse locator over the best chain, dense for the last ten heights
	/// and then thinning geometrically down to genesis.
	pub fn block_locator(&self) -> Result<Vec<Hash>, Error> {
		let tip = self.best_tip()?;
		self.block_locator_at(tip.height)
	}

	/// Locator as if the best chain ended at the given height.
	pub fn block_locator_at(&self, height: u32) -> Result<Vec<Hash>, Error> {
		let mut locator = vec![];
		for h in locator_heights(height) {
			locator.push(self.node_by_height(h)?.hash);
		}
		Ok(locator)
	}

	/// Locator used to chase headers extending a side chain: the most
	/// recent side nodes first, then the regular mainline locator.
	pub fn block_locator_side(&self, action: &ChainAction) -> Result<Vec<Hash>, Error> {
		let mut locator = vec![];
		if let ChainAction::SideChain(nodes) = action {
			// first element is the split, already covered by the mainline
			for node in nodes.iter().skip(1).rev().take(10) {
				locator.push(node.hash);
			}
		}
		locator.extend(self.block_locator()?);
		Ok(locator)
	}

	/// Best-chain blocks above the best-block pointer that are still to be
	/// fetched as Merkle blocks, oldest first.
	pub fn blocks_to_download(&self, fast_catchup: u32) -> Result<Vec<(u32, Hash)>, Error> {
		self.advance_best_block(fast_catchup)?;
		let best = self.best_block()?;
		let tip = self.best_tip()?;
		let mut out = vec![];
		for height in (best.height + 1)..=tip.height {
			out.push((height, self.node_by_height(height)?.hash));
		}
		Ok(out)
	}

	/// Rewind the best-block pointer to just before `fast_catchup` and
	/// re-enumerate everything to download from there.
	pub fn rescan(&self, fast_catchup: u32) -> Result<Vec<(u32, Hash)>, Error> {
		let start = self.node_at_timestamp(fast_catchup)?;
		self.store.set_best_block(&start)?;
		debug!(
			"chain rescan: best block rewound to {} at {}",
			start.hash, start.height
		);
		self.blocks_to_download(fast_catchup)
	}

	/// Up to `n` main-chain nodes following the given one, via child links.
	pub fn node_window(&self, from: &Hash, n: usize) -> Result<Vec<HeaderNode>, Error> {
		let mut cursor = self
			.get_node(from)?
			.ok_or_else(|| ErrorKind::NotFound(format!("node {}", from)))?;
		let mut out = vec![];
		while out.len() < n {
			match cursor.child_hash {
				Some(child) => {
					cursor = self.expect_node(&child)?;
					out.push(cursor.clone());
				}
				None => break,
			}
		}
		Ok(out)
	}

	/// The deepest main-chain node whose timestamp predates `ts`, walking
	/// back from the tip. Genesis if the whole chain is younger.
	pub fn node_at_timestamp(&self, ts: u32) -> Result<HeaderNode, Error> {
		let mut node = self.best_tip()?;
		while node.height > 0 && node.header.timestamp >= ts {
			node = self.parent_of(&node)?;
		}
		Ok(node)
	}

	/// The leading validation steps that need nothing but the header:
	/// proof of work against its own claimed target, and the bound on
	/// timestamps from the future. Runs before the parent lookup.
	fn verify_header_alone(
		&self,
		header: &BlockHeader,
		adjusted_time: u32,
	) -> Result<(), Error> {
		let target = decode_compact(header.bits);
		if target == BigUint::from(0u32) || target > self.params.pow_limit {
			return Err(ErrorKind::BadProofOfWork.into());
		}
		if hash_to_num(&header.hash()) >= target {
			return Err(ErrorKind::BadProofOfWork.into());
		}

		if header.timestamp > adjusted_time + MAX_FUTURE_BLOCK_TIME {
			return Err(ErrorKind::BadTimestamp.into());
		}
		Ok(())
	}

	/// The validation steps that need the header's ancestry, in increasing
	/// order of cost. Any failure rejects the header without touching the
	/// store. `verify_header_alone` has already passed at this point.
	fn verify_header(
		&self,
		header: &BlockHeader,
		parent: &HeaderNode,
		overlay: &HashMap<Hash, HeaderNode>,
	) -> Result<(), Error> {
		// the claimed target must be the one the retarget rule requires
		if header.bits != self.next_work_required(parent, header, overlay)? {
			return Err(ErrorKind::BadWork.into());
		}

		// strictly after the median time of the last eleven ancestors
		if header.timestamp <= parent.median_time_past() {
			return Err(ErrorKind::TimestampTooEarly.into());
		}

		let height = parent.height + 1;
		let tip = self.best_tip()?;
		if height <= self.params.last_checkpoint_before(tip.height) {
			return Err(ErrorKind::RewritesCheckpoint.into());
		}
		if let Some(checkpoint) = self.params.checkpoint_at(height) {
			if *checkpoint != header.hash() {
				return Err(ErrorKind::FailsCheckpoint.into());
			}
		}

		if let Some(boundary) = self.params.reject_v1_height {
			if header.version == 1 && height >= boundary {
				return Err(ErrorKind::DisallowedVersion(header.version).into());
			}
		}
		Ok(())
	}

	/// The compact target the next header after `parent` must carry.
	fn next_work_required(
		&self,
		parent: &HeaderNode,
		header: &BlockHeader,
		overlay: &HashMap<Hash, HeaderNode>,
	) -> Result<u32, Error> {
		let params = &self.params;
		let interval = params.diff_interval();
		let height = parent.height + 1;

		if height % interval != 0 {
			if params.allow_min_difficulty_blocks {
				// a stalled test network may mine at the minimum after
				// twice the target spacing
				if header.timestamp > parent.header.timestamp + 2 * params.target_spacing {
					return Ok(params.pow_limit_bits);
				}
				return Ok(parent.min_work);
			}
			return Ok(parent.header.bits);
		}

		// walk back to the first block of the window, saturating at
		// genesis on chains shorter than the interval
		let mut first = parent.clone();
		for _ in 0..(interval - 1) {
			if first.height == 0 {
				break;
			}
			first = match self.lookup(overlay, &first.header.prev_hash)? {
				Some(node) => node,
				None => {
					return Err(ErrorKind::NotFound(format!(
						"retarget ancestor of {}",
						parent.hash
					))
					.into());
				}
			};
		}
		let actual = clamp_timespan(
			parent.header.timestamp.saturating_sub(first.header.timestamp),
			params.target_timespan,
		);
		Ok(consensus::retarget(
			parent.header.bits,
			actual,
			params.target_timespan,
			&params.pow_limit,
		))
	}

	fn make_node(&self, parent: &HeaderNode, header: &BlockHeader) -> HeaderNode {
		let height = parent.height + 1;
		let mut median_times = vec![header.timestamp];
		median_times.extend(
			parent
				.median_times
				.iter()
				.take(MEDIAN_TIME_SPAN - 1)
				.cloned(),
		);
		let min_work = if header.bits != self.params.pow_limit_bits
			|| height % self.params.diff_interval() == 0
		{
			header.bits
		} else {
			parent.min_work
		};
		HeaderNode {
			hash: header.hash(),
			header: *header,
			height,
			chain_work: parent.chain_work.clone() + consensus::work(header.bits),
			child_hash: None,
			median_times,
			min_work,
		}
	}

	// walk both nodes down to their nearest common ancestor
	fn common_ancestor(
		&self,
		a: &HeaderNode,
		b: &HeaderNode,
	) -> Result<HeaderNode, Error> {
		let mut a = a.clone();
		let mut b = b.clone();
		while a.height > b.height {
			a = self.parent_of(&a)?;
		}
		while b.height > a.height {
			b = self.parent_of(&b)?;
		}
		while a.hash != b.hash {
			a = self.parent_of(&a)?;
			b = self.parent_of(&b)?;
		}
		Ok(a)
	}

	// move the best-block pointer through main-chain successors that are
	// older than the catchup floor and therefore never downloaded
	fn advance_best_block(&self, fast_catchup: u32) -> Result<(), Error> {
		let mut best = self.best_block()?;
		loop {
			let next_hash = match self.store.get_by_height(best.height + 1)? {
				Some(hash) => hash,
				None => break,
			};
			let next = self.expect_node(&next_hash)?;
			if next.header.prev_hash != best.hash {
				// pointer sits on a stale branch, leave it for the
				// reorg import to resolve
				break;
			}
			if next.header.timestamp >= fast_catchup {
				break;
			}
			self.store.set_best_block(&next)?;
			best = next;
		}
		Ok(())
	}

	fn lookup(
		&self,
		overlay: &HashMap<Hash, HeaderNode>,
		hash: &Hash,
	) -> Result<Option<HeaderNode>, Error> {
		if let Some(node) = overlay.get(hash) {
			return Ok(Some(node.clone()));
		}
		self.get_node(hash)
	}

	fn expect_node(&self, hash: &Hash) -> Result<HeaderNode, Error> {
		self.get_node(hash)?
			.ok_or_else(|| ErrorKind::NotFound(format!("node {}", hash)).into())
	}

	fn node_by_height(&self, height: u32) -> Result<HeaderNode, Error> {
		let hash = self
			.store
			.get_by_height(height)?
			.ok_or_else(|| ErrorKind::NotFound(format!("height {}", height)))?;
		self.expect_node(&hash)
	}

	fn parent_of(&self, node: &HeaderNode) -> Result<HeaderNode, Error> {
		if node.height == 0 {
			return Err(ErrorKind::NotFound("parent of genesis".to_owned()).into());
		}
		self.expect_node(&node.header.prev_hash)
	}

	fn put_node(&self, node: &HeaderNode) -> Result<(), Error> {
		self.store.put_node(node)?;
		self.cache.borrow_mut().insert(node.hash, node.clone());
		Ok(())
	}
}

// heights included in a block locator built from `height`: the ten most
// recent, then a geometrically thinning tail, then genesis
fn locator_heights(height: u32) -> Vec<u32> {
	let mut heights = vec![];
	let mut h = height;
	for _ in 0..10 {
		if h == 0 {
			break;
		}
		heights.push(h);
		h -= 1;
	}
	let mut k = 0u32;
	loop {
		let sub = 10u64 + (1u64 << k);
		if u64::from(height) <= sub {
			break;
		}
		heights.push(height - sub as u32);
		k += 1;
	}
	heights.push(0);
	heights
}
