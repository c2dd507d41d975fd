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

//! Base types for the header chain: the persisted header node, the chain
//! selection outcome and the storage capability the chain builds on.

use num_bigint::BigUint;

use keel_core::consensus::MEDIAN_TIME_SPAN;
use keel_core::core::hash::Hash;
use keel_core::core::header::BlockHeader;
use keel_core::ser::{self, Readable, Reader, Writeable, Writer};
use keel_store as store;

/// A block header as the chain stores it: annotated with its position and
/// cumulative work. Created on first successful validation, never deleted;
/// the only later mutation is setting `child_hash` when a descendant is
/// committed to the main chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNode {
	/// The header's own hash
	pub hash: Hash,
	/// The header itself
	pub header: BlockHeader,
	/// Distance from genesis
	pub height: u32,
	/// Total expected hash trials from genesis up to and including this
	/// header
	pub chain_work: BigUint,
	/// Main-chain successor, set on commit only
	pub child_hash: Option<Hash>,
	/// Timestamps of this header and up to ten ancestors, newest first
	pub median_times: Vec<u32>,
	/// Bits of the last block that was not mined at the minimum difficulty
	/// (relevant on networks that allow such blocks)
	pub min_work: u32,
}

impl HeaderNode {
	/// Median of the stored timestamp window. New headers must be strictly
	/// later than their parent's median time past.
	pub fn median_time_past(&self) -> u32 {
		let mut times = self.median_times.clone();
		times.sort_unstable();
		times[times.len() / 2]
	}
}

impl Writeable for HeaderNode {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.hash.write(writer)?;
		self.header.write(writer)?;
		writer.write_u32(self.height)?;
		writer.write_bytes(&self.chain_work.to_bytes_be())?;
		match self.child_hash {
			Some(ref child) => {
				writer.write_u8(1)?;
				child.write(writer)?;
			}
			None => writer.write_u8(0)?,
		}
		writer.write_u8(self.median_times.len() as u8)?;
		for t in &self.median_times {
			writer.write_u32(*t)?;
		}
		writer.write_u32(self.min_work)
	}
}

impl Readable for HeaderNode {
	fn read<R: Reader>(reader: &mut R) -> Result<HeaderNode, ser::Error> {
		let hash = Hash::read(reader)?;
		let header = BlockHeader::read(reader)?;
		let height = reader.read_u32()?;
		let chain_work = BigUint::from_bytes_be(&reader.read_bytes_len_prefix()?);
		let child_hash = match reader.read_u8()? {
			0 => None,
			1 => Some(Hash::read(reader)?),
			_ => return Err(ser::Error::CorruptedData),
		};
		let median_len = reader.read_u8()? as usize;
		if median_len == 0 || median_len > MEDIAN_TIME_SPAN {
			return Err(ser::Error::CorruptedData);
		}
		let mut median_times = Vec::with_capacity(median_len);
		for _ in 0..median_len {
			median_times.push(reader.read_u32()?);
		}
		let min_work = reader.read_u32()?;
		Ok(HeaderNode {
			hash,
			header,
			height,
			chain_work,
			child_hash,
			median_times,
			min_work,
		})
	}
}

/// Outcome of connecting one or more headers (or one Merkle block) to the
/// chain, relative to the current tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainAction {
	/// The new nodes extend the current best chain
	BestChain(Vec<HeaderNode>),
	/// The new nodes outwork the current best chain; `old` is the replaced
	/// main-chain suffix and `new` the replacement, both strictly above
	/// `split`
	ChainReorg {
		/// Highest node common to both branches
		split: HeaderNode,
		/// Main-chain nodes being abandoned, lowest first
		old: Vec<HeaderNode>,
		/// Nodes of the heavier branch, lowest first
		new: Vec<HeaderNode>,
	},
	/// The new nodes form or extend a branch that doesn't outwork the best
	/// chain. The first element is the split node on the main chain.
	SideChain(Vec<HeaderNode>),
	/// Everything submitted was already known
	KnownChain(Vec<HeaderNode>),
}

impl ChainAction {
	/// The newly accepted node this action was produced for, if any: the
	/// tip of the connected segment. `KnownChain` accepted nothing.
	pub fn accepted_node(&self) -> Option<&HeaderNode> {
		match self {
			ChainAction::BestChain(new) => new.last(),
			ChainAction::ChainReorg { new, .. } => new.last(),
			ChainAction::SideChain(nodes) => {
				if nodes.len() > 1 {
					nodes.last()
				} else {
					None
				}
			}
			ChainAction::KnownChain(_) => None,
		}
	}

	/// Short human readable tag for logging.
	pub fn name(&self) -> &'static str {
		match self {
			ChainAction::BestChain(_) => "best",
			ChainAction::ChainReorg { .. } => "reorg",
			ChainAction::SideChain(_) => "side",
			ChainAction::KnownChain(_) => "known",
		}
	}
}

/// Storage capability the header chain is generic over. Keys and values are
/// opaque to implementations; read-your-writes is expected within a single
/// logical commit, durability at batch boundaries is sufficient.
pub trait HeaderStore {
	/// Fetch a node by its header hash.
	fn get_node(&self, hash: &Hash) -> Result<Option<HeaderNode>, store::Error>;
	/// Persist a node under its header hash.
	fn put_node(&self, node: &HeaderNode) -> Result<(), store::Error>;
	/// Index the node's hash under its height. Only ever called for nodes
	/// being committed to the main chain.
	fn put_height(&self, node: &HeaderNode) -> Result<(), store::Error>;
	/// Main-chain hash at the given height, if that height has been
	/// committed.
	fn get_by_height(&self, height: u32) -> Result<Option<Hash>, store::Error>;
	/// Hash of the best header tip.
	fn get_best(&self) -> Result<Option<Hash>, store::Error>;
	/// Move the best header tip.
	fn set_best(&self, node: &HeaderNode) -> Result<(), store::Error>;
	/// Hash of the highest Merkle block delivered to the wallet.
	fn get_best_block(&self) -> Result<Option<Hash>, store::Error>;
	/// Move the best-block pointer.
	fn set_best_block(&self, node: &HeaderNode) -> Result<(), store::Error>;
}
