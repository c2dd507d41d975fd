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

//! Merkle blocks: a block header plus a partial Merkle tree proving which
//! transactions of the block matched the wallet filter. The partial tree is
//! a depth-first traversal where a flag bit per visited node says whether
//! the subtree contains a match; pruned subtrees carry their hash directly.

use crate::core::hash::{read_hashes, sha256d, write_hashes, Hash};
use crate::core::header::BlockHeader;
use crate::core::transaction::Transaction;
use crate::ser::{Error, Readable, Reader, Writeable, Writer};

/// Upper bound on transactions in a block we are willing to consider.
/// DoS guard against absurd `total_tx` claims.
const MAX_BLOCK_TXS: u32 = 1_000_000;

/// Errors extracting the partial Merkle tree.
#[derive(Debug, Fail, PartialEq, Eq)]
pub enum MerkleError {
	/// The tree claims no transactions at all
	#[fail(display = "no transactions in partial tree")]
	NoTransactions,
	/// The claimed transaction count is beyond any plausible block
	#[fail(display = "partial tree claims too many transactions")]
	TooManyTransactions,
	/// The traversal needed more flag bits than were provided
	#[fail(display = "ran out of flag bits")]
	MissingFlagBits,
	/// The traversal needed more hashes than were provided
	#[fail(display = "ran out of hashes")]
	MissingHashes,
	/// Left and right child of a node are identical, which allows faking
	/// the tree width
	#[fail(display = "duplicate node in partial tree")]
	DuplicateNode,
	/// Hashes or flag bytes were left over after the traversal completed
	#[fail(display = "partial tree not fully consumed")]
	NotConsumed,
}

/// A block header with a partial Merkle tree over the block's transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
	/// The block header
	pub header: BlockHeader,
	/// Number of transactions in the full block
	pub total_tx: u32,
	/// Hashes in depth-first traversal order
	pub hashes: Vec<Hash>,
	/// Flag bits, little-endian within each byte
	pub flags: Vec<u8>,
}

impl MerkleBlock {
	/// Walk the partial tree, returning the Merkle root it commits to and
	/// the transaction ids it claims matched the filter, in block order.
	/// The caller is responsible for comparing the root to the header's.
	pub fn extract_matches(&self) -> Result<(Hash, Vec<Hash>), MerkleError> {
		if self.total_tx == 0 {
			return Err(MerkleError::NoTransactions);
		}
		if self.total_tx > MAX_BLOCK_TXS {
			return Err(MerkleError::TooManyTransactions);
		}

		let mut height = 0;
		while self.row_width(height) > 1 {
			height += 1;
		}

		let mut walker = TreeWalker {
			mb: self,
			bits_used: 0,
			hashes_used: 0,
			matches: vec![],
		};
		let root = walker.traverse(height, 0)?;

		if walker.hashes_used != self.hashes.len() {
			return Err(MerkleError::NotConsumed);
		}
		if (walker.bits_used + 7) / 8 != self.flags.len() {
			return Err(MerkleError::NotConsumed);
		}
		Ok((root, walker.matches))
	}

	// number of nodes at the given height of the tree, leaves at zero
	fn row_width(&self, height: u32) -> u32 {
		(self.total_tx + (1 << height) - 1) >> height
	}
}

struct TreeWalker<'a> {
	mb: &'a MerkleBlock,
	bits_used: usize,
	hashes_used: usize,
	matches: Vec<Hash>,
}

impl<'a> TreeWalker<'a> {
	fn next_bit(&mut self) -> Result<u8, MerkleError> {
		if self.bits_used >= self.mb.flags.len() * 8 {
			return Err(MerkleError::MissingFlagBits);
		}
		let bit = (self.mb.flags[self.bits_used >> 3] >> (self.bits_used & 7)) & 1;
		self.bits_used += 1;
		Ok(bit)
	}

	fn next_hash(&mut self) -> Result<Hash, MerkleError> {
		if self.hashes_used >= self.mb.hashes.len() {
			return Err(MerkleError::MissingHashes);
		}
		let hash = self.mb.hashes[self.hashes_used];
		self.hashes_used += 1;
		Ok(hash)
	}

	fn traverse(&mut self, height: u32, pos: u32) -> Result<Hash, MerkleError> {
		let flag = self.next_bit()?;
		if height == 0 || flag == 0 {
			// pruned subtree or leaf, hash is carried directly
			let hash = self.next_hash()?;
			if height == 0 && flag == 1 {
				self.matches.push(hash);
			}
			Ok(hash)
		} else {
			let left = self.traverse(height - 1, pos * 2)?;
			let right = if pos * 2 + 1 < self.mb.row_width(height - 1) {
				let right = self.traverse(height - 1, pos * 2 + 1)?;
				if right == left {
					return Err(MerkleError::DuplicateNode);
				}
				right
			} else {
				// odd row, last node pairs with itself
				left
			};
			Ok(combine(&left, &right))
		}
	}
}

/// Hash of an inner tree node from its two children.
pub fn combine(left: &Hash, right: &Hash) -> Hash {
	let mut data = Vec::with_capacity(64);
	data.extend_from_slice(left.to_slice());
	data.extend_from_slice(right.to_slice());
	sha256d(&data)
}

impl Writeable for MerkleBlock {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		self.header.write(writer)?;
		writer.write_u32(self.total_tx)?;
		write_hashes(writer, &self.hashes)?;
		writer.write_bytes(&self.flags)
	}
}

impl Readable for MerkleBlock {
	fn read<R: Reader>(reader: &mut R) -> Result<MerkleBlock, Error> {
		let header = BlockHeader::read(reader)?;
		let total_tx = reader.read_u32()?;
		let hashes = read_hashes(reader, MAX_BLOCK_TXS as usize)?;
		let flags = reader.read_bytes_len_prefix()?;
		Ok(MerkleBlock {
			header,
			total_tx,
			hashes,
			flags,
		})
	}
}

/// A Merkle block after the per-peer codec has walked its partial tree and
/// collected the trailing matching transactions the peer sent along with it.
#[derive(Debug, Clone)]
pub struct DecodedMerkleBlock {
	/// The raw Merkle block
	pub merkle: MerkleBlock,
	/// Root the partial tree commits to
	pub root: Hash,
	/// Transaction ids the tree claims matched, in block order
	pub expected: Vec<Hash>,
	/// Matching transactions received so far
	pub txs: Vec<Transaction>,
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::core::hash::ZERO_HASH;

	fn header_with_root(root: Hash) -> BlockHeader {
		BlockHeader {
			version: 2,
			prev_hash: ZERO_HASH,
			merkle_root: root,
			timestamp: 0,
			bits: 0x207fffff,
			nonce: 0,
		}
	}

	#[test]
	fn single_tx_match() {
		let txid = Hash([5; 32]);
		let mb = MerkleBlock {
			header: header_with_root(txid),
			total_tx: 1,
			hashes: vec![txid],
			flags: vec![0x01],
		};
		let (root, matches) = mb.extract_matches().unwrap();
		assert_eq!(root, txid);
		assert_eq!(matches, vec![txid]);
	}

	#[test]
	fn two_txs_one_match() {
		let a = Hash([1; 32]);
		let b = Hash([2; 32]);
		let root = combine(&a, &b);
		// root visited (bit 1), left pruned (bit 0), right matched leaf (bit 1)
		let mb = MerkleBlock {
			header: header_with_root(root),
			total_tx: 2,
			hashes: vec![a, b],
			flags: vec![0b0000_0101],
		};
		let (extracted, matches) = mb.extract_matches().unwrap();
		assert_eq!(extracted, root);
		assert_eq!(matches, vec![b]);
	}

	#[test]
	fn three_txs_all_match() {
		let a = Hash([1; 32]);
		let b = Hash([2; 32]);
		let c = Hash([3; 32]);
		let ab = combine(&a, &b);
		let cc = combine(&c, &c);
		let root = combine(&ab, &cc);
		// full traversal: every inner node and leaf flagged; the lone
		// right node at height one duplicates itself without a flag
		let mb = MerkleBlock {
			header: header_with_root(root),
			total_tx: 3,
			hashes: vec![a, b, c],
			flags: vec![0b0011_1111],
		};
		let (extracted, matches) = mb.extract_matches().unwrap();
		assert_eq!(extracted, root);
		assert_eq!(matches, vec![a, b, c]);
	}

	#[test]
	fn no_match() {
		let root = Hash([9; 32]);
		let mb = MerkleBlock {
			header: header_with_root(root),
			total_tx: 4,
			hashes: vec![root],
			flags: vec![0x00],
		};
		let (extracted, matches) = mb.extract_matches().unwrap();
		assert_eq!(extracted, root);
		assert!(matches.is_empty());
	}

	#[test]
	fn duplicate_node_rejected() {
		let a = Hash([1; 32]);
		let mb = MerkleBlock {
			header: header_with_root(a),
			total_tx: 2,
			hashes: vec![a, a],
			flags: vec![0b0000_0111],
		};
		assert_eq!(mb.extract_matches().unwrap_err(), MerkleError::DuplicateNode);
	}

	#[test]
	fn leftovers_rejected() {
		let txid = Hash([5; 32]);
		let mb = MerkleBlock {
			header: header_with_root(txid),
			total_tx: 1,
			hashes: vec![txid, txid],
			flags: vec![0x01],
		};
		assert_eq!(mb.extract_matches().unwrap_err(), MerkleError::NotConsumed);
	}
}
