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

//! Block headers, the only part of a block an SPV node fully validates.

use crate::core::hash::{Hash, Hashed};
use crate::ser::{Error, Readable, Reader, Writeable, Writer};

/// An 80-byte block header. The double SHA-256 of its serialization is the
/// block hash, which must meet the compact difficulty target in `bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
	/// Protocol version of the block
	pub version: i32,
	/// Hash of the previous block header
	pub prev_hash: Hash,
	/// Root of the Merkle tree over the block's transactions
	pub merkle_root: Hash,
	/// Block timestamp, seconds since the unix epoch
	pub timestamp: u32,
	/// Difficulty target in compact representation
	pub bits: u32,
	/// Nonce ground by the miner to satisfy the target
	pub nonce: u32,
}

impl Writeable for BlockHeader {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_i32(self.version)?;
		self.prev_hash.write(writer)?;
		self.merkle_root.write(writer)?;
		writer.write_u32(self.timestamp)?;
		writer.write_u32(self.bits)?;
		writer.write_u32(self.nonce)
	}
}

impl Readable for BlockHeader {
	fn read<R: Reader>(reader: &mut R) -> Result<BlockHeader, Error> {
		let version = reader.read_i32()?;
		let prev_hash = Hash::read(reader)?;
		let merkle_root = Hash::read(reader)?;
		let timestamp = reader.read_u32()?;
		let bits = reader.read_u32()?;
		let nonce = reader.read_u32()?;
		Ok(BlockHeader {
			version,
			prev_hash,
			merkle_root,
			timestamp,
			bits,
			nonce,
		})
	}
}

impl Hashed for BlockHeader {}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ser::{deser_slice, ser_vec};

	#[test]
	fn header_is_80_bytes() {
		let header = BlockHeader {
			version: 2,
			prev_hash: Hash([1; 32]),
			merkle_root: Hash([2; 32]),
			timestamp: 1_400_000_000,
			bits: 0x1d00ffff,
			nonce: 42,
		};
		let data = ser_vec(&header).unwrap();
		assert_eq!(data.len(), 80);
		let back: BlockHeader = deser_slice(&data).unwrap();
		assert_eq!(back, header);
	}
}
