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

//! Wallet-supplied bloom filters. The node never evaluates membership
//! itself, it only carries the filter to peers so they prefilter the
//! transactions they relay back.

use crate::ser::{Error, Readable, Reader, Writeable, Writer};

/// Largest filter we accept, in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;
/// Largest number of hash functions we accept.
pub const MAX_HASH_FUNCS: u32 = 50;

/// A probabilistic filter over the wallet's outpoints and script data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
	/// The filter bit field
	pub data: Vec<u8>,
	/// Number of hash functions the filter was built with
	pub hash_funcs: u32,
	/// Random tweak mixed into each hash function
	pub tweak: u32,
	/// Flags controlling how peers update the filter on matches
	pub flags: u8,
}

impl BloomFilter {
	/// A filter with no bits set matches nothing and is useless to load.
	pub fn is_empty(&self) -> bool {
		self.data.iter().all(|b| *b == 0)
	}
}

impl Writeable for BloomFilter {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_bytes(&self.data)?;
		writer.write_u32(self.hash_funcs)?;
		writer.write_u32(self.tweak)?;
		writer.write_u8(self.flags)
	}
}

impl Readable for BloomFilter {
	fn read<R: Reader>(reader: &mut R) -> Result<BloomFilter, Error> {
		let data = reader.read_bytes_len_prefix()?;
		let hash_funcs = reader.read_u32()?;
		let tweak = reader.read_u32()?;
		let flags = reader.read_u8()?;
		if data.len() > MAX_FILTER_SIZE || hash_funcs > MAX_HASH_FUNCS {
			return Err(Error::CorruptedData);
		}
		Ok(BloomFilter {
			data,
			hash_funcs,
			tweak,
			flags,
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn empty_filter() {
		let empty = BloomFilter {
			data: vec![],
			hash_funcs: 3,
			tweak: 0,
			flags: 0,
		};
		assert!(empty.is_empty());

		let zeroed = BloomFilter {
			data: vec![0, 0, 0],
			hash_funcs: 3,
			tweak: 0,
			flags: 0,
		};
		assert!(zeroed.is_empty());

		let set = BloomFilter {
			data: vec![0, 4, 0],
			hash_funcs: 3,
			tweak: 0,
			flags: 0,
		};
		assert!(!set.is_empty());
	}
}
