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

//! Hash Function
//!
//! Primary hash function used in the protocol: double SHA-256 over the
//! binary serialization of a type.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::ser::{self, Error, Readable, Reader, Writeable, Writer};
use keel_util as util;

/// A hash to uniquely (or close enough) identify one of the main blockchain
/// constructs. Used pervasively for blocks and transactions. Displayed in
/// the conventional reversed byte order; compared by raw byte value, which
/// the chain only relies on for tie-breaks.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for i in self.0.iter().rev() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self)
	}
}

impl Hash {
	/// Creates a new hash from a byte vector, which must hold exactly 32
	/// bytes.
	pub fn from_vec(v: &[u8]) -> Hash {
		let mut a = [0; 32];
		a.copy_from_slice(&v[0..32]);
		Hash(a)
	}

	/// Converts the hash to a byte vector
	pub fn to_vec(&self) -> Vec<u8> {
		self.0.to_vec()
	}

	/// Converts the hash to a byte slice
	pub fn to_slice(&self) -> &[u8] {
		&self.0
	}

	/// Parses a hash from its conventional (reversed) hex representation.
	pub fn from_hex(hex: &str) -> Result<Hash, Error> {
		let mut bytes =
			util::from_hex(hex.to_string()).map_err(|_| Error::CorruptedData)?;
		if bytes.len() != 32 {
			return Err(Error::CorruptedData);
		}
		bytes.reverse();
		Ok(Hash::from_vec(&bytes))
	}
}

/// The "zero" hash, all zeroes. Marks the absence of a parent (genesis) and
/// the open-ended stop hash in header requests.
pub const ZERO_HASH: Hash = Hash([0; 32]);

/// Double SHA-256 of an arbitrary byte slice.
pub fn sha256d(data: &[u8]) -> Hash {
	let first = Sha256::digest(data);
	let second = Sha256::digest(&first);
	Hash::from_vec(second.as_slice())
}

/// Serializer that outputs the streamed double SHA-256 of the written data
/// rather than the data itself.
pub struct HashWriter {
	state: Sha256,
}

impl HashWriter {
	/// Consume the `HashWriter`, outputting its current hash
	pub fn into_hash(self) -> Hash {
		let first = self.state.finalize();
		let second = Sha256::digest(&first);
		Hash::from_vec(second.as_slice())
	}
}

impl Default for HashWriter {
	fn default() -> HashWriter {
		HashWriter {
			state: Sha256::new(),
		}
	}
}

impl Writer for HashWriter {
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.state.update(bytes);
		Ok(())
	}
}

/// A trait for types that get their hash (double SHA-256) from their byte
/// serialization.
pub trait Hashed: Writeable {
	/// Obtain the hash of the serialized object
	fn hash(&self) -> Hash {
		let mut hasher = HashWriter::default();
		// writing to a hasher is infallible
		self.write(&mut hasher).unwrap();
		hasher.into_hash()
	}
}

impl Writeable for Hash {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_fixed_bytes(&self.0)
	}
}

impl Readable for Hash {
	fn read<R: Reader>(reader: &mut R) -> Result<Hash, Error> {
		let v = reader.read_fixed_bytes(32)?;
		Ok(Hash::from_vec(&v))
	}
}

impl Hashed for Hash {}

/// Serialize a hash list prefixed with its length.
pub fn write_hashes<W: Writer>(writer: &mut W, hashes: &[Hash]) -> Result<(), Error> {
	writer.write_u64(hashes.len() as u64)?;
	for h in hashes {
		h.write(writer)?;
	}
	Ok(())
}

/// Read back a length-prefixed hash list, bounded by `max`.
pub fn read_hashes<R: Reader>(reader: &mut R, max: usize) -> Result<Vec<Hash>, Error> {
	let len = reader.read_u64()? as usize;
	if len > max {
		return Err(Error::TooLargeReadErr(format!("{} hashes", len)));
	}
	let mut hashes = Vec::with_capacity(len);
	for _ in 0..len {
		hashes.push(Hash::read(reader)?);
	}
	Ok(hashes)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ser::ser_vec;

	#[test]
	fn hash_hex_roundtrip() {
		let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
		let hash = Hash::from_hex(hex).unwrap();
		assert_eq!(format!("{}", hash), hex);
		// internal order is reversed relative to display order
		assert_eq!(hash.0[28..32], [0, 0, 0, 0]);
	}

	#[test]
	fn hash_writer_matches_sha256d() {
		let data = vec![1u8, 2, 3, 4];
		let direct = sha256d(&ser_vec(&data).unwrap());
		let mut hasher = HashWriter::default();
		data.write(&mut hasher).unwrap();
		assert_eq!(hasher.into_hash(), direct);
	}
}
