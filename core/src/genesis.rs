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

//! Definition of the genesis block headers. Placed here to avoid poluting
//! the various modules with the huge blobs of constants.

use crate::core::hash::{Hash, ZERO_HASH};
use crate::core::header::BlockHeader;

// Merkle root of the single coinbase transaction in the genesis block,
// shared by all three networks.
fn genesis_merkle_root() -> Hash {
	Hash::from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
		.expect("valid genesis merkle root")
}

/// Genesis block header of the main network.
pub fn genesis_main() -> BlockHeader {
	BlockHeader {
		version: 1,
		prev_hash: ZERO_HASH,
		merkle_root: genesis_merkle_root(),
		timestamp: 1231006505,
		bits: 0x1d00ffff,
		nonce: 2083236893,
	}
}

/// Genesis block header of the public test network.
pub fn genesis_test() -> BlockHeader {
	BlockHeader {
		version: 1,
		prev_hash: ZERO_HASH,
		merkle_root: genesis_merkle_root(),
		timestamp: 1296688602,
		bits: 0x1d00ffff,
		nonce: 414098458,
	}
}

/// Genesis block header of the local regression test network.
pub fn genesis_reg() -> BlockHeader {
	BlockHeader {
		version: 1,
		prev_hash: ZERO_HASH,
		merkle_root: genesis_merkle_root(),
		timestamp: 1296688602,
		bits: 0x207fffff,
		nonce: 2,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::core::hash::Hashed;

	#[test]
	fn mainnet_genesis_hash() {
		assert_eq!(
			genesis_main().hash().to_string(),
			"000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
		);
	}

	#[test]
	fn testnet_genesis_hash() {
		assert_eq!(
			genesis_test().hash().to_string(),
			"000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
		);
	}
}
