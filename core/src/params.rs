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

//! Per-network consensus parameters, carried as a plain value through the
//! chain and the coordinator. No globals.

use num_bigint::BigUint;

use crate::core::hash::Hash;
use crate::core::header::BlockHeader;
use crate::genesis;

/// Consensus parameters of one network.
#[derive(Debug, Clone)]
pub struct NetworkParams {
	/// Human readable network name
	pub name: String,
	/// The genesis block header
	pub genesis: BlockHeader,
	/// Highest (easiest) target a header may carry
	pub pow_limit: BigUint,
	/// Compact form of the proof-of-work limit, used for
	/// minimum-difficulty blocks
	pub pow_limit_bits: u32,
	/// Expected duration of a full retarget window, in seconds
	pub target_timespan: u32,
	/// Expected block spacing, in seconds
	pub target_spacing: u32,
	/// Whether blocks may fall back to the proof-of-work limit when the
	/// chain stalls (test networks)
	pub allow_min_difficulty_blocks: bool,
	/// Height at and above which version 1 blocks are rejected
	pub reject_v1_height: Option<u32>,
	/// Hard-coded (height, hash) pairs the chain must pass through
	pub checkpoints: Vec<(u32, Hash)>,
}

impl NetworkParams {
	/// Parameters of the main network.
	pub fn mainnet() -> NetworkParams {
		NetworkParams {
			name: "mainnet".to_owned(),
			genesis: genesis::genesis_main(),
			pow_limit: (BigUint::from(1u32) << 224) - BigUint::from(1u32),
			pow_limit_bits: 0x1d00ffff,
			target_timespan: 14 * 24 * 60 * 60,
			target_spacing: 10 * 60,
			allow_min_difficulty_blocks: false,
			reject_v1_height: Some(227_836),
			checkpoints: checkpoints(&[
				(
					11111,
					"0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
				),
				(
					33333,
					"000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
				),
				(
					74000,
					"0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
				),
				(
					105000,
					"00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
				),
				(
					134444,
					"00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
				),
				(
					168000,
					"000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
				),
			]),
		}
	}

	/// Parameters of the public test network.
	pub fn testnet() -> NetworkParams {
		NetworkParams {
			name: "testnet".to_owned(),
			genesis: genesis::genesis_test(),
			pow_limit: (BigUint::from(1u32) << 224) - BigUint::from(1u32),
			pow_limit_bits: 0x1d00ffff,
			target_timespan: 14 * 24 * 60 * 60,
			target_spacing: 10 * 60,
			allow_min_difficulty_blocks: true,
			reject_v1_height: Some(21_111),
			checkpoints: checkpoints(&[(
				546,
				"000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
			)]),
		}
	}

	/// Parameters of the local regression test network.
	pub fn regtest() -> NetworkParams {
		NetworkParams {
			name: "regtest".to_owned(),
			genesis: genesis::genesis_reg(),
			pow_limit: (BigUint::from(1u32) << 255) - BigUint::from(1u32),
			pow_limit_bits: 0x207fffff,
			target_timespan: 14 * 24 * 60 * 60,
			target_spacing: 10 * 60,
			allow_min_difficulty_blocks: true,
			reject_v1_height: None,
			checkpoints: vec![],
		}
	}

	/// Look a network up by name.
	pub fn from_name(name: &str) -> Option<NetworkParams> {
		match name {
			"mainnet" | "main" => Some(NetworkParams::mainnet()),
			"testnet" | "test" => Some(NetworkParams::testnet()),
			"regtest" | "reg" => Some(NetworkParams::regtest()),
			_ => None,
		}
	}

	/// Number of blocks between difficulty retargets.
	pub fn diff_interval(&self) -> u32 {
		self.target_timespan / self.target_spacing
	}

	/// The checkpoint expected at the given height, if any.
	pub fn checkpoint_at(&self, height: u32) -> Option<&Hash> {
		self.checkpoints
			.iter()
			.find(|(h, _)| *h == height)
			.map(|(_, hash)| hash)
	}

	/// Height of the highest checkpoint at or below the given height.
	pub fn last_checkpoint_before(&self, height: u32) -> u32 {
		self.checkpoints
			.iter()
			.map(|(h, _)| *h)
			.filter(|h| *h <= height)
			.max()
			.unwrap_or(0)
	}
}

fn checkpoints(list: &[(u32, &str)]) -> Vec<(u32, Hash)> {
	list.iter()
		.map(|(height, hex)| {
			(
				*height,
				Hash::from_hex(hex).expect("valid checkpoint hash"),
			)
		})
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::consensus::decode_compact;

	#[test]
	fn retarget_interval() {
		assert_eq!(NetworkParams::mainnet().diff_interval(), 2016);
	}

	#[test]
	fn genesis_meets_pow_limit() {
		for params in &[
			NetworkParams::mainnet(),
			NetworkParams::testnet(),
			NetworkParams::regtest(),
		] {
			let target = decode_compact(params.genesis.bits);
			assert!(target <= params.pow_limit, "{}", params.name);
		}
	}

	#[test]
	fn checkpoint_lookup() {
		let params = NetworkParams::mainnet();
		assert!(params.checkpoint_at(11111).is_some());
		assert!(params.checkpoint_at(11112).is_none());
		assert_eq!(params.last_checkpoint_before(100_000), 74000);
		assert_eq!(params.last_checkpoint_before(10), 0);
	}
}
