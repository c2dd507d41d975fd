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

//! Node configuration, deserialized from the keel.toml file.

use keel_util::LoggingConfig;

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
	/// Directory the chain database lives under
	pub db_root: String,
	/// Network to join: "mainnet", "testnet" or "regtest"
	pub network: String,
	/// Headers older than this unix timestamp are never fetched as Merkle
	/// blocks. Usually the wallet's birth date, with some margin.
	pub fast_catchup: u32,
	/// Peers to connect to, as host:port strings
	pub seed_peers: Vec<String>,
	/// Logging setup, stdout only when absent
	pub logging: Option<LoggingConfig>,
}

impl Default for ServerConfig {
	fn default() -> ServerConfig {
		ServerConfig {
			db_root: ".keel".to_owned(),
			network: "mainnet".to_owned(),
			fast_catchup: 0,
			seed_peers: vec![],
			logging: Some(LoggingConfig::default()),
		}
	}
}
