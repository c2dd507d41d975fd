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

//! Main entry point for the keel SPV node. Loads the configuration,
//! starts the node against a log-only wallet sink and runs until
//! interrupted. Real wallets embed `keel_node` as a library instead.

#[macro_use]
extern crate log;

use std::fs;
use std::process::exit;
use std::sync::mpsc::channel;

use clap::{App, Arg};

use keel_node::wallet::NullWallet;
use keel_node::{Server, ServerConfig};
use keel_util::init_logger;

fn main() {
	let args = App::new("keel")
		.version("0.3.0")
		.about("Simplified Payment Verification node")
		.arg(
			Arg::with_name("config")
				.short("c")
				.long("config")
				.help("Path to keel.toml, defaults are used when absent")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("network")
				.short("n")
				.long("network")
				.help("Overrides the configured network (mainnet, testnet, regtest)")
				.takes_value(true),
		)
		.get_matches();

	let mut config = match args.value_of("config") {
		Some(path) => match load_config(path) {
			Ok(config) => config,
			Err(e) => {
				eprintln!("failed to read config {}: {}", path, e);
				exit(1);
			}
		},
		None => ServerConfig::default(),
	};
	if let Some(network) = args.value_of("network") {
		config.network = network.to_owned();
	}

	init_logger(config.logging.clone());
	info!("keel {} starting", env!("CARGO_PKG_VERSION"));

	let server = match Server::start(config, NullWallet::default()) {
		Ok(server) => server,
		Err(e) => {
			error!("failed to start: {}", e);
			eprintln!("failed to start: {}", e);
			exit(1);
		}
	};

	// park until ctrl-c
	let (interrupt_tx, interrupt_rx) = channel();
	ctrlc::set_handler(move || {
		let _ = interrupt_tx.send(());
	})
	.expect("failed to register interrupt handler");
	let _ = interrupt_rx.recv();

	warn!("interrupted, shutting down");
	server.stop();
}

fn load_config(path: &str) -> Result<ServerConfig, String> {
	let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
	toml::from_str(&raw).map_err(|e| e.to_string())
}
