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

//! Assembles a running node: storage, chain, coordinator, heartbeat and
//! seed connections, glued together with bounded channels.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_chain::{ChainKVStore, HeaderChain};
use keel_core::params::NetworkParams;
use keel_p2p::types::{EventSink, PeerEvent, EVENT_CHANNEL_CAP};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::handle::SpvHandle;
use crate::seed;
use crate::spv::{ClientRequest, SpvCoordinator, SpvEvent, STALL_TIMEOUT_SECS};
use crate::wallet::WalletSink;

/// Bridges peer connections into the coordinator mailbox.
#[derive(Clone)]
struct Mailbox(SyncSender<SpvEvent>);

impl EventSink for Mailbox {
	fn send(&self, event: PeerEvent) -> bool {
		self.0.send(SpvEvent::Peer(event)).is_ok()
	}
}

/// A running SPV node and the means to talk to and stop it.
pub struct Server {
	handle: SpvHandle,
	event_tx: SyncSender<SpvEvent>,
	stop: Arc<AtomicBool>,
	threads: Vec<thread::JoinHandle<()>>,
}

impl Server {
	/// Starts the node described by the config, delivering into the given
	/// wallet sink. Returns once all threads are up.
	pub fn start<W>(config: ServerConfig, wallet: W) -> Result<Server, Error>
	where
		W: WalletSink + Send + 'static,
	{
		let params = NetworkParams::from_name(&config.network)
			.ok_or_else(|| Error::Config(format!("unknown network {:?}", config.network)))?;
		info!(
			"starting keel on {} with {} seed peers",
			params.name,
			config.seed_peers.len()
		);

		let env = Arc::new(keel_store::new_env(config.db_root.clone())?);
		let store = ChainKVStore::new(env)?;
		let chain = HeaderChain::new(store, params);
		chain.init(config.fast_catchup)?;
		let tip = chain.best_tip()?;
		info!("chain at {} ({})", tip.height, tip.hash);

		let seeds = resolve_seeds(&config.seed_peers)?;
		let stop = Arc::new(AtomicBool::new(false));
		let local_height = Arc::new(AtomicU32::new(tip.height));
		let (event_tx, event_rx) = sync_channel(EVENT_CHANNEL_CAP);

		let mut threads = vec![];

		let coordinator =
			SpvCoordinator::new(chain, wallet, config.fast_catchup, local_height.clone());
		{
			let stop = stop.clone();
			threads.push(
				thread::Builder::new()
					.name("spv".to_string())
					.spawn(move || coordinator.run(event_rx, stop))?,
			);
		}

		threads.push(spawn_heartbeat(event_tx.clone(), stop.clone()));
		threads.push(seed::connect_and_monitor(
			seeds,
			local_height,
			Mailbox(event_tx.clone()),
			stop.clone(),
		));

		Ok(Server {
			handle: SpvHandle::new(event_tx.clone()),
			event_tx,
			stop,
			threads,
		})
	}

	/// The client handle into the running node.
	pub fn handle(&self) -> SpvHandle {
		self.handle.clone()
	}

	/// Asks every thread to wind down and waits for the ones that can be
	/// joined promptly. Peer reader threads parked in a blocking read are
	/// left to time out on their own.
	pub fn stop(self) {
		info!("stopping keel");
		self.stop.store(true, Ordering::Relaxed);
		// nudge the coordinator out of its blocking mailbox read
		let _ = self.event_tx.send(SpvEvent::Client(ClientRequest::Heartbeat));
		drop(self.event_tx);
		drop(self.handle);
		for thread in self.threads {
			let _ = thread.join();
		}
	}
}

fn spawn_heartbeat(
	event_tx: SyncSender<SpvEvent>,
	stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
	thread::Builder::new()
		.name("heartbeat".to_string())
		.spawn(move || {
			while !stop.load(Ordering::Relaxed) {
				for _ in 0..STALL_TIMEOUT_SECS {
					if stop.load(Ordering::Relaxed) {
						return;
					}
					thread::sleep(Duration::from_secs(1));
				}
				if event_tx.send(SpvEvent::Client(ClientRequest::Heartbeat)).is_err() {
					return;
				}
			}
		})
		.expect("failed to spawn heartbeat thread")
}

fn resolve_seeds(seed_peers: &[String]) -> Result<Vec<SocketAddr>, Error> {
	let mut seeds = vec![];
	for seed in seed_peers {
		let mut addrs = seed
			.to_socket_addrs()
			.map_err(|e| Error::Config(format!("cannot resolve seed {:?}: {}", seed, e)))?;
		match addrs.next() {
			Some(addr) => seeds.push(addr),
			None => return Err(Error::Config(format!("seed {:?} has no address", seed))),
		}
	}
	Ok(seeds)
}
