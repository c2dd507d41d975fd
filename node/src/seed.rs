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

//! Keeps the node connected to its seed peers. No address gossip, no
//! discovery; the configured list is all we ever dial.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use keel_p2p::peer;
use keel_p2p::types::{EventSink, PeerId};

// how often we look for dropped seed connections
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the connector thread: dials every seed not currently connected,
/// rechecking on a fixed cadence until the stop flag rises. Each live
/// connection runs on its own thread and reports through the sink.
pub fn connect_and_monitor<E: EventSink>(
	seeds: Vec<SocketAddr>,
	local_height: Arc<AtomicU32>,
	sink: E,
	stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
	thread::Builder::new()
		.name("seed_connect".to_string())
		.spawn(move || {
			let connected: Arc<Mutex<HashSet<SocketAddr>>> =
				Arc::new(Mutex::new(HashSet::new()));
			let next_id = Arc::new(AtomicU64::new(1));

			while !stop.load(Ordering::Relaxed) {
				for addr in &seeds {
					let dial = {
						let mut connected = connected.lock().unwrap();
						connected.insert(*addr)
					};
					if !dial {
						continue;
					}

					let id = PeerId(next_id.fetch_add(1, Ordering::Relaxed));
					debug!("{}: dialing seed {}", id, addr);
					let addr = *addr;
					let connected = connected.clone();
					let local_height = local_height.clone();
					let sink = sink.clone();
					let stop = stop.clone();
					let _ = thread::Builder::new()
						.name(format!("peer_{}", id.0))
						.spawn(move || {
							if let Err(e) = peer::run(id, addr, local_height, sink, stop) {
								debug!("{} ({}): gone: {:?}", id, addr, e);
							}
							connected.lock().unwrap().remove(&addr);
						});
				}

				// sleep in small steps so shutdown stays prompt
				for _ in 0..RECONNECT_INTERVAL.as_secs() {
					if stop.load(Ordering::Relaxed) {
						break;
					}
					thread::sleep(Duration::from_secs(1));
				}
			}
		})
		.expect("failed to spawn seed connector thread")
}
