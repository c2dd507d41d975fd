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

//! The registry of connected peers. Pure data owned by the coordinator;
//! connection I/O lives with the per-peer threads.

use std::collections::HashMap;

use crate::types::{PeerId, PeerInfo};

/// A peer as the registry tracks it.
#[derive(Debug, Clone)]
pub struct RegisteredPeer {
	/// Handshake data, with `start_height` kept current afterwards
	pub info: PeerInfo,
	/// Whether the version exchange completed
	pub handshake: bool,
}

/// Tracks every connected peer's handshake state, advertised height and
/// protocol version.
#[derive(Default)]
pub struct PeerRegistry {
	peers: HashMap<PeerId, RegisteredPeer>,
}

impl PeerRegistry {
	/// An empty registry.
	pub fn new() -> PeerRegistry {
		PeerRegistry::default()
	}

	/// Adds a peer, handshake still pending.
	pub fn insert(&mut self, id: PeerId, info: PeerInfo) {
		self.peers.insert(
			id,
			RegisteredPeer {
				info,
				handshake: false,
			},
		);
	}

	/// Removes a peer, returning what we knew about it.
	pub fn remove(&mut self, id: &PeerId) -> Option<RegisteredPeer> {
		self.peers.remove(id)
	}

	/// Look a peer up.
	pub fn get(&self, id: &PeerId) -> Option<&RegisteredPeer> {
		self.peers.get(id)
	}

	/// Whether the peer is known at all.
	pub fn contains(&self, id: &PeerId) -> bool {
		self.peers.contains_key(id)
	}

	/// Marks the peer's handshake as completed.
	pub fn set_handshake(&mut self, id: &PeerId) {
		if let Some(peer) = self.peers.get_mut(id) {
			peer.handshake = true;
		}
	}

	/// Whether the peer finished its handshake.
	pub fn handshake_done(&self, id: &PeerId) -> bool {
		self.peers.get(id).map(|p| p.handshake).unwrap_or(false)
	}

	/// Raises the peer's advertised height. Heights only ever go up, a
	/// lower value is ignored.
	pub fn update_height(&mut self, id: &PeerId, height: u32) {
		if let Some(peer) = self.peers.get_mut(id) {
			if height > peer.info.start_height {
				peer.info.start_height = height;
			}
		}
	}

	/// Ids of all known peers, in stable order.
	pub fn keys(&self) -> Vec<PeerId> {
		let mut keys: Vec<PeerId> = self.peers.keys().cloned().collect();
		keys.sort();
		keys
	}

	/// The best height any peer has advertised. Zero without peers.
	pub fn best_height(&self) -> u32 {
		self.peers
			.values()
			.map(|p| p.info.start_height)
			.max()
			.unwrap_or(0)
	}

	/// Number of known peers.
	pub fn len(&self) -> usize {
		self.peers.len()
	}

	/// Whether no peer is connected.
	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn info(height: u32) -> PeerInfo {
		PeerInfo {
			addr: "127.0.0.1:8333".parse().unwrap(),
			version: crate::types::PROTOCOL_VERSION,
			start_height: height,
			user_agent: "/test/".to_owned(),
		}
	}

	#[test]
	fn heights_are_monotone() {
		let mut registry = PeerRegistry::new();
		let id = PeerId(1);
		registry.insert(id, info(100));
		registry.update_height(&id, 90);
		assert_eq!(registry.get(&id).unwrap().info.start_height, 100);
		registry.update_height(&id, 120);
		assert_eq!(registry.get(&id).unwrap().info.start_height, 120);
	}

	#[test]
	fn best_height_across_peers() {
		let mut registry = PeerRegistry::new();
		assert_eq!(registry.best_height(), 0);
		registry.insert(PeerId(1), info(100));
		registry.insert(PeerId(2), info(250));
		registry.insert(PeerId(3), info(50));
		assert_eq!(registry.best_height(), 250);
		registry.remove(&PeerId(2));
		assert_eq!(registry.best_height(), 100);
	}

	#[test]
	fn handshake_tracking() {
		let mut registry = PeerRegistry::new();
		let id = PeerId(7);
		registry.insert(id, info(0));
		assert!(!registry.handshake_done(&id));
		registry.set_handshake(&id);
		assert!(registry.handshake_done(&id));
		let old = registry.remove(&id).unwrap();
		assert!(old.handshake);
		assert!(registry.is_empty());
	}

	#[test]
	fn keys_are_sorted() {
		let mut registry = PeerRegistry::new();
		registry.insert(PeerId(3), info(0));
		registry.insert(PeerId(1), info(0));
		registry.insert(PeerId(2), info(0));
		assert_eq!(registry.keys(), vec![PeerId(1), PeerId(2), PeerId(3)]);
	}
}
