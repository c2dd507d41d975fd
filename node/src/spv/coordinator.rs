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

//! The coordinator reactor. Single owner of the sync state: every peer
//! event and client request funnels through here, on one thread, so none
//! of the state needs a lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::{thread_rng, Rng};

use keel_chain::{ChainAction, HeaderChain, HeaderStore};
use keel_core::core::bloom::BloomFilter;
use keel_core::core::hash::{Hash, Hashed, ZERO_HASH};
use keel_core::core::header::BlockHeader;
use keel_core::core::merkle::DecodedMerkleBlock;
use keel_core::core::transaction::Transaction;
use keel_p2p::{
	Inventory, InvKind, Locator, Message, PeerEvent, PeerId, PeerInfo, PeerRegistry,
	PROTOCOL_VERSION,
};

use crate::spv::state::SpvState;
use crate::spv::{ClientRequest, SpvEvent, MAX_MERKLE_BATCH, STALL_TIMEOUT_SECS};
use crate::wallet::WalletSink;

/// The reactor driving the SPV machinery. Generic over the header store
/// and the wallet sink so tests can run it against in-memory fakes.
pub struct SpvCoordinator<S, W> {
	pub(crate) chain: HeaderChain<S>,
	pub(crate) registry: PeerRegistry,
	pub(crate) senders: HashMap<PeerId, SyncSender<Message>>,
	pub(crate) wallet: W,
	pub(crate) state: SpvState,
	local_height: Arc<AtomicU32>,
}

impl<S, W> SpvCoordinator<S, W>
where
	S: HeaderStore,
	W: WalletSink,
{
	/// Builds the coordinator around an initialized chain. `local_height`
	/// is mirrored from the best tip so new connections can advertise it.
	pub fn new(
		chain: HeaderChain<S>,
		wallet: W,
		fast_catchup: u32,
		local_height: Arc<AtomicU32>,
	) -> SpvCoordinator<S, W> {
		let coordinator = SpvCoordinator {
			chain,
			registry: PeerRegistry::new(),
			senders: HashMap::new(),
			wallet,
			state: SpvState::new(fast_catchup),
			local_height,
		};
		coordinator.update_local_height();
		coordinator
	}

	/// Runs the reactor until the mailbox closes or the stop flag rises.
	pub fn run(mut self, rx: Receiver<SpvEvent>, stop: Arc<AtomicBool>) {
		for event in rx.iter() {
			if stop.load(Ordering::Relaxed) {
				break;
			}
			self.handle(event);
		}
		debug!("spv: coordinator loop ended");
	}

	/// Dispatches one event.
	pub fn handle(&mut self, event: SpvEvent) {
		match event {
			SpvEvent::Peer(PeerEvent::Handshake(id, info, sender)) => {
				self.on_handshake(id, info, sender)
			}
			SpvEvent::Peer(PeerEvent::Disconnect(id)) => self.on_disconnect(id),
			SpvEvent::Peer(PeerEvent::Inbound(id, msg)) => self.on_message(id, msg),
			SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)) => self.on_merkle(id, dmb),
			SpvEvent::Client(ClientRequest::UpdateBloom(filter)) => self.on_update_bloom(filter),
			SpvEvent::Client(ClientRequest::PublishTx(tx)) => self.on_publish(tx),
			SpvEvent::Client(ClientRequest::Rescan(ts)) => self.execute_or_defer_rescan(ts),
			SpvEvent::Client(ClientRequest::Heartbeat) => self.on_heartbeat(),
		}
	}

	fn on_handshake(&mut self, id: PeerId, info: PeerInfo, sender: SyncSender<Message>) {
		let peer_height = info.start_height;
		self.registry.insert(id, info);
		self.registry.set_handshake(&id);
		self.senders.insert(id, sender);

		if let Some(filter) = self.state.bloom.clone() {
			self.send_to(id, Message::FilterLoad(filter));
		}

		// a fresh peer is a broadcast opportunity for anything parked
		let pending = std::mem::take(&mut self.state.pending_broadcast);
		for tx in pending {
			self.send_to(id, Message::Tx(tx));
		}

		// solicit headers from every new peer, whoever the current sync
		// peer is; a faster one simply takes over
		self.solicit_headers(id);
		self.download_blocks(id);

		match self.chain.best_tip() {
			Ok(tip) => info!(
				"{}: handshake done, peer at {}, our tip {} at {}",
				id, peer_height, tip.hash, tip.height
			),
			Err(e) => error!("spv: no best tip: {}", e),
		}
	}

	fn on_disconnect(&mut self, id: PeerId) {
		// requeue whatever the peer still owed us
		if let Some(entries) = self.state.inflight_merkles.remove(&id) {
			if !entries.is_empty() {
				debug!("{}: requeueing {} merkle blocks", id, entries.len());
			}
			self.state
				.requeue_blocks(entries.into_iter().map(|(block, _)| block).collect());
		}
		self.state.inflight_txs.remove(&id);
		self.state.peer_broadcast_blocks.remove(&id);
		self.senders.remove(&id);
		let known = self.registry.remove(&id).is_some();
		if known {
			info!("{}: disconnected, {} peers left", id, self.registry.len());
		}

		for peer in self.registry.keys() {
			self.download_blocks(peer);
		}

		// losing the header source means soliciting everyone again
		if self.state.sync_peer == Some(id) {
			self.state.sync_peer = None;
			for peer in self.registry.keys() {
				self.solicit_headers(peer);
			}
		}
	}

	fn on_message(&mut self, id: PeerId, msg: Message) {
		match msg {
			Message::Headers(headers) => self.on_headers(id, headers),
			Message::Inv(inv) => self.on_inv(id, inv),
			Message::Tx(tx) => self.on_tx(id, tx),
			Message::Ping(nonce) => self.send_to(id, Message::Pong(nonce)),
			Message::Pong(nonce) => trace!("{}: pong {}", id, nonce),
			Message::Reject(reject) => warn!(
				"{}: rejected our {}: {} ({:#x})",
				id, reject.message, reject.reason, reject.code
			),
			other => debug!("{}: ignoring {:?}", id, other.msg_type()),
		}
	}

	fn on_headers(&mut self, id: PeerId, headers: Vec<BlockHeader>) {
		let work_before = match self.chain.best_tip() {
			Ok(tip) => tip.chain_work,
			Err(e) => {
				error!("spv: no best tip: {}", e);
				return;
			}
		};
		let now = now_ts();

		let mut accepted = vec![];
		let mut side_action = None;
		for header in &headers {
			match self.chain.connect_header(header, now, true) {
				Ok(action) => {
					if let ChainAction::SideChain(_) = action {
						side_action = Some(action.clone());
					}
					match action.accepted_node() {
						Some(node) => accepted.push(node.clone()),
						None => trace!("{}: header {} already known", id, header.hash()),
					}
				}
				Err(e) => warn!("{}: rejected header {}: {}", id, header.hash(), e),
			}
		}
		if !headers.is_empty() {
			debug!(
				"{}: {} headers, {} newly accepted",
				id,
				headers.len(),
				accepted.len()
			);
		}

		let best_block_height = self.chain.best_block().map(|b| b.height).unwrap_or(0);
		for node in &accepted {
			if node.header.timestamp < self.state.fast_catchup {
				continue;
			}
			if self.state.is_block_queued(&node.hash) || self.state.is_merkle_inflight(&node.hash)
			{
				continue;
			}
			if node.height <= best_block_height
				&& self.chain.is_main_chain(node).unwrap_or(false)
			{
				continue;
			}
			self.state.queue_block(node.height, node.hash);
		}

		// blocks a peer announced earlier may have just become real
		// headers, which pins down that peer's height
		for node in &accepted {
			let mut resolved = vec![];
			for (peer, hashes) in self.state.peer_broadcast_blocks.iter_mut() {
				if let Some(pos) = hashes.iter().position(|h| *h == node.hash) {
					hashes.remove(pos);
					resolved.push(*peer);
				}
			}
			for peer in resolved {
				self.registry.update_height(&peer, node.height);
			}
		}
		self.state.peer_broadcast_blocks.retain(|_, v| !v.is_empty());

		match self.chain.best_tip() {
			Ok(tip) => {
				if tip.chain_work > work_before {
					self.registry.update_height(&id, tip.height);
					self.update_local_height();
					self.state.sync_peer = if self.headers_synced() {
						None
					} else {
						Some(id)
					};
					// keep pulling from the peer that just made progress,
					// with the cheap single-hash locator
					self.send_to(
						id,
						Message::GetHeaders(Locator {
							version: PROTOCOL_VERSION,
							locator: vec![tip.hash],
							stop: ZERO_HASH,
						}),
					);
				}
			}
			Err(e) => error!("spv: no best tip: {}", e),
		}

		// a branch that didn't win yet may still grow into the best
		// chain; chase it with a locator leading through its tip
		if let Some(action) = side_action {
			match self.chain.block_locator_side(&action) {
				Ok(locator) => self.send_to(
					id,
					Message::GetHeaders(Locator {
						version: PROTOCOL_VERSION,
						locator,
						stop: ZERO_HASH,
					}),
				),
				Err(e) => error!("spv: no side locator: {}", e),
			}
		}

		for peer in self.registry.keys() {
			self.download_blocks(peer);
		}
	}

	fn on_inv(&mut self, id: PeerId, inv: Vec<Inventory>) {
		let mut tx_hashes = vec![];
		let mut block_hashes = vec![];
		for item in inv {
			match item.kind {
				InvKind::Tx => tx_hashes.push(item.hash),
				InvKind::Block | InvKind::MerkleBlock => block_hashes.push(item.hash),
			}
		}
		self.download_txs(id, tx_hashes);

		if block_hashes.is_empty() {
			return;
		}
		let mut max_known = None;
		let mut unknown = vec![];
		for hash in block_hashes {
			match self.chain.get_node(&hash) {
				Ok(Some(node)) => {
					max_known = Some(max_known.unwrap_or(0).max(node.height));
				}
				Ok(None) => unknown.push(hash),
				Err(e) => error!("{}: inv lookup failed: {}", id, e),
			}
		}
		if let Some(height) = max_known {
			self.registry.update_height(&id, height);
		}

		if unknown.is_empty() {
			return;
		}
		let locator = match self.chain.block_locator() {
			Ok(locator) => locator,
			Err(e) => {
				error!("spv: no locator: {}", e);
				return;
			}
		};
		for hash in unknown {
			debug!("{}: chasing announced block {}", id, hash);
			let entry = self.state.peer_broadcast_blocks.entry(id).or_default();
			if !entry.contains(&hash) {
				entry.push(hash);
			}
			self.send_to(
				id,
				Message::GetHeaders(Locator {
					version: PROTOCOL_VERSION,
					locator: locator.clone(),
					stop: hash,
				}),
			);
		}
	}

	fn on_tx(&mut self, id: PeerId, tx: Transaction) {
		let txid = tx.txid();
		trace!("{}: tx {}", id, txid);
		for entries in self.state.inflight_txs.values_mut() {
			entries.retain(|(hash, _)| *hash != txid);
		}

		if self.merkle_synced() {
			self.wallet.import_txs(vec![tx]);
		} else {
			self.state.solo_txs.entry(txid).or_insert(tx);
		}

		// a tx landing may have been the last thing a buffered Merkle
		// block was waiting for
		self.import_received_merkles();
	}

	fn on_merkle(&mut self, id: PeerId, dmb: DecodedMerkleBlock) {
		let hash = dmb.merkle.header.hash();
		let node = match self.chain.get_node(&hash) {
			Ok(Some(node)) => node,
			Ok(None) => {
				debug!("{}: dropping unsolicited merkle block {}", id, hash);
				return;
			}
			Err(e) => {
				error!("{}: merkle lookup failed: {}", id, e);
				return;
			}
		};

		if let Some(entries) = self.state.inflight_merkles.get_mut(&id) {
			entries.retain(|((_, h), _)| *h != hash);
		}

		if dmb.root != node.header.merkle_root {
			// the peer matched transactions against a tree that isn't
			// the block's; nothing to salvage, don't refetch the lie
			warn!(
				"{}: merkle root mismatch for {} at {}",
				id, hash, node.height
			);
		} else if self.state.pending_rescan.is_none() {
			self.state
				.received_merkle
				.entry(node.height)
				.or_default()
				.push(dmb);
			self.import_received_merkles();
			self.download_blocks(id);
		}

		if let Some(ts) = self.state.pending_rescan {
			let drained = self
				.state
				.inflight_merkles
				.get(&id)
				.map(|v| v.is_empty())
				.unwrap_or(true);
			if drained {
				self.execute_or_defer_rescan(ts);
			}
		}
	}

	/// Request the next Merkle-block batch from the peer, if it is
	/// eligible to serve one.
	fn download_blocks(&mut self, id: PeerId) {
		if self.state.sync_peer == Some(id) {
			return;
		}
		if self.state.bloom.is_none() || self.state.pending_rescan.is_some() {
			return;
		}
		if !self.registry.handshake_done(&id) {
			return;
		}
		if self
			.state
			.inflight_merkles
			.get(&id)
			.map(|v| !v.is_empty())
			.unwrap_or(false)
		{
			return;
		}
		let serve_height = match self.registry.get(&id) {
			Some(peer) => peer.info.start_height,
			None => return,
		};

		let batch = self.state.take_download_batch(MAX_MERKLE_BATCH, serve_height);
		if batch.is_empty() {
			return;
		}
		debug!(
			"{}: requesting {} merkle blocks from {}",
			id,
			batch.len(),
			batch[0].0
		);

		let inv: Vec<Inventory> = batch
			.iter()
			.map(|(_, hash)| Inventory {
				kind: InvKind::MerkleBlock,
				hash: *hash,
			})
			.collect();
		let now = Utc::now();
		self.state
			.inflight_merkles
			.entry(id)
			.or_default()
			.extend(batch.into_iter().map(|block| (block, now)));

		self.send_to(id, Message::GetData(inv));
		// the pong trailing the batch tells the peer codec the last
		// merkle block has no more matching txs coming
		self.send_to(id, Message::Ping(0));
	}

	/// Request transactions from the peer, refreshing any stale requests
	/// for the same hashes.
	fn download_txs(&mut self, id: PeerId, hashes: Vec<Hash>) {
		if hashes.is_empty() {
			return;
		}
		let now = Utc::now();
		let entries = self.state.inflight_txs.entry(id).or_default();
		entries.retain(|(hash, _)| !hashes.contains(hash));
		for hash in &hashes {
			entries.push((*hash, now));
		}

		let inv: Vec<Inventory> = hashes
			.into_iter()
			.map(|hash| Inventory {
				kind: InvKind::Tx,
				hash,
			})
			.collect();
		self.send_to(id, Message::GetData(inv));
	}

	/// The in-order delivery engine: drains the received-merkle buffer in
	/// ascending height as long as blocks keep linking up.
	fn import_received_merkles(&mut self) {
		if self.state.pending_rescan.is_some() {
			return;
		}
		// a tx announced by inv may belong to a buffered block; importing
		// now would deliver the block before its transaction
		if self.state.any_txs_inflight() {
			return;
		}

		loop {
			let mut progressed = false;
			let heights: Vec<u32> = self.state.received_merkle.keys().cloned().collect();
			for height in heights {
				let candidates = match self.state.received_merkle.get(&height) {
					Some(dmbs) => dmbs.clone(),
					None => continue,
				};
				let mut imported = vec![];
				for dmb in &candidates {
					if self.import_one(dmb) {
						imported.push(dmb.merkle.header.hash());
						progressed = true;
					}
				}
				if imported.is_empty() {
					continue;
				}
				let drained = match self.state.received_merkle.get_mut(&height) {
					Some(dmbs) => {
						dmbs.retain(|d| !imported.contains(&d.merkle.header.hash()));
						dmbs.is_empty()
					}
					None => false,
				};
				if drained {
					self.state.received_merkle.remove(&height);
				}
			}
			if !progressed {
				break;
			}
		}

		if self.merkle_synced() && !self.state.solo_txs.is_empty() {
			let txs: Vec<Transaction> = self.state.solo_txs.drain().map(|(_, tx)| tx).collect();
			debug!("spv: flushing {} solo txs to wallet", txs.len());
			self.wallet.import_txs(txs);
		}
	}

	// try delivering one buffered Merkle block; false leaves it buffered
	fn import_one(&mut self, dmb: &DecodedMerkleBlock) -> bool {
		let hash = dmb.merkle.header.hash();
		let action = match self.chain.connect_block(&hash, self.state.fast_catchup) {
			Ok(Some(action)) => action,
			Ok(None) => return false,
			Err(e) => {
				error!("spv: import of {} failed: {}", hash, e);
				return false;
			}
		};

		// merge in solo txs the block proves, without duplicating what
		// the peer already delivered alongside the block
		let mut seen = HashSet::new();
		let mut batch = vec![];
		for tx in &dmb.txs {
			if seen.insert(tx.txid()) {
				batch.push(tx.clone());
			}
		}
		for txid in &dmb.expected {
			if let Some(tx) = self.state.solo_txs.remove(txid) {
				if seen.insert(*txid) {
					batch.push(tx);
				}
			}
		}

		if !batch.is_empty() {
			self.wallet.import_txs(batch);
		}
		match &action {
			ChainAction::BestChain(_) => debug!("spv: best merkle block {}", hash),
			ChainAction::ChainReorg { old, .. } => {
				info!("spv: merkle reorg at {}, {} blocks unwound", hash, old.len())
			}
			ChainAction::SideChain(_) => debug!("spv: side merkle block {}", hash),
			ChainAction::KnownChain(_) => debug!("spv: old merkle block {}", hash),
		}
		self.wallet.import_merkle(action, dmb.expected.clone());
		true
	}

	fn on_update_bloom(&mut self, filter: BloomFilter) {
		if filter.is_empty() {
			debug!("spv: ignoring empty bloom filter");
			return;
		}
		if self.state.bloom.as_ref() == Some(&filter) {
			return;
		}
		info!("spv: new bloom filter, {} bytes", filter.data.len());
		self.state.bloom = Some(filter.clone());
		for peer in self.registry.keys() {
			if self.registry.handshake_done(&peer) {
				self.send_to(peer, Message::FilterLoad(filter.clone()));
			}
		}
		for peer in self.registry.keys() {
			self.download_blocks(peer);
		}
	}

	fn on_publish(&mut self, tx: Transaction) {
		let peers: Vec<PeerId> = self
			.registry
			.keys()
			.into_iter()
			.filter(|peer| self.registry.handshake_done(peer))
			.collect();
		if peers.is_empty() {
			debug!("spv: no peers, parking tx {}", tx.txid());
			self.state.pending_broadcast.push(tx);
			return;
		}
		info!("spv: broadcasting tx {} to {} peers", tx.txid(), peers.len());
		for peer in peers {
			self.send_to(peer, Message::Tx(tx.clone()));
		}
	}

	/// A rescan only runs on quiet wires; until then it stays pending and
	/// freezes scheduling and imports.
	fn execute_or_defer_rescan(&mut self, ts: u32) {
		if self.state.any_merkles_inflight() {
			debug!("spv: rescan to {} deferred, merkle blocks inflight", ts);
			self.state.pending_rescan = Some(ts);
			return;
		}

		self.state.blocks_to_download.clear();
		self.state.received_merkle.clear();
		self.state.fast_catchup = ts;
		match self.chain.rescan(ts) {
			Ok(blocks) => {
				info!("spv: rescan from {}, {} blocks to fetch", ts, blocks.len());
				self.state.requeue_blocks(blocks);
			}
			Err(e) => error!("spv: rescan failed: {}", e),
		}
		self.state.pending_rescan = None;

		for peer in self.registry.keys() {
			self.download_blocks(peer);
		}
	}

	fn on_heartbeat(&mut self) {
		let now = Utc::now();
		let stall = Duration::seconds(STALL_TIMEOUT_SECS);

		// stalled merkle batches go back into the queue; their peers get
		// rescheduled last
		let mut stalled_peers = vec![];
		let peers_with_inflight: Vec<PeerId> =
			self.state.inflight_merkles.keys().cloned().collect();
		for peer in peers_with_inflight {
			let entries = self.state.inflight_merkles.remove(&peer).unwrap_or_default();
			let (stalled, fresh): (Vec<_>, Vec<_>) = entries
				.into_iter()
				.partition(|(_, issued)| now.signed_duration_since(*issued) > stall);
			if !stalled.is_empty() {
				warn!("{}: {} merkle blocks stalled", peer, stalled.len());
				self.state
					.requeue_blocks(stalled.into_iter().map(|(block, _)| block).collect());
				stalled_peers.push(peer);
			}
			if !fresh.is_empty() {
				self.state.inflight_merkles.insert(peer, fresh);
			}
		}
		for peer in self.registry.keys() {
			if !stalled_peers.contains(&peer) {
				self.download_blocks(peer);
			}
		}
		for peer in stalled_peers {
			self.download_blocks(peer);
		}

		// stalled txs are simply asked for again from the same peer
		for peer in self.registry.keys() {
			let stalled_txs: Vec<Hash> = self
				.state
				.inflight_txs
				.get(&peer)
				.map(|entries| {
					entries
						.iter()
						.filter(|(_, issued)| now.signed_duration_since(*issued) > stall)
						.map(|(hash, _)| *hash)
						.collect()
				})
				.unwrap_or_default();
			if !stalled_txs.is_empty() {
				debug!("{}: reissuing {} stalled txs", peer, stalled_txs.len());
				self.download_txs(peer, stalled_txs);
			}
		}

		// liveness probes keep idle connections from timing out
		let nonce: u64 = thread_rng().gen();
		for peer in self.registry.keys() {
			if self.registry.handshake_done(&peer) {
				self.send_to(peer, Message::Ping(nonce));
			}
		}
	}

	fn solicit_headers(&mut self, id: PeerId) {
		let locator = match self.chain.block_locator() {
			Ok(locator) => locator,
			Err(e) => {
				error!("spv: no locator: {}", e);
				return;
			}
		};
		self.send_to(
			id,
			Message::GetHeaders(Locator {
				version: PROTOCOL_VERSION,
				locator,
				stop: ZERO_HASH,
			}),
		);
	}

	fn headers_synced(&self) -> bool {
		match self.chain.best_tip() {
			Ok(tip) => tip.height >= self.registry.best_height(),
			Err(_) => false,
		}
	}

	// delivery sync is measured at the best-block pointer; comparing the
	// header tip would flush solo txs while their blocks are inflight
	fn merkle_synced(&self) -> bool {
		match self.chain.best_block() {
			Ok(best) => best.height >= self.registry.best_height(),
			Err(_) => false,
		}
	}

	fn send_to(&mut self, id: PeerId, msg: Message) {
		if let Some(sender) = self.senders.get(&id) {
			if sender.send(msg).is_err() {
				debug!("{}: send channel closed", id);
			}
		}
	}

	fn update_local_height(&self) {
		if let Ok(tip) = self.chain.best_tip() {
			self.local_height.store(tip.height, Ordering::Relaxed);
		}
	}
}

fn now_ts() -> u32 {
	Utc::now().timestamp() as u32
}

#[cfg(test)]
mod test {
	use super::*;
	use keel_chain::MemoryStore;
	use keel_core::consensus::{decode_compact, hash_to_num};
	use keel_core::core::merkle::MerkleBlock;
	use keel_core::core::transaction::{OutPoint, TxIn, TxOut};
	use keel_core::params::NetworkParams;
	use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
	use std::sync::Mutex;

	#[derive(Debug, PartialEq, Eq)]
	enum WalletCall {
		Txs(Vec<Hash>),
		Merkle(&'static str, u32, Vec<Hash>),
	}

	#[derive(Clone, Default)]
	struct RecordingWallet {
		calls: Arc<Mutex<Vec<WalletCall>>>,
	}

	impl WalletSink for RecordingWallet {
		fn import_txs(&mut self, txs: Vec<Transaction>) {
			let txids = txs.iter().map(|tx| tx.txid()).collect();
			self.calls.lock().unwrap().push(WalletCall::Txs(txids));
		}

		fn import_merkle(&mut self, action: ChainAction, expected: Vec<Hash>) {
			let height = match &action {
				ChainAction::BestChain(new) => new.last().map(|n| n.height),
				ChainAction::ChainReorg { new, .. } => new.last().map(|n| n.height),
				ChainAction::SideChain(nodes) => nodes.last().map(|n| n.height),
				ChainAction::KnownChain(nodes) => nodes.first().map(|n| n.height),
			}
			.unwrap_or(0);
			self.calls
				.lock()
				.unwrap()
				.push(WalletCall::Merkle(action.name(), height, expected));
		}
	}

	type TestCoordinator = SpvCoordinator<MemoryStore, RecordingWallet>;

	fn new_coordinator(fast_catchup: u32) -> (TestCoordinator, Arc<Mutex<Vec<WalletCall>>>) {
		let chain = HeaderChain::new(MemoryStore::new(), NetworkParams::regtest());
		chain.init(fast_catchup).unwrap();
		let wallet = RecordingWallet::default();
		let calls = wallet.calls.clone();
		let coordinator =
			SpvCoordinator::new(chain, wallet, fast_catchup, Arc::new(AtomicU32::new(0)));
		(coordinator, calls)
	}

	fn salted_tx(salt: u8) -> Transaction {
		Transaction {
			version: 1,
			inputs: vec![TxIn {
				prev_out: OutPoint {
					hash: Hash([salt; 32]),
					index: 0,
				},
				script_sig: vec![salt],
				sequence: 0xffffffff,
			}],
			outputs: vec![TxOut {
				value: u64::from(salt) * 1000,
				script_pubkey: vec![0x51],
			}],
			lock_time: 0,
		}
	}

	fn mine(prev: Hash, timestamp: u32, merkle_root: Hash) -> BlockHeader {
		let bits = 0x207fffff;
		let mut header = BlockHeader {
			version: 2,
			prev_hash: prev,
			merkle_root,
			timestamp,
			bits,
			nonce: 0,
		};
		let target = decode_compact(bits);
		while hash_to_num(&header.hash()) >= target {
			header.nonce += 1;
		}
		header
	}

	// one transaction per block, so the merkle root is its txid
	fn mine_chain(genesis: &BlockHeader, n: u32) -> (Vec<BlockHeader>, Vec<Transaction>) {
		let mut headers = vec![];
		let mut txs = vec![];
		let mut prev = genesis.hash();
		for i in 0..n {
			let tx = salted_tx(100 + i as u8);
			let header = mine(
				prev,
				genesis.timestamp + 600 * (i + 1),
				tx.txid(),
			);
			prev = header.hash();
			headers.push(header);
			txs.push(tx);
		}
		(headers, txs)
	}

	fn dmb_for(header: &BlockHeader, tx: &Transaction, with_tx: bool) -> DecodedMerkleBlock {
		DecodedMerkleBlock {
			merkle: MerkleBlock {
				header: *header,
				total_tx: 1,
				hashes: vec![tx.txid()],
				flags: vec![0x01],
			},
			root: tx.txid(),
			expected: vec![tx.txid()],
			txs: if with_tx { vec![tx.clone()] } else { vec![] },
		}
	}

	fn filter() -> BloomFilter {
		BloomFilter {
			data: vec![0xff; 8],
			hash_funcs: 5,
			tweak: 0,
			flags: 1,
		}
	}

	fn add_peer(
		coordinator: &mut TestCoordinator,
		id: PeerId,
		height: u32,
	) -> Receiver<Message> {
		let (tx, rx) = sync_channel(2048);
		let info = PeerInfo {
			addr: "127.0.0.1:8333".parse().unwrap(),
			version: PROTOCOL_VERSION,
			start_height: height,
			user_agent: "/test/".to_owned(),
		};
		coordinator.handle(SpvEvent::Peer(PeerEvent::Handshake(id, info, tx)));
		rx
	}

	fn drain(rx: &Receiver<Message>) -> Vec<Message> {
		let mut messages = vec![];
		loop {
			match rx.try_recv() {
				Ok(msg) => messages.push(msg),
				Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
			}
		}
		messages
	}

	fn getdata_hashes(messages: &[Message]) -> Vec<Hash> {
		messages
			.iter()
			.filter_map(|msg| match msg {
				Message::GetData(inv) => Some(inv.iter().map(|i| i.hash).collect::<Vec<_>>()),
				_ => None,
			})
			.flatten()
			.collect()
	}

	fn peer_event(id: PeerId, msg: Message) -> SpvEvent {
		SpvEvent::Peer(PeerEvent::Inbound(id, msg))
	}

	fn genesis() -> BlockHeader {
		NetworkParams::regtest().genesis
	}

	#[test]
	fn handshake_solicits_headers() {
		let (mut coordinator, _) = new_coordinator(0);
		let rx = add_peer(&mut coordinator, PeerId(1), 10);
		let messages = drain(&rx);
		match &messages[0] {
			Message::GetHeaders(locator) => {
				assert_eq!(locator.locator.len(), 1);
				assert_eq!(locator.stop, ZERO_HASH);
			}
			other => panic!("expected GetHeaders, got {:?}", other),
		}
	}

	#[test]
	fn headers_drive_downloads_and_sync_peer() {
		let (mut coordinator, _) = new_coordinator(0);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 15);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));
		drain(&rx);

		let (headers, _) = mine_chain(&genesis(), 10);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));

		// our ten blocks leave the peer's claimed 15 unreached, so it
		// stays the sync peer and gets a compact follow-up locator
		assert_eq!(coordinator.state.sync_peer, Some(id));
		let messages = drain(&rx);
		let compact = messages.iter().any(|msg| match msg {
			Message::GetHeaders(locator) => {
				locator.locator.len() == 1 && locator.locator[0] == headers[9].hash()
			}
			_ => false,
		});
		assert!(compact, "no compact getheaders seen");

		// all ten blocks are queued but none requested from the sync peer
		assert_eq!(
			coordinator
				.state
				.blocks_to_download
				.values()
				.map(|v| v.len())
				.sum::<usize>(),
			10
		);
		assert!(getdata_hashes(&messages).is_empty());

		// once a second peer connects, downloads flow through it
		let id2 = PeerId(2);
		let rx2 = add_peer(&mut coordinator, id2, 10);
		let messages2 = drain(&rx2);
		assert_eq!(getdata_hashes(&messages2).len(), 10);
		assert!(coordinator.state.blocks_to_download.is_empty());
		// the batch is closed off with the tail ping
		assert!(messages2
			.iter()
			.any(|msg| matches!(msg, Message::Ping(0))));
	}

	#[test]
	fn out_of_order_merkle_delivery() {
		// catchup floor at block 8, so only 8..10 are fetched
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 8;
		let (mut coordinator, calls) = new_coordinator(fc);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 10);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, txs) = mine_chain(&genesis, 10);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));
		let requested = getdata_hashes(&drain(&rx));
		assert_eq!(requested.len(), 3);

		// blocks arrive 10, 8, 9
		for i in &[9usize, 7, 8] {
			let dmb = dmb_for(&headers[*i], &txs[*i], true);
			coordinator.handle(SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)));
		}

		let calls = calls.lock().unwrap();
		let merkle_heights: Vec<u32> = calls
			.iter()
			.filter_map(|call| match call {
				WalletCall::Merkle(_, height, _) => Some(*height),
				_ => None,
			})
			.collect();
		assert_eq!(merkle_heights, vec![8, 9, 10]);
		// per block, the txs precede the merkle action
		assert_eq!(
			calls[0],
			WalletCall::Txs(vec![txs[7].txid()])
		);
		assert_eq!(
			calls[1],
			WalletCall::Merkle("best", 8, vec![txs[7].txid()])
		);
		assert!(coordinator.state.received_merkle.is_empty());
	}

	#[test]
	fn solo_tx_race() {
		// only block 9 is below the wire
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 9;
		let (mut coordinator, calls) = new_coordinator(fc);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 9);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, txs) = mine_chain(&genesis, 9);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));
		drain(&rx);

		// the peer announces the tx; we ask for it
		let tx1 = &txs[8];
		coordinator.handle(peer_event(
			id,
			Message::Inv(vec![Inventory {
				kind: InvKind::Tx,
				hash: tx1.txid(),
			}]),
		));
		assert!(coordinator.state.any_txs_inflight());

		// the merkle block proving it arrives before the tx itself
		let dmb = dmb_for(&headers[8], tx1, false);
		coordinator.handle(SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)));
		assert!(calls.lock().unwrap().is_empty());
		assert_eq!(coordinator.state.received_merkle.len(), 1);

		// now the tx lands and unblocks the import
		coordinator.handle(peer_event(id, Message::Tx(tx1.clone())));
		{
			let calls = calls.lock().unwrap();
			assert_eq!(
				*calls,
				vec![
					WalletCall::Txs(vec![tx1.txid()]),
					WalletCall::Merkle("best", 9, vec![tx1.txid()]),
				]
			);
		}
		assert!(!coordinator.state.any_txs_inflight());
		assert!(coordinator.state.solo_txs.is_empty());
	}

	#[test]
	fn stall_recovery_moves_work() {
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 6;
		let (mut coordinator, _) = new_coordinator(fc);
		let a = PeerId(1);
		let b = PeerId(2);
		let rx_a = add_peer(&mut coordinator, a, 10);
		let rx_b = add_peer(&mut coordinator, b, 10);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, _) = mine_chain(&genesis, 10);
		coordinator.handle(peer_event(a, Message::Headers(headers.clone())));

		// one of the two got the batch; normalize so it's A
		let taken_a = getdata_hashes(&drain(&rx_a));
		let taken_b = getdata_hashes(&drain(&rx_b));
		let (stalling, fresh, rx_fresh) = if taken_a.len() == 5 {
			(a, b, &rx_b)
		} else {
			assert_eq!(taken_b.len(), 5);
			(b, a, &rx_a)
		};

		// age the batch past the stall timeout and tick
		let backdated = Utc::now() - Duration::seconds(STALL_TIMEOUT_SECS + 10);
		for entries in coordinator.state.inflight_merkles.values_mut() {
			for entry in entries.iter_mut() {
				entry.1 = backdated;
			}
		}
		coordinator.handle(SpvEvent::Client(ClientRequest::Heartbeat));

		// the other peer now owns the request
		let reissued = getdata_hashes(&drain(rx_fresh));
		assert_eq!(reissued.len(), 5);
		assert!(coordinator
			.state
			.inflight_merkles
			.get(&stalling)
			.map(|v| v.is_empty())
			.unwrap_or(true));
		assert_eq!(
			coordinator
				.state
				.inflight_merkles
				.get(&fresh)
				.map(|v| v.len())
				.unwrap_or(0),
			5
		);
		assert!(coordinator.state.blocks_to_download.is_empty());
	}

	#[test]
	fn rescan_defers_until_wire_quiet() {
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 10;
		let (mut coordinator, calls) = new_coordinator(fc);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 10);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, txs) = mine_chain(&genesis, 10);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));
		// exactly block 10 is inflight now
		assert_eq!(getdata_hashes(&drain(&rx)).len(), 1);

		let rescan_ts = genesis.timestamp + 600 * 5;
		coordinator.handle(SpvEvent::Client(ClientRequest::Rescan(rescan_ts)));
		assert_eq!(coordinator.state.pending_rescan, Some(rescan_ts));
		assert!(calls.lock().unwrap().is_empty());

		// the inflight block arriving both drains the wire and is
		// discarded, then the rescan executes
		let dmb = dmb_for(&headers[9], &txs[9], true);
		coordinator.handle(SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)));

		assert_eq!(coordinator.state.pending_rescan, None);
		assert!(coordinator.state.received_merkle.is_empty());
		assert_eq!(coordinator.state.fast_catchup, rescan_ts);
		assert!(calls.lock().unwrap().is_empty());
		// blocks 5..10 are back on the wire
		let requested = getdata_hashes(&drain(&rx));
		assert_eq!(requested.len(), 6);
		assert_eq!(requested[0], headers[4].hash());
	}

	#[test]
	fn disconnect_requeues_and_resolicits() {
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 6;
		let (mut coordinator, _) = new_coordinator(fc);
		let a = PeerId(1);
		let b = PeerId(2);
		let rx_a = add_peer(&mut coordinator, a, 10);
		// b lags behind and can't serve anything yet
		let rx_b = add_peer(&mut coordinator, b, 0);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, _) = mine_chain(&genesis, 10);
		coordinator.handle(peer_event(a, Message::Headers(headers.clone())));
		assert_eq!(getdata_hashes(&drain(&rx_a)).len(), 5);
		drain(&rx_b);

		// make A the header source, then lose it
		coordinator.state.sync_peer = Some(a);
		coordinator.handle(SpvEvent::Peer(PeerEvent::Disconnect(a)));

		// inflight work went back into the queue, nothing is orphaned
		assert!(coordinator.state.inflight_merkles.is_empty());
		assert_eq!(
			coordinator
				.state
				.blocks_to_download
				.values()
				.map(|v| v.len())
				.sum::<usize>(),
			5
		);
		assert!(coordinator.state.sync_peer.is_none());
		assert!(!coordinator.registry.contains(&a));

		// the remaining peer is re-solicited for headers
		let messages = drain(&rx_b);
		assert!(messages
			.iter()
			.any(|msg| matches!(msg, Message::GetHeaders(_))));
		// channel of the gone peer saw nothing new
		assert!(drain(&rx_a).is_empty());
	}

	#[test]
	fn publish_parks_without_peers() {
		let (mut coordinator, _) = new_coordinator(0);
		let tx = salted_tx(1);
		coordinator.handle(SpvEvent::Client(ClientRequest::PublishTx(tx.clone())));
		assert_eq!(coordinator.state.pending_broadcast.len(), 1);

		// the next handshake flushes the parked tx
		let rx = add_peer(&mut coordinator, PeerId(1), 0);
		assert!(coordinator.state.pending_broadcast.is_empty());
		let messages = drain(&rx);
		assert!(messages.iter().any(|msg| match msg {
			Message::Tx(sent) => sent.txid() == tx.txid(),
			_ => false,
		}));

		// with a live peer, publishing sends immediately
		let tx2 = salted_tx(2);
		coordinator.handle(SpvEvent::Client(ClientRequest::PublishTx(tx2.clone())));
		assert!(coordinator.state.pending_broadcast.is_empty());
		assert!(drain(&rx).iter().any(|msg| matches!(msg, Message::Tx(_))));
	}

	#[test]
	fn bloom_updates_fan_out() {
		let (mut coordinator, _) = new_coordinator(0);
		let rx = add_peer(&mut coordinator, PeerId(1), 0);
		drain(&rx);

		// empty filters match nothing and are ignored
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(BloomFilter {
			data: vec![0, 0],
			hash_funcs: 3,
			tweak: 0,
			flags: 0,
		})));
		assert!(coordinator.state.bloom.is_none());
		assert!(drain(&rx).is_empty());

		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));
		assert!(coordinator.state.bloom.is_some());
		assert!(drain(&rx)
			.iter()
			.any(|msg| matches!(msg, Message::FilterLoad(_))));

		// resending the same filter is a no-op
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));
		assert!(drain(&rx).is_empty());

		// a new peer gets the filter on handshake
		let rx2 = add_peer(&mut coordinator, PeerId(2), 0);
		assert!(drain(&rx2)
			.iter()
			.any(|msg| matches!(msg, Message::FilterLoad(_))));
	}

	#[test]
	fn inv_chases_unknown_blocks() {
		let (mut coordinator, _) = new_coordinator(0);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 0);
		drain(&rx);

		let (headers, _) = mine_chain(&genesis(), 1);
		let announced = headers[0].hash();
		coordinator.handle(peer_event(
			id,
			Message::Inv(vec![Inventory {
				kind: InvKind::Block,
				hash: announced,
			}]),
		));

		// the unknown block is remembered and chased with a full locator
		assert_eq!(
			coordinator.state.peer_broadcast_blocks.get(&id).unwrap(),
			&vec![announced]
		);
		let messages = drain(&rx);
		let chased = messages.iter().any(|msg| match msg {
			Message::GetHeaders(locator) => locator.stop == announced,
			_ => false,
		});
		assert!(chased);

		// once the header connects, the entry resolves into a height
		coordinator.handle(peer_event(id, Message::Headers(headers)));
		assert!(coordinator.state.peer_broadcast_blocks.is_empty());
		assert_eq!(coordinator.registry.get(&id).unwrap().info.start_height, 1);
	}

	#[test]
	fn side_branch_is_chased() {
		let (mut coordinator, _) = new_coordinator(0);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 10);
		let (headers, _) = mine_chain(&genesis(), 10);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));
		drain(&rx);

		// a lone header forking off at height 5 doesn't win, but we ask
		// the peer for whatever follows it
		let side_tx = salted_tx(200);
		let side = mine(
			headers[4].hash(),
			headers[4].timestamp + 300,
			side_tx.txid(),
		);
		coordinator.handle(peer_event(id, Message::Headers(vec![side])));
		let messages = drain(&rx);
		let chased = messages.iter().any(|msg| match msg {
			Message::GetHeaders(locator) => locator.locator[0] == side.hash(),
			_ => false,
		});
		assert!(chased);
		// the height index still belongs to the main chain
		assert_eq!(
			coordinator.chain.best_tip().unwrap().height,
			10
		);
	}

	#[test]
	fn unsolicited_merkle_dropped() {
		let (mut coordinator, calls) = new_coordinator(0);
		let id = PeerId(1);
		add_peer(&mut coordinator, id, 0);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let tx = salted_tx(1);
		let header = mine(Hash([1; 32]), 1_300_000_000, tx.txid());
		let dmb = dmb_for(&header, &tx, true);
		coordinator.handle(SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)));
		assert!(calls.lock().unwrap().is_empty());
		assert!(coordinator.state.received_merkle.is_empty());
	}

	#[test]
	fn bad_merkle_root_skipped() {
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 1;
		let (mut coordinator, calls) = new_coordinator(fc);
		let id = PeerId(1);
		let rx = add_peer(&mut coordinator, id, 1);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, _) = mine_chain(&genesis, 1);
		coordinator.handle(peer_event(id, Message::Headers(headers.clone())));
		drain(&rx);

		// a tree that extracts to a different root than the header's
		let lie = salted_tx(9);
		let mut dmb = dmb_for(&headers[0], &lie, true);
		dmb.root = lie.txid();
		coordinator.handle(SpvEvent::Peer(PeerEvent::MerkleAssembled(id, dmb)));

		// skipped, not buffered, not re-queued
		assert!(calls.lock().unwrap().is_empty());
		assert!(coordinator.state.received_merkle.is_empty());
		assert!(!coordinator.state.any_merkles_inflight());
		assert!(coordinator.state.blocks_to_download.is_empty());
	}

	#[test]
	fn inflight_sets_stay_disjoint() {
		let genesis = genesis();
		let fc = genesis.timestamp + 600 * 6;
		let (mut coordinator, _) = new_coordinator(fc);
		let a = PeerId(1);
		let b = PeerId(2);
		add_peer(&mut coordinator, a, 10);
		add_peer(&mut coordinator, b, 10);
		coordinator.handle(SpvEvent::Client(ClientRequest::UpdateBloom(filter())));

		let (headers, _) = mine_chain(&genesis, 10);
		coordinator.handle(peer_event(a, Message::Headers(headers)));

		// every inflight hash is owned by exactly one peer and is not
		// simultaneously queued
		let mut seen = HashSet::new();
		for entries in coordinator.state.inflight_merkles.values() {
			for ((_, hash), _) in entries {
				assert!(seen.insert(*hash), "hash inflight twice");
				assert!(!coordinator.state.is_block_queued(hash));
			}
		}
		assert_eq!(seen.len(), 5);
	}
}
