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

//! The client's way into the running node: a bounded request channel.
//! There is no reply path; results reach the wallet through its sink.

use std::sync::mpsc::SyncSender;

use keel_core::core::bloom::BloomFilter;
use keel_core::core::transaction::Transaction;

use crate::error::Error;
use crate::spv::{ClientRequest, SpvEvent};

/// Handle for submitting client requests to the coordinator.
#[derive(Clone)]
pub struct SpvHandle {
	sender: SyncSender<SpvEvent>,
}

impl SpvHandle {
	pub(crate) fn new(sender: SyncSender<SpvEvent>) -> SpvHandle {
		SpvHandle { sender }
	}

	/// Replace the bloom filter peers screen transactions with. Empty
	/// filters are ignored by the node.
	pub fn update_bloom(&self, filter: BloomFilter) -> Result<(), Error> {
		self.request(ClientRequest::UpdateBloom(filter))
	}

	/// Broadcast a transaction to the network, immediately or as soon as
	/// a peer connects.
	pub fn publish_tx(&self, tx: Transaction) -> Result<(), Error> {
		self.request(ClientRequest::PublishTx(tx))
	}

	/// Redownload Merkle blocks from the given timestamp on. Deferred,
	/// never refused, while downloads are inflight.
	pub fn rescan(&self, from_timestamp: u32) -> Result<(), Error> {
		self.request(ClientRequest::Rescan(from_timestamp))
	}

	fn request(&self, request: ClientRequest) -> Result<(), Error> {
		self.sender
			.send(SpvEvent::Client(request))
			.map_err(|_| Error::Stopped)
	}
}
