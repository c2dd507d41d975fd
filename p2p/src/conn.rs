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

//! Lower level connection plumbing: the writer thread draining a peer's
//! outbound channel into its socket.

use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::Receiver;
use std::thread;

use crate::msg::{write_message, Message};
use crate::types::PeerId;

/// Spawns the writer half of a connection: messages pushed into the
/// peer's channel are serialized to the socket in order. Ends when the
/// channel closes (all senders dropped) or the socket errors, shutting
/// the socket down so the reader unblocks too.
pub fn spawn_writer(id: PeerId, stream: TcpStream, rx: Receiver<Message>) -> thread::JoinHandle<()> {
	thread::Builder::new()
		.name(format!("peer_write_{}", id.0))
		.spawn(move || {
			let mut stream = stream;
			for msg in rx.iter() {
				if let Err(e) = write_message(&mut stream, &msg) {
					debug!("{}: write failed: {:?}", id, e);
					break;
				}
			}
			let _ = stream.shutdown(Shutdown::Both);
		})
		.expect("failed to spawn peer writer thread")
}
