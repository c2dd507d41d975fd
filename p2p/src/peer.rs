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

//! One peer session: dial, handshake, then decode frames into events for
//! the coordinator. A `merkleblock` soaks up the matching transactions the
//! peer trails it with before being emitted as one assembled event.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};

use keel_core::core::merkle::DecodedMerkleBlock;

use crate::conn;
use crate::msg::{read_message, Message, Reject, REJECT_DUPLICATE};
use crate::types::{
	Error, EventSink, PeerEvent, PeerId, PeerInfo, CONNECT_TIMEOUT, MIN_PROTOCOL_VERSION,
	PROTOCOL_VERSION, READ_TIMEOUT, SEND_CHANNEL_CAP, USER_AGENT,
};

/// Dials the peer and runs its session until the connection ends. Emits
/// `Handshake` once the version exchange completes, a stream of decoded
/// events afterwards, and exactly one `Disconnect` on the way out.
/// Blocks; the caller gives each session its own thread.
pub fn run<E: EventSink>(
	id: PeerId,
	addr: SocketAddr,
	local_height: Arc<AtomicU32>,
	sink: E,
	stop: Arc<AtomicBool>,
) -> Result<(), Error> {
	let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
	stream.set_read_timeout(Some(READ_TIMEOUT))?;
	stream.set_nodelay(true)?;

	let (send_tx, send_rx) = sync_channel(SEND_CHANNEL_CAP);
	let writer = conn::spawn_writer(id, stream.try_clone()?, send_rx);

	let result = session(id, addr, &mut stream, &send_tx, local_height, &sink, &stop);
	if let Err(ref e) = result {
		debug!("{} ({}): session ended: {:?}", id, addr, e);
	}

	// the writer winds down on its own once the remaining senders drop;
	// joining it here would wait on whoever still holds one
	let _ = stream.shutdown(Shutdown::Both);
	drop(send_tx);
	drop(writer);
	sink.send(PeerEvent::Disconnect(id));
	result
}

fn session<E: EventSink>(
	id: PeerId,
	addr: SocketAddr,
	stream: &mut TcpStream,
	send_tx: &SyncSender<Message>,
	local_height: Arc<AtomicU32>,
	sink: &E,
	stop: &Arc<AtomicBool>,
) -> Result<(), Error> {
	let timestamp = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0);
	send(send_tx, Message::Version(crate::msg::VersionInfo {
		version: PROTOCOL_VERSION,
		services: 0,
		timestamp,
		start_height: local_height.load(Ordering::Relaxed),
		user_agent: USER_AGENT.to_owned(),
		nonce: thread_rng().gen(),
	}))?;

	// both the peer's version and its verack must arrive, in either order
	let mut their_version: Option<crate::msg::VersionInfo> = None;
	let mut got_verack = false;
	while their_version.is_none() || !got_verack {
		if stop.load(Ordering::Relaxed) {
			return Ok(());
		}
		match read_message(stream)? {
			Message::Version(v) => {
				if their_version.is_some() {
					let _ = send(send_tx, reject_duplicate("version"));
					return Err(Error::DuplicateVersion);
				}
				if v.version < MIN_PROTOCOL_VERSION {
					return Err(Error::BadProtocolVersion(v.version));
				}
				send(send_tx, Message::VerAck)?;
				their_version = Some(v);
			}
			Message::VerAck => got_verack = true,
			Message::Ping(nonce) => send(send_tx, Message::Pong(nonce))?,
			other => {
				return Err(Error::ProtocolViolation(format!(
					"{:?} before handshake",
					other.msg_type()
				)));
			}
		}
	}
	let version = their_version.expect("handshake loop ensures version");
	info!(
		"{} ({}): connected, version {} height {} agent {}",
		id, addr, version.version, version.start_height, version.user_agent
	);
	let info = PeerInfo {
		addr,
		version: version.version,
		start_height: version.start_height,
		user_agent: version.user_agent,
	};
	if !sink.send(PeerEvent::Handshake(id, info, send_tx.clone())) {
		return Ok(());
	}

	// main pump; a pending Merkle assembly is flushed by the first
	// message that doesn't belong to it
	let mut assembly: Option<DecodedMerkleBlock> = None;
	loop {
		if stop.load(Ordering::Relaxed) {
			return Ok(());
		}
		match read_message(stream)? {
			Message::MerkleBlock(mb) => {
				if !flush_assembly(id, &mut assembly, sink) {
					return Ok(());
				}
				let (root, expected) = mb.extract_matches()?;
				assembly = Some(DecodedMerkleBlock {
					merkle: mb,
					root,
					expected,
					txs: vec![],
				});
			}
			Message::Tx(tx) => {
				let belongs = assembly
					.as_ref()
					.map(|dmb| dmb.expected.contains(&tx.txid()))
					.unwrap_or(false);
				if belongs {
					if let Some(ref mut dmb) = assembly {
						dmb.txs.push(tx);
					}
				} else {
					if !flush_assembly(id, &mut assembly, sink) {
						return Ok(());
					}
					if !sink.send(PeerEvent::Inbound(id, Message::Tx(tx))) {
						return Ok(());
					}
				}
			}
			Message::Version(_) => {
				let _ = send(send_tx, reject_duplicate("version"));
				return Err(Error::DuplicateVersion);
			}
			other => {
				if !flush_assembly(id, &mut assembly, sink) {
					return Ok(());
				}
				if !sink.send(PeerEvent::Inbound(id, other)) {
					return Ok(());
				}
			}
		}
	}
}

fn flush_assembly<E: EventSink>(
	id: PeerId,
	assembly: &mut Option<DecodedMerkleBlock>,
	sink: &E,
) -> bool {
	if let Some(dmb) = assembly.take() {
		return sink.send(PeerEvent::MerkleAssembled(id, dmb));
	}
	true
}

fn send(send_tx: &SyncSender<Message>, msg: Message) -> Result<(), Error> {
	send_tx.send(msg).map_err(|_| Error::ConnectionClose)
}

fn reject_duplicate(message: &str) -> Message {
	Message::Reject(Reject {
		message: message.to_owned(),
		code: REJECT_DUPLICATE,
		reason: "duplicate".to_owned(),
	})
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::msg::{write_message, VersionInfo};
	use std::net::TcpListener;
	use std::sync::mpsc;
	use std::thread;

	// a remote peer speaking just enough of the protocol for a handshake
	fn fake_remote(listener: TcpListener) -> thread::JoinHandle<()> {
		thread::spawn(move || {
			let (mut stream, _) = listener.accept().unwrap();
			// remote reads our version first
			match read_message(&mut stream).unwrap() {
				Message::Version(_) => (),
				other => panic!("expected version, got {:?}", other),
			}
			let version = Message::Version(VersionInfo {
				version: PROTOCOL_VERSION,
				services: 0,
				timestamp: 0,
				start_height: 42,
				user_agent: "/fake:0.1/".to_owned(),
				nonce: 1,
			});
			write_message(&mut stream, &version).unwrap();
			write_message(&mut stream, &Message::VerAck).unwrap();
			match read_message(&mut stream).unwrap() {
				Message::VerAck => (),
				other => panic!("expected verack, got {:?}", other),
			}
			write_message(&mut stream, &Message::Ping(7)).unwrap();
			// wait for the pong before hanging up
			loop {
				match read_message(&mut stream) {
					Ok(Message::Pong(7)) => break,
					Ok(_) => continue,
					Err(e) => panic!("remote read failed: {:?}", e),
				}
			}
		})
	}

	#[test]
	fn handshake_and_ping() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let remote = fake_remote(listener);

		let (event_tx, event_rx) = mpsc::sync_channel(16);
		let stop = Arc::new(AtomicBool::new(false));
		let id = PeerId(1);
		let height = Arc::new(AtomicU32::new(0));

		let session = thread::spawn(move || {
			let _ = run(id, addr, height, event_tx, stop);
		});

		let sender = match event_rx.recv().unwrap() {
			PeerEvent::Handshake(peer, info, sender) => {
				assert_eq!(peer, id);
				assert_eq!(info.start_height, 42);
				sender
			}
			_ => panic!("expected handshake first"),
		};
		// the inbound ping reaches us as an event; answer it so the
		// remote can finish
		match event_rx.recv().unwrap() {
			PeerEvent::Inbound(peer, Message::Ping(7)) => {
				assert_eq!(peer, id);
				sender.send(Message::Pong(7)).unwrap();
			}
			_ => panic!("expected the ping"),
		}

		remote.join().unwrap();
		// remote hung up, the session ends with a disconnect
		loop {
			match event_rx.recv().unwrap() {
				PeerEvent::Disconnect(peer) => {
					assert_eq!(peer, id);
					break;
				}
				_ => continue,
			}
		}
		session.join().unwrap();
	}
}
