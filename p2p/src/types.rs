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

//! Shared types of the networking layer: peer identity, events, errors and
//! protocol constants.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use keel_core::core::merkle::{DecodedMerkleBlock, MerkleError};
use keel_core::ser;

use crate::msg::Message;

/// Current version of the protocol this node speaks.
pub const PROTOCOL_VERSION: u32 = 70_001;

/// Oldest protocol version we are willing to talk to. Below this peers
/// cannot serve filtered blocks.
pub const MIN_PROTOCOL_VERSION: u32 = 70_001;

/// User agent advertised in the version handshake.
pub const USER_AGENT: &str = "/keel:0.3.0/";

/// Maximum number of block headers in a single headers message.
pub const MAX_BLOCK_HEADERS: usize = 2_000;

/// Maximum number of inventory vectors in a single message.
pub const MAX_INV: usize = 50_000;

/// Maximum number of hashes in a block locator.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Capacity of the outbound message channel of one peer.
pub const SEND_CHANNEL_CAP: usize = 32;

/// Capacity of the coordinator's inbound event mailbox.
pub const EVENT_CHANNEL_CAP: usize = 1_024;

/// How long we wait for a TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a connection may stay silent before we give it up. Heartbeat
/// pings keep live connections well under this.
pub const READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Stable identifier of one connection. Monotonically assigned; a peer
/// that reconnects gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "peer:{}", self.0)
	}
}

/// General information about a connected peer learned in the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
	/// Remote address
	pub addr: SocketAddr,
	/// Protocol version the peer speaks
	pub version: u32,
	/// Chain height the peer advertised, kept up to date afterwards
	pub start_height: u32,
	/// Peer software identification
	pub user_agent: String,
}

/// Everything a peer connection can tell the coordinator. Events of one
/// peer arrive in wire order.
pub enum PeerEvent {
	/// Handshake completed; carries the peer's info and the channel to
	/// send messages back to it
	Handshake(PeerId, PeerInfo, SyncSender<Message>),
	/// The connection ended, orderly or not. Emitted exactly once per
	/// connection.
	Disconnect(PeerId),
	/// A decoded message that needs no assembly
	Inbound(PeerId, Message),
	/// A Merkle block and its trailing matching transactions, assembled
	/// by the connection codec
	MerkleAssembled(PeerId, DecodedMerkleBlock),
}

/// Consumer of peer events. The node hands each connection a cloned sink
/// wired into the coordinator mailbox; tests capture events directly.
pub trait EventSink: Send + Clone + 'static {
	/// Deliver one event. Returns false when the consumer is gone and the
	/// connection should wind down.
	fn send(&self, event: PeerEvent) -> bool;
}

impl EventSink for SyncSender<PeerEvent> {
	fn send(&self, event: PeerEvent) -> bool {
		SyncSender::send(self, event).is_ok()
	}
}

/// Errors of the networking layer.
#[derive(Debug)]
pub enum Error {
	/// Message could not be encoded or decoded
	Serialization(ser::Error),
	/// Underlying socket error
	Connection(io::Error),
	/// The remote side closed on us
	ConnectionClose,
	/// The remote side went silent
	Timeout,
	/// Peer speaks a protocol older than we support
	BadProtocolVersion(u32),
	/// Peer sent a second version message
	DuplicateVersion,
	/// Peer sent something the protocol doesn't allow at this point
	ProtocolViolation(String),
	/// Peer sent a Merkle block whose partial tree doesn't parse
	BadMerkleTree(MerkleError),
}

impl From<ser::Error> for Error {
	fn from(e: ser::Error) -> Error {
		Error::Serialization(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut {
			Error::Timeout
		} else {
			Error::Connection(e)
		}
	}
}

impl From<MerkleError> for Error {
	fn from(e: MerkleError) -> Error {
		Error::BadMerkleTree(e)
	}
}
