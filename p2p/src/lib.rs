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

//! Networking code to connect to other nodes in the network: the typed
//! message set and its framing, the per-peer connection threads and the
//! registry of connected peers.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate log;

mod conn;
pub mod msg;
pub mod peer;
pub mod peers;
pub mod types;

pub use crate::msg::{read_message, write_message, Inventory, InvKind, Locator, Message, Reject, Type, VersionInfo};
pub use crate::peers::{PeerRegistry, RegisteredPeer};
pub use crate::types::{
	Error, EventSink, PeerEvent, PeerId, PeerInfo, MAX_BLOCK_HEADERS, MAX_INV,
	MAX_LOCATOR_HASHES, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SEND_CHANNEL_CAP,
	USER_AGENT,
};
