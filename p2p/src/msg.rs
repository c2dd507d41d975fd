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

//! Message types that transit over the network and related serialization
//! code. Framing is a small fixed header (magic, type, body length)
//! followed by the body in the workspace binary encoding.

use std::io::{Read, Write};

use enum_primitive::FromPrimitive;

use keel_core::core::bloom::BloomFilter;
use keel_core::core::hash::{read_hashes, write_hashes, Hash};
use keel_core::core::header::BlockHeader;
use keel_core::core::merkle::MerkleBlock;
use keel_core::core::transaction::Transaction;
use keel_core::ser::{self, BinReader, BinWriter, Readable, Reader, Writeable, Writer};

use crate::types::{Error, MAX_BLOCK_HEADERS, MAX_INV, MAX_LOCATOR_HASHES};

/// Magic number expected in the header of every message.
pub const MAGIC: [u8; 2] = [0x6b, 0x31];

/// Serialized length of a message header.
pub const HEADER_LEN: u64 = 11;

/// Largest message body we accept.
pub const MAX_MSG_LEN: u64 = 4 * 1024 * 1024;

/// Reject code for a duplicated message.
pub const REJECT_DUPLICATE: u8 = 0x12;

enum_from_primitive! {
	/// Types of messages
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum Type {
		/// Opening of a handshake
		Version = 1,
		/// Handshake acknowledgement
		VerAck = 2,
		/// Liveness probe
		Ping = 3,
		/// Liveness answer
		Pong = 4,
		/// Inventory announcement
		Inv = 5,
		/// Header solicitation by locator
		GetHeaders = 6,
		/// Headers answering a solicitation
		Headers = 7,
		/// Request for inventory data
		GetData = 8,
		/// A filtered block
		MerkleBlock = 9,
		/// A lone transaction
		Tx = 10,
		/// Bloom filter upload
		FilterLoad = 11,
		/// The peer refused something we sent
		Reject = 12,
	}
}

enum_from_primitive! {
	/// What an inventory vector refers to.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum InvKind {
		/// A transaction
		Tx = 1,
		/// A full block
		Block = 2,
		/// A block filtered through the loaded bloom filter
		MerkleBlock = 3,
	}
}

/// A single inventory item, announcing or requesting one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
	/// Kind of object referred to
	pub kind: InvKind,
	/// The object's hash
	pub hash: Hash,
}

/// First message of the handshake, sent by both sides.
#[derive(Debug, Clone)]
pub struct VersionInfo {
	/// Protocol version of the sender
	pub version: u32,
	/// Service bits of the sender
	pub services: u64,
	/// Sender's clock
	pub timestamp: i64,
	/// Height of the sender's best chain
	pub start_height: u32,
	/// Name and version of the sender's software
	pub user_agent: String,
	/// Randomly generated for each handshake, helps detect self
	pub nonce: u64,
}

/// Block locator plus stop hash soliciting headers from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
	/// Protocol version of the sender
	pub version: u32,
	/// Sparse sample of our best chain, most recent first
	pub locator: Vec<Hash>,
	/// Hash to stop serving headers at, zero for "as many as you have"
	pub stop: Hash,
}

/// We refused a message, or a peer refused one of ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
	/// Name of the refused message
	pub message: String,
	/// Machine readable refusal code
	pub code: u8,
	/// Human readable detail
	pub reason: String,
}

/// One decoded network message.
#[derive(Debug, Clone)]
pub enum Message {
	/// Handshake opening
	Version(VersionInfo),
	/// Handshake acknowledgement
	VerAck,
	/// Liveness probe with a nonce to echo
	Ping(u64),
	/// Echo of a ping nonce
	Pong(u64),
	/// Objects the peer has on offer
	Inv(Vec<Inventory>),
	/// Solicit headers following a locator
	GetHeaders(Locator),
	/// Headers following our locator
	Headers(Vec<BlockHeader>),
	/// Request objects announced in an inv
	GetData(Vec<Inventory>),
	/// A filtered block
	MerkleBlock(MerkleBlock),
	/// A lone transaction
	Tx(Transaction),
	/// Load a bloom filter to prefilter relayed transactions
	FilterLoad(BloomFilter),
	/// Refusal of a previous message
	Reject(Reject),
}

impl Message {
	/// Wire type tag of this message.
	pub fn msg_type(&self) -> Type {
		match self {
			Message::Version(_) => Type::Version,
			Message::VerAck => Type::VerAck,
			Message::Ping(_) => Type::Ping,
			Message::Pong(_) => Type::Pong,
			Message::Inv(_) => Type::Inv,
			Message::GetHeaders(_) => Type::GetHeaders,
			Message::Headers(_) => Type::Headers,
			Message::GetData(_) => Type::GetData,
			Message::MerkleBlock(_) => Type::MerkleBlock,
			Message::Tx(_) => Type::Tx,
			Message::FilterLoad(_) => Type::FilterLoad,
			Message::Reject(_) => Type::Reject,
		}
	}
}

/// Header of any protocol message, used to identify incoming messages.
pub struct MsgHeader {
	magic: [u8; 2],
	/// Type of the message body
	pub msg_type: Type,
	/// Length of the message body in bytes
	pub msg_len: u64,
}

impl MsgHeader {
	fn new(msg_type: Type, msg_len: u64) -> MsgHeader {
		MsgHeader {
			magic: MAGIC,
			msg_type,
			msg_len,
		}
	}
}

impl Writeable for MsgHeader {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u8(self.magic[0])?;
		writer.write_u8(self.magic[1])?;
		writer.write_u8(self.msg_type as u8)?;
		writer.write_u64(self.msg_len)
	}
}

impl Readable for MsgHeader {
	fn read<R: Reader>(reader: &mut R) -> Result<MsgHeader, ser::Error> {
		reader.expect_u8(MAGIC[0])?;
		reader.expect_u8(MAGIC[1])?;
		let t = reader.read_u8()?;
		let msg_type = Type::from_u8(t).ok_or(ser::Error::CorruptedData)?;
		let msg_len = reader.read_u64()?;
		Ok(MsgHeader {
			magic: MAGIC,
			msg_type,
			msg_len,
		})
	}
}

impl Writeable for VersionInfo {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.version)?;
		writer.write_u64(self.services)?;
		writer.write_i64(self.timestamp)?;
		writer.write_u32(self.start_height)?;
		self.user_agent.write(writer)?;
		writer.write_u64(self.nonce)
	}
}

impl Readable for VersionInfo {
	fn read<R: Reader>(reader: &mut R) -> Result<VersionInfo, ser::Error> {
		let version = reader.read_u32()?;
		let services = reader.read_u64()?;
		let timestamp = reader.read_i64()?;
		let start_height = reader.read_u32()?;
		let user_agent = String::read(reader)?;
		let nonce = reader.read_u64()?;
		Ok(VersionInfo {
			version,
			services,
			timestamp,
			start_height,
			user_agent,
			nonce,
		})
	}
}

impl Writeable for Locator {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.version)?;
		write_hashes(writer, &self.locator)?;
		self.stop.write(writer)
	}
}

impl Readable for Locator {
	fn read<R: Reader>(reader: &mut R) -> Result<Locator, ser::Error> {
		let version = reader.read_u32()?;
		let locator = read_hashes(reader, MAX_LOCATOR_HASHES)?;
		let stop = Hash::read(reader)?;
		Ok(Locator {
			version,
			locator,
			stop,
		})
	}
}

impl Writeable for Inventory {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u8(self.kind as u8)?;
		self.hash.write(writer)
	}
}

impl Readable for Inventory {
	fn read<R: Reader>(reader: &mut R) -> Result<Inventory, ser::Error> {
		let kind = InvKind::from_u8(reader.read_u8()?).ok_or(ser::Error::CorruptedData)?;
		let hash = Hash::read(reader)?;
		Ok(Inventory { kind, hash })
	}
}

impl Writeable for Reject {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.message.write(writer)?;
		writer.write_u8(self.code)?;
		self.reason.write(writer)
	}
}

impl Readable for Reject {
	fn read<R: Reader>(reader: &mut R) -> Result<Reject, ser::Error> {
		let message = String::read(reader)?;
		let code = reader.read_u8()?;
		let reason = String::read(reader)?;
		Ok(Reject {
			message,
			code,
			reason,
		})
	}
}

fn write_inventory<W: Writer>(writer: &mut W, inv: &[Inventory]) -> Result<(), ser::Error> {
	writer.write_u64(inv.len() as u64)?;
	for item in inv {
		item.write(writer)?;
	}
	Ok(())
}

fn read_inventory<R: Reader>(reader: &mut R) -> Result<Vec<Inventory>, ser::Error> {
	let len = reader.read_u64()? as usize;
	if len > MAX_INV {
		return Err(ser::Error::TooLargeReadErr(format!("{} inventory items", len)));
	}
	let mut inv = Vec::with_capacity(len);
	for _ in 0..len {
		inv.push(Inventory::read(reader)?);
	}
	Ok(inv)
}

fn write_body<W: Writer>(writer: &mut W, msg: &Message) -> Result<(), ser::Error> {
	match msg {
		Message::Version(v) => v.write(writer),
		Message::VerAck => Ok(()),
		Message::Ping(nonce) => writer.write_u64(*nonce),
		Message::Pong(nonce) => writer.write_u64(*nonce),
		Message::Inv(inv) => write_inventory(writer, inv),
		Message::GetHeaders(locator) => locator.write(writer),
		Message::Headers(headers) => {
			writer.write_u64(headers.len() as u64)?;
			for header in headers {
				header.write(writer)?;
				// transaction count, always zero on a headers answer
				writer.write_u64(0)?;
			}
			Ok(())
		}
		Message::GetData(inv) => write_inventory(writer, inv),
		Message::MerkleBlock(mb) => mb.write(writer),
		Message::Tx(tx) => tx.write(writer),
		Message::FilterLoad(filter) => filter.write(writer),
		Message::Reject(reject) => reject.write(writer),
	}
}

fn read_body<R: Reader>(reader: &mut R, msg_type: Type) -> Result<Message, ser::Error> {
	let msg = match msg_type {
		Type::Version => Message::Version(VersionInfo::read(reader)?),
		Type::VerAck => Message::VerAck,
		Type::Ping => Message::Ping(reader.read_u64()?),
		Type::Pong => Message::Pong(reader.read_u64()?),
		Type::Inv => Message::Inv(read_inventory(reader)?),
		Type::GetHeaders => Message::GetHeaders(Locator::read(reader)?),
		Type::Headers => {
			let len = reader.read_u64()? as usize;
			if len > MAX_BLOCK_HEADERS {
				return Err(ser::Error::TooLargeReadErr(format!("{} headers", len)));
			}
			let mut headers = Vec::with_capacity(len);
			for _ in 0..len {
				headers.push(BlockHeader::read(reader)?);
				let _tx_count = reader.read_u64()?;
			}
			Message::Headers(headers)
		}
		Type::GetData => Message::GetData(read_inventory(reader)?),
		Type::MerkleBlock => Message::MerkleBlock(MerkleBlock::read(reader)?),
		Type::Tx => Message::Tx(Transaction::read(reader)?),
		Type::FilterLoad => Message::FilterLoad(BloomFilter::read(reader)?),
		Type::Reject => Message::Reject(Reject::read(reader)?),
	};
	Ok(msg)
}

/// Reads a full message from the stream, blocking until one arrives.
pub fn read_message(stream: &mut dyn Read) -> Result<Message, Error> {
	let mut header_buf = [0u8; HEADER_LEN as usize];
	stream.read_exact(&mut header_buf)?;
	let header: MsgHeader = ser::deser_slice(&header_buf)?;
	if header.msg_len > MAX_MSG_LEN {
		return Err(Error::ProtocolViolation(format!(
			"{:?} message of {} bytes",
			header.msg_type, header.msg_len
		)));
	}
	let mut body = vec![0u8; header.msg_len as usize];
	stream.read_exact(&mut body)?;
	let mut slice = &body[..];
	let mut reader = BinReader::new(&mut slice);
	let msg = read_body(&mut reader, header.msg_type)?;
	Ok(msg)
}

/// Serializes a full message, header first, into the stream.
pub fn write_message(stream: &mut dyn Write, msg: &Message) -> Result<(), Error> {
	let mut body = vec![];
	{
		let mut writer = BinWriter::new(&mut body);
		write_body(&mut writer, msg)?;
	}
	let mut data = ser::ser_vec(&MsgHeader::new(msg.msg_type(), body.len() as u64))?;
	data.append(&mut body);
	stream.write_all(&data).map_err(Error::Connection)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::types::PROTOCOL_VERSION;
	use keel_core::core::hash::ZERO_HASH;
	use std::io::Cursor;

	fn roundtrip(msg: Message) -> Message {
		let mut buf = vec![];
		write_message(&mut buf, &msg).unwrap();
		let mut cursor = Cursor::new(buf);
		read_message(&mut cursor).unwrap()
	}

	#[test]
	fn ping_pong_roundtrip() {
		match roundtrip(Message::Ping(77)) {
			Message::Ping(77) => (),
			other => panic!("unexpected {:?}", other),
		}
		match roundtrip(Message::Pong(0)) {
			Message::Pong(0) => (),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn version_roundtrip() {
		let version = VersionInfo {
			version: PROTOCOL_VERSION,
			services: 0,
			timestamp: 1_600_000_000,
			start_height: 12,
			user_agent: "/keel:test/".to_owned(),
			nonce: 99,
		};
		match roundtrip(Message::Version(version.clone())) {
			Message::Version(v) => {
				assert_eq!(v.version, version.version);
				assert_eq!(v.start_height, 12);
				assert_eq!(v.user_agent, version.user_agent);
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn getheaders_roundtrip() {
		let locator = Locator {
			version: PROTOCOL_VERSION,
			locator: vec![Hash([1; 32]), Hash([2; 32])],
			stop: ZERO_HASH,
		};
		match roundtrip(Message::GetHeaders(locator.clone())) {
			Message::GetHeaders(l) => assert_eq!(l, locator),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn inv_roundtrip() {
		let inv = vec![
			Inventory {
				kind: InvKind::Tx,
				hash: Hash([3; 32]),
			},
			Inventory {
				kind: InvKind::MerkleBlock,
				hash: Hash([4; 32]),
			},
		];
		match roundtrip(Message::Inv(inv.clone())) {
			Message::Inv(i) => assert_eq!(i, inv),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn bad_magic_rejected() {
		let mut buf = vec![];
		write_message(&mut buf, &Message::Ping(1)).unwrap();
		buf[0] = 0xff;
		let mut cursor = Cursor::new(buf);
		assert!(read_message(&mut cursor).is_err());
	}
}
