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

//! Serialization and deserialization layer specialized for binary encoding.
//! Ensures consistency and safety. Basically a minimal subset of
//! rustc_serialize customized for our need.
//!
//! To use it simply implement `Writeable` or `Readable` and then use the
//! `serialize` or `deserialize` functions on them as appropriate.
//!
//! Numbers are encoded little-endian, matching the wire order of the
//! network family this node speaks to.

use std::io;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};

/// Largest single read we will ever perform for a variable-length field.
/// Purely a DoS guard, no valid message comes close.
const MAX_SINGLE_READ: usize = 1_000_000;

/// Possible errors deriving from serializing or deserializing.
#[derive(Debug, Fail)]
pub enum Error {
	/// Wraps an io error produced when reading or writing
	#[fail(display = "IO error: {}", _0)]
	IOErr(io::Error),
	/// Expected a given value that wasn't found
	#[fail(display = "unexpected data")]
	UnexpectedData {
		/// What we wanted
		expected: Vec<u8>,
		/// What we got
		received: Vec<u8>,
	},
	/// Data wasn't in a consumable format
	#[fail(display = "corrupted data")]
	CorruptedData,
	/// When asked to read too much data
	#[fail(display = "too large read: {}", _0)]
	TooLargeReadErr(String),
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::IOErr(e)
	}
}

/// Implementations defined how different numbers and binary structures are
/// written to an underlying stream or container (depending on implementation).
pub trait Writer {
	/// Writes a fixed number of bytes. The reader is expected to know the
	/// actual length on read.
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;

	/// Writes a u8 as bytes
	fn write_u8(&mut self, n: u8) -> Result<(), Error> {
		self.write_fixed_bytes(&[n])
	}
	/// Writes a u16 as bytes
	fn write_u16(&mut self, n: u16) -> Result<(), Error> {
		self.write_fixed_bytes(&n.to_le_bytes())
	}
	/// Writes a u32 as bytes
	fn write_u32(&mut self, n: u32) -> Result<(), Error> {
		self.write_fixed_bytes(&n.to_le_bytes())
	}
	/// Writes a u64 as bytes
	fn write_u64(&mut self, n: u64) -> Result<(), Error> {
		self.write_fixed_bytes(&n.to_le_bytes())
	}
	/// Writes a i32 as bytes
	fn write_i32(&mut self, n: i32) -> Result<(), Error> {
		self.write_fixed_bytes(&n.to_le_bytes())
	}
	/// Writes a i64 as bytes
	fn write_i64(&mut self, n: i64) -> Result<(), Error> {
		self.write_fixed_bytes(&n.to_le_bytes())
	}
	/// Writes a variable length byte sequence, the length is encoded as a
	/// u64 prefix.
	fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.write_u64(bytes.len() as u64)?;
		self.write_fixed_bytes(bytes)
	}
}

/// Implementations defined how different numbers and binary structures are
/// read from an underlying stream or container (depending on implementation).
pub trait Reader {
	/// Read a u8 from the underlying Read
	fn read_u8(&mut self) -> Result<u8, Error>;
	/// Read a u16 from the underlying Read
	fn read_u16(&mut self) -> Result<u16, Error>;
	/// Read a u32 from the underlying Read
	fn read_u32(&mut self) -> Result<u32, Error>;
	/// Read a u64 from the underlying Read
	fn read_u64(&mut self) -> Result<u64, Error>;
	/// Read a i32 from the underlying Read
	fn read_i32(&mut self) -> Result<i32, Error>;
	/// Read a i64 from the underlying Read
	fn read_i64(&mut self) -> Result<i64, Error>;
	/// Read a variable length byte sequence, expecting the u64 length
	/// prefix first.
	fn read_bytes_len_prefix(&mut self) -> Result<Vec<u8>, Error>;
	/// Read a fixed number of bytes from the underlying reader.
	fn read_fixed_bytes(&mut self, length: usize) -> Result<Vec<u8>, Error>;
	/// Consumes a byte from the reader, producing an error if it doesn't have
	/// the expected value
	fn expect_u8(&mut self, val: u8) -> Result<u8, Error>;
}

/// Trait that every type that can be serialized as binary must implement.
/// Writes directly to a Writer, a utility type thinly wrapping an
/// underlying Write implementation.
pub trait Writeable {
	/// Write the data held by this Writeable to the provided writer
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error>;
}

/// Trait that every type that can be deserialized from binary must implement.
/// Reads directly to a Reader, a utility type thinly wrapping an
/// underlying Read implementation.
pub trait Readable: Sized {
	/// Reads the data necessary to this Readable from the provided reader
	fn read<R: Reader>(reader: &mut R) -> Result<Self, Error>;
}

/// Deserializes a Readable from any std::io::Read implementation.
pub fn deserialize<T: Readable>(source: &mut dyn Read) -> Result<T, Error> {
	let mut reader = BinReader { source };
	T::read(&mut reader)
}

/// Serializes a Writeable into any std::io::Write implementation.
pub fn serialize<W: Writeable>(sink: &mut dyn Write, thing: &W) -> Result<(), Error> {
	let mut writer = BinWriter { sink };
	thing.write(&mut writer)
}

/// Utility function to serialize a writeable directly in memory using a
/// Vec<u8>.
pub fn ser_vec<W: Writeable>(thing: &W) -> Result<Vec<u8>, Error> {
	let mut vec = Vec::new();
	serialize(&mut vec, thing)?;
	Ok(vec)
}

/// Utility to read a full Readable from a byte slice.
pub fn deser_slice<T: Readable>(mut slice: &[u8]) -> Result<T, Error> {
	deserialize(&mut slice)
}

/// Utility wrapper for an underlying byte Reader. Defines higher level methods
/// to read numbers, byte vectors, hashes, etc.
pub struct BinReader<'a> {
	source: &'a mut dyn Read,
}

impl<'a> BinReader<'a> {
	/// Constructor for a new BinReader for the provided source
	pub fn new(source: &'a mut dyn Read) -> BinReader<'a> {
		BinReader { source }
	}
}

impl<'a> Reader for BinReader<'a> {
	fn read_u8(&mut self) -> Result<u8, Error> {
		self.source.read_u8().map_err(Error::IOErr)
	}
	fn read_u16(&mut self) -> Result<u16, Error> {
		self.source.read_u16::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_u32(&mut self) -> Result<u32, Error> {
		self.source.read_u32::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_u64(&mut self) -> Result<u64, Error> {
		self.source.read_u64::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_i32(&mut self) -> Result<i32, Error> {
		self.source.read_i32::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_i64(&mut self) -> Result<i64, Error> {
		self.source.read_i64::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_bytes_len_prefix(&mut self) -> Result<Vec<u8>, Error> {
		let len = self.read_u64()?;
		self.read_fixed_bytes(len as usize)
	}
	fn read_fixed_bytes(&mut self, length: usize) -> Result<Vec<u8>, Error> {
		if length > MAX_SINGLE_READ {
			return Err(Error::TooLargeReadErr(format!(
				"fixed bytes length too large: {}",
				length
			)));
		}
		let mut buf = vec![0; length];
		self.source
			.read_exact(&mut buf)
			.map(move |_| buf)
			.map_err(Error::IOErr)
	}
	fn expect_u8(&mut self, val: u8) -> Result<u8, Error> {
		let b = self.read_u8()?;
		if b == val {
			Ok(b)
		} else {
			Err(Error::UnexpectedData {
				expected: vec![val],
				received: vec![b],
			})
		}
	}
}

/// Utility wrapper for an underlying byte Writer. Defines higher level methods
/// to write numbers, byte vectors, hashes, etc.
pub struct BinWriter<'a> {
	sink: &'a mut dyn Write,
}

impl<'a> BinWriter<'a> {
	/// Wraps a standard Write in a new BinWriter
	pub fn new(sink: &'a mut dyn Write) -> BinWriter<'a> {
		BinWriter { sink }
	}
}

impl<'a> Writer for BinWriter<'a> {
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.sink.write_all(bytes).map_err(Error::IOErr)
	}
}

impl Writeable for Vec<u8> {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_bytes(self)
	}
}

impl Readable for Vec<u8> {
	fn read<R: Reader>(reader: &mut R) -> Result<Vec<u8>, Error> {
		reader.read_bytes_len_prefix()
	}
}

impl Writeable for String {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_bytes(self.as_bytes())
	}
}

impl Readable for String {
	fn read<R: Reader>(reader: &mut R) -> Result<String, Error> {
		let bytes = reader.read_bytes_len_prefix()?;
		String::from_utf8(bytes).map_err(|_| Error::CorruptedData)
	}
}
