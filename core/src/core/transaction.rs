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

//! Transactions as an SPV node sees them: relayed, matched against the
//! wallet filter and handed over, never executed. Scripts are opaque bytes
//! here.

use crate::core::hash::{Hash, Hashed};
use crate::ser::{Error, Readable, Reader, Writeable, Writer};

/// Largest number of inputs or outputs we will deserialize. DoS guard only.
const MAX_IN_OUT_LEN: u64 = 50_000;

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
	/// Transaction the output belongs to
	pub hash: Hash,
	/// Index of the output within that transaction
	pub index: u32,
}

/// A transaction input spending a previous output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
	/// The output being spent
	pub prev_out: OutPoint,
	/// Unlocking script, opaque to this node
	pub script_sig: Vec<u8>,
	/// Sequence number
	pub sequence: u32,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
	/// Amount in base units
	pub value: u64,
	/// Locking script, opaque to this node
	pub script_pubkey: Vec<u8>,
}

/// A full transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
	/// Transaction format version
	pub version: i32,
	/// Inputs
	pub inputs: Vec<TxIn>,
	/// Outputs
	pub outputs: Vec<TxOut>,
	/// Earliest block height or time this transaction may be mined at
	pub lock_time: u32,
}

impl Transaction {
	/// The transaction id, double SHA-256 of the serialization.
	pub fn txid(&self) -> Hash {
		self.hash()
	}
}

impl Writeable for OutPoint {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		self.hash.write(writer)?;
		writer.write_u32(self.index)
	}
}

impl Readable for OutPoint {
	fn read<R: Reader>(reader: &mut R) -> Result<OutPoint, Error> {
		let hash = Hash::read(reader)?;
		let index = reader.read_u32()?;
		Ok(OutPoint { hash, index })
	}
}

impl Writeable for TxIn {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		self.prev_out.write(writer)?;
		writer.write_bytes(&self.script_sig)?;
		writer.write_u32(self.sequence)
	}
}

impl Readable for TxIn {
	fn read<R: Reader>(reader: &mut R) -> Result<TxIn, Error> {
		let prev_out = OutPoint::read(reader)?;
		let script_sig = reader.read_bytes_len_prefix()?;
		let sequence = reader.read_u32()?;
		Ok(TxIn {
			prev_out,
			script_sig,
			sequence,
		})
	}
}

impl Writeable for TxOut {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u64(self.value)?;
		writer.write_bytes(&self.script_pubkey)
	}
}

impl Readable for TxOut {
	fn read<R: Reader>(reader: &mut R) -> Result<TxOut, Error> {
		let value = reader.read_u64()?;
		let script_pubkey = reader.read_bytes_len_prefix()?;
		Ok(TxOut {
			value,
			script_pubkey,
		})
	}
}

impl Writeable for Transaction {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_i32(self.version)?;
		writer.write_u64(self.inputs.len() as u64)?;
		for input in &self.inputs {
			input.write(writer)?;
		}
		writer.write_u64(self.outputs.len() as u64)?;
		for output in &self.outputs {
			output.write(writer)?;
		}
		writer.write_u32(self.lock_time)
	}
}

impl Readable for Transaction {
	fn read<R: Reader>(reader: &mut R) -> Result<Transaction, Error> {
		let version = reader.read_i32()?;
		let input_len = reader.read_u64()?;
		if input_len > MAX_IN_OUT_LEN {
			return Err(Error::TooLargeReadErr(format!("{} inputs", input_len)));
		}
		let mut inputs = Vec::with_capacity(input_len as usize);
		for _ in 0..input_len {
			inputs.push(TxIn::read(reader)?);
		}
		let output_len = reader.read_u64()?;
		if output_len > MAX_IN_OUT_LEN {
			return Err(Error::TooLargeReadErr(format!("{} outputs", output_len)));
		}
		let mut outputs = Vec::with_capacity(output_len as usize);
		for _ in 0..output_len {
			outputs.push(TxOut::read(reader)?);
		}
		let lock_time = reader.read_u32()?;
		Ok(Transaction {
			version,
			inputs,
			outputs,
			lock_time,
		})
	}
}

impl Hashed for Transaction {}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ser::{deser_slice, ser_vec};

	#[test]
	fn tx_ser_roundtrip() {
		let tx = Transaction {
			version: 1,
			inputs: vec![TxIn {
				prev_out: OutPoint {
					hash: Hash([7; 32]),
					index: 1,
				},
				script_sig: vec![0xab, 0xcd],
				sequence: 0xffffffff,
			}],
			outputs: vec![TxOut {
				value: 50_000,
				script_pubkey: vec![0x76, 0xa9],
			}],
			lock_time: 0,
		};
		let data = ser_vec(&tx).unwrap();
		let back: Transaction = deser_slice(&data).unwrap();
		assert_eq!(back, tx);
		assert_eq!(back.txid(), tx.txid());
	}
}
