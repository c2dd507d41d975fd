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

//! Storage of core types using LMDB.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
extern crate failure_derive;

use byteorder::{BigEndian, WriteBytesExt};

mod lmdb;

pub use crate::lmdb::*;
// Re-export so dependent crates can name environment types without a
// direct dependency on the backing library.
pub use lmdb_zero;

/// Separator between a key prefix and the key body.
pub const SEP: u8 = b':';

/// Build a prefixed store key from a prefix and an identifier.
pub fn to_key(prefix: u8, k: &[u8]) -> Vec<u8> {
	let mut res = Vec::with_capacity(k.len() + 2);
	res.push(prefix);
	res.push(SEP);
	res.extend_from_slice(k);
	res
}

/// Build a prefixed store key from a prefix and a big-endian number, so
/// that lexicographic key order matches numeric order.
pub fn u32_to_key(prefix: u8, val: u32) -> Vec<u8> {
	let mut u32_vec = vec![];
	u32_vec.write_u32::<BigEndian>(val).unwrap();
	to_key(prefix, &u32_vec)
}
