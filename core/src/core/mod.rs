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

//! Core types: block headers, transactions, Merkle blocks, bloom filters.

pub mod bloom;
pub mod hash;
pub mod header;
pub mod merkle;
pub mod transaction;

pub use self::bloom::BloomFilter;
pub use self::hash::{Hash, Hashed, ZERO_HASH};
pub use self::header::BlockHeader;
pub use self::merkle::{DecodedMerkleBlock, MerkleBlock};
pub use self::transaction::{OutPoint, Transaction, TxIn, TxOut};
