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

//! The header chain: the single authority on chain structure. Validates
//! headers, selects the most worked chain, computes reorganizations,
//! produces block locators and tracks which blocks remain to be fetched
//! as Merkle blocks.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

mod chain;
pub mod error;
pub mod store;
pub mod types;

pub use crate::chain::HeaderChain;
pub use crate::error::{Error, ErrorKind};
pub use crate::store::{ChainKVStore, MemoryStore};
pub use crate::types::{ChainAction, HeaderNode, HeaderStore};
