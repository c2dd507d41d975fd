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

//! Implementation of the keel data structures: block headers, transactions,
//! Merkle blocks and bloom filters, along with the consensus arithmetic and
//! the binary serialization layer shared by the wire codec and the stores.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
extern crate failure_derive;

pub mod consensus;
pub mod core;
pub mod genesis;
pub mod params;
pub mod ser;
