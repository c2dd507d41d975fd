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

//! The SPV node itself: wires the header chain, the peer connections and
//! the wallet sink together around the coordinator reactor.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod error;
pub mod handle;
pub mod seed;
pub mod server;
pub mod spv;
pub mod wallet;

pub use crate::config::ServerConfig;
pub use crate::error::Error;
pub use crate::handle::SpvHandle;
pub use crate::server::Server;
pub use crate::spv::{ClientRequest, SpvCoordinator, SpvEvent};
pub use crate::wallet::WalletSink;
