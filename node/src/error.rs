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

//! Node level error type, aggregating the layers below.

use std::fmt;
use std::io;

use keel_chain as chain;
use keel_p2p as p2p;
use keel_store as store;

/// Errors surfacing when assembling or running the node.
#[derive(Debug)]
pub enum Error {
	/// Header chain failure
	Chain(chain::Error),
	/// Storage failure
	Store(store::Error),
	/// Networking failure
	P2p(p2p::Error),
	/// The configuration doesn't describe a runnable node
	Config(String),
	/// Underlying I/O failure
	Io(io::Error),
	/// The node is shutting down, the request was not accepted
	Stopped,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Chain(e) => write!(f, "chain error: {}", e),
			Error::Store(e) => write!(f, "store error: {}", e),
			Error::P2p(e) => write!(f, "p2p error: {:?}", e),
			Error::Config(s) => write!(f, "config error: {}", s),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Stopped => write!(f, "node stopped"),
		}
	}
}

impl From<chain::Error> for Error {
	fn from(e: chain::Error) -> Error {
		Error::Chain(e)
	}
}

impl From<store::Error> for Error {
	fn from(e: store::Error) -> Error {
		Error::Store(e)
	}
}

impl From<p2p::Error> for Error {
	fn from(e: p2p::Error) -> Error {
		Error::P2p(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}
