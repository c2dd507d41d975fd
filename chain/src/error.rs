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

//! Error types for the header chain
use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

use keel_store as store;

/// Error definition
#[derive(Debug, Fail)]
pub struct Error {
	inner: Context<ErrorKind>,
}

/// Chain error definitions
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
	/// The header references a parent we have never seen
	#[fail(display = "Parent Unknown")]
	ParentUnknown,
	/// The header hash doesn't meet the target claimed by its bits, or the
	/// bits themselves are out of range
	#[fail(display = "Bad Proof of Work")]
	BadProofOfWork,
	/// Header timestamp is too far in the future
	#[fail(display = "Bad Timestamp")]
	BadTimestamp,
	/// The claimed difficulty doesn't match what the retarget rule requires
	#[fail(display = "Bad Work")]
	BadWork,
	/// Header timestamp is at or below the median of its ancestors
	#[fail(display = "Timestamp Too Early")]
	TimestampTooEarly,
	/// The header would fork off below the last reached checkpoint
	#[fail(display = "Rewrites Checkpoint")]
	RewritesCheckpoint,
	/// A checkpoint exists at this height and the header doesn't match it
	#[fail(display = "Fails Checkpoint")]
	FailsCheckpoint,
	/// The header version is no longer accepted at this height
	#[fail(display = "Disallowed Version: {}", _0)]
	DisallowedVersion(i32),
	/// A header batch isn't internally linked
	#[fail(display = "Headers Not Linked")]
	NotLinked,
	/// A node the chain structure requires is missing from the store
	#[fail(display = "Not Found: {}", _0)]
	NotFound(String),
	/// Internal issue when trying to save or load data from store
	#[fail(display = "Store Error: {}", _1)]
	StoreErr(store::Error, String),
	/// Anything else
	#[fail(display = "Other Error: {}", _0)]
	Other(String),
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.inner, f)
	}
}

impl Error {
	/// get kind
	pub fn kind(&self) -> ErrorKind {
		self.inner.get_context().clone()
	}
	/// get cause
	pub fn cause(&self) -> Option<&dyn Fail> {
		self.inner.cause()
	}
	/// get backtrace
	pub fn backtrace(&self) -> Option<&Backtrace> {
		self.inner.backtrace()
	}

	/// Whether the error is due to a header that was intrinsically wrong,
	/// as opposed to one we simply cannot place or store right now
	pub fn is_bad_data(&self) -> bool {
		match self.kind() {
			ErrorKind::ParentUnknown
			| ErrorKind::NotFound(_)
			| ErrorKind::StoreErr(_, _)
			| ErrorKind::Other(_) => false,
			_ => true,
		}
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Error {
		Error {
			inner: Context::new(kind),
		}
	}
}

impl From<Context<ErrorKind>> for Error {
	fn from(inner: Context<ErrorKind>) -> Error {
		Error { inner }
	}
}

impl From<store::Error> for Error {
	fn from(error: store::Error) -> Error {
		let ec = error.clone();
		Error {
			inner: error.context(ErrorKind::StoreErr(ec.clone(), format!("{}", ec))),
		}
	}
}
