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

//! The wallet capability the coordinator delivers into. Transactions of a
//! Merkle block always precede the block's own action, and Merkle actions
//! arrive in strictly ascending best-chain order.

use keel_chain::ChainAction;
use keel_core::core::hash::Hash;
use keel_core::core::transaction::Transaction;

/// Consumer of everything the node extracts from the network on the
/// wallet's behalf.
pub trait WalletSink {
	/// A batch of transactions relevant to the wallet filter.
	fn import_txs(&mut self, txs: Vec<Transaction>);

	/// A Merkle block took effect on the chain; `expected` lists the
	/// transaction ids the block proved to match the filter.
	fn import_merkle(&mut self, action: ChainAction, expected: Vec<Hash>);
}

/// A sink that only logs, for running the node without a wallet attached.
#[derive(Default)]
pub struct NullWallet;

impl WalletSink for NullWallet {
	fn import_txs(&mut self, txs: Vec<Transaction>) {
		debug!("wallet: discarding {} txs", txs.len());
	}

	fn import_merkle(&mut self, action: ChainAction, expected: Vec<Hash>) {
		debug!(
			"wallet: discarding {} merkle action with {} matches",
			action.name(),
			expected.len()
		);
	}
}
