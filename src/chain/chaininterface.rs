// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits which allow the channel engine to interact with its external collaborators: the fee
//! estimator, the transaction publisher, and the chain watcher. All of these are implemented
//! outside this crate; the engine only ever holds opaque handles to them.

use bitcoin::hash_types::Txid;
use bitcoin::transaction::{OutPoint as BitcoinOutPoint, Transaction};

/// The priority with which a fee-bumpable transaction should confirm, when no hard block-height
/// deadline applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
	/// We are happy with this transaction confirming slowly when feerates drop some.
	Slow,
	/// We'd like this transaction to confirm without major delay, but 12-18 blocks is fine.
	Medium,
	/// We'd like this transaction to confirm in the next few blocks.
	Fast,
}

/// The target under which the publisher escalates fees for a replaceable transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfirmationTarget {
	/// The transaction must confirm before the given block height - typically an HTLC's CLTV
	/// expiry. The publisher escalates fees as the deadline approaches.
	Absolute(u32),
	/// No hard deadline; confirm with the given priority.
	Priority(Priority),
}

/// A trait which should be implemented to provide feerate information on a number of time
/// horizons.
///
/// Note that all of the functions implemented here *must* be reentrant-safe - they're called
/// from inside the library in response to chain events, P2P events, or timer events.
pub trait FeeEstimator {
	/// Gets estimated satoshis of fee required per 1000 Weight-Units.
	///
	/// Must return a value no smaller than 253 (ie 1 satoshi-per-vbyte rounded up to ensure
	/// later round-downs don't put us below 1 satoshi-per-vbyte).
	fn get_est_sat_per_1000_weight(&self, priority: Priority) -> u32;
}

/// Minimum feerate that takes a sane approach to bitcoind weight-to-vbytes rounding.
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

/// Minimum relay fee as required by bitcoin network mempool policy.
pub const MIN_RELAY_FEE_SAT_PER_1000_WEIGHT: u64 = 4000;

/// An interface to send channel transactions to the Bitcoin network.
///
/// The implementation promises at-least-once publication, RBF-bumping replaceable transactions
/// until either confirmation or explicit cancellation.
pub trait TransactionPublisher {
	/// Publishes a fully-signed transaction which must not be altered.
	fn publish_final_tx(&self, tx: &Transaction);

	/// Publishes a transaction whose fee the publisher may escalate (by RBF or CPFP, depending
	/// on what the transaction structure admits) to meet `target`.
	fn publish_replaceable_tx(&self, tx: &Transaction, target: ConfirmationTarget);
}

/// An interface to register interest in on-chain events with an external chain watcher.
///
/// The watcher allows multiple subscribers per transaction; registrations are idempotent.
pub trait ChainWatcher {
	/// Watch for the channel funding transaction reaching its required confirmation depth.
	fn watch_funding_confirmed(&self, txid: Txid, script_pubkey: bitcoin::ScriptBuf);

	/// Watch for any transaction spending the funding output. `alternative_commit_txids` lists
	/// the other commitment transactions which may validly spend it while a splice is pending.
	fn watch_funding_spent(&self, outpoint: BitcoinOutPoint, alternative_commit_txids: Vec<Txid>);

	/// Watch for any transaction spending the given output (eg a commitment output we published).
	fn watch_output_spent(&self, outpoint: BitcoinOutPoint);

	/// Watch for the given transaction confirming.
	fn watch_tx_confirmed(&self, txid: Txid);

	/// Watch for an alternative commitment transaction (a sibling from a pending splice or RBF)
	/// confirming, which obsoletes the others.
	fn watch_alternative_commit_tx_confirmed(&self, txid: Txid);

	/// Cancel a previously-registered confirmation watch, eg for a sibling commitment which can
	/// no longer confirm.
	fn unwatch_tx(&self, txid: Txid);
}

/// An event produced by the chain watcher back into the channel engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
	/// A watched funding transaction reached its confirmation depth.
	FundingConfirmed {
		/// The confirmed funding txid.
		txid: Txid,
		/// The height at which it confirmed.
		height: u32,
	},
	/// A watched funding output was spent.
	FundingSpent {
		/// The transaction spending the funding output.
		spending_tx: Transaction,
		/// The height at which the spend confirmed.
		height: u32,
	},
	/// A watched (non-funding) output was spent.
	OutputSpent {
		/// The outpoint which was spent.
		outpoint: BitcoinOutPoint,
		/// The transaction spending it.
		spending_tx: Transaction,
		/// The height at which the spend confirmed.
		height: u32,
	},
	/// A watched transaction confirmed.
	TxConfirmed {
		/// The confirmed txid.
		txid: Txid,
		/// The height at which it confirmed.
		height: u32,
	},
	/// An alternative commitment transaction confirmed, obsoleting its siblings.
	AlternativeCommitTxConfirmed {
		/// The confirmed commitment txid.
		txid: Txid,
		/// The height at which it confirmed.
		height: u32,
	},
}
