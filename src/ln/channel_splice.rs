// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Splicing related utilities: the splice sub-state carried by a channel in `Normal`, and the
//! balance bookkeeping a splice or RBF attempt implies.

use bitcoin::hash_types::Txid;

use crate::ln::interactivetxs::{
	ConstructedTransaction, InteractiveTxConstructor, InteractiveTxSigningSession,
};
use crate::ln::msgs;

/// The splice sub-state a channel in `Normal` carries.
pub enum SpliceStatus {
	/// No splice is in progress.
	None,
	/// We sent `stfu` (and possibly `splice_init`) and are waiting for the channel to quiesce.
	Requested(PendingSplice),
	/// The interactive construction of the splice transaction is running.
	InProgress {
		/// The splice parameters.
		pending: PendingSplice,
		/// The in-flight negotiation.
		constructor: InteractiveTxConstructor,
	},
	/// Construction concluded; commitment signatures and `tx_signatures` are being exchanged.
	/// This state survives disconnection and resumes deterministically.
	WaitingForSigs {
		/// The splice parameters.
		pending: PendingSplice,
		/// The concluded transaction and signature tracking.
		session: InteractiveTxSigningSession,
	},
}

impl SpliceStatus {
	/// Whether any splice negotiation or signing is currently in flight.
	pub fn is_active(&self) -> bool {
		!matches!(self, SpliceStatus::None)
	}

	/// The txid of the splice transaction being signed, if one has been negotiated.
	pub fn pending_funding_txid(&self) -> Option<Txid> {
		match self {
			SpliceStatus::WaitingForSigs { session, .. } => Some(session.unsigned_tx.txid()),
			_ => None,
		}
	}
}

/// The parameters of a splice attempt, fixed by `splice_init`/`splice_ack`.
#[derive(Clone, Debug)]
pub struct PendingSplice {
	/// Whether we initiated the splice.
	pub we_initiated: bool,
	/// Our declared capacity contribution (negative for splice-out), in satoshis.
	pub our_contribution_satoshis: i64,
	/// The peer's declared contribution, in satoshis.
	pub their_contribution_satoshis: i64,
	/// The feerate of the splice transaction.
	pub funding_feerate_per_kw: u32,
	/// The locktime of the splice transaction.
	pub locktime: u32,
	/// The funding index the new commitment will use: one greater than the index being spliced.
	pub funding_tx_index: u64,
	/// The fee owed to the peer for a liquidity purchase, deducted from our balance.
	pub liquidity_fee_msat: Option<u64>,
	/// The liquidity purchase we requested, if any; RBF attempts must carry it again.
	pub request_funding: Option<msgs::RequestFunding>,
}

impl PendingSplice {
	/// Add a u64 and an i64, saturating at the ends (doing without a cast to i64).
	pub(crate) fn add_checked(pre_value: u64, relative: i64) -> u64 {
		if relative >= 0 {
			pre_value.saturating_add(relative as u64)
		} else {
			pre_value.saturating_sub(relative.unsigned_abs())
		}
	}

	/// The post-splice capacity given the pre-splice capacity.
	pub fn post_capacity_satoshis(&self, pre_capacity_satoshis: u64) -> u64 {
		Self::add_checked(
			Self::add_checked(pre_capacity_satoshis, self.our_contribution_satoshis),
			self.their_contribution_satoshis,
		)
	}

	/// The balances of the new commitment: each side's previous balance plus its contribution,
	/// with any liquidity fee moved from the initiator's balance to the funder's.
	pub fn post_balances_msat(
		&self, pre_to_local_msat: u64, pre_to_remote_msat: u64,
	) -> (u64, u64) {
		let mut to_local =
			Self::add_checked(pre_to_local_msat, self.our_contribution_satoshis * 1000);
		let mut to_remote =
			Self::add_checked(pre_to_remote_msat, self.their_contribution_satoshis * 1000);
		if let Some(fee_msat) = self.liquidity_fee_msat {
			if self.we_initiated {
				to_local = to_local.saturating_sub(fee_msat);
				to_remote = to_remote.saturating_add(fee_msat);
			} else {
				to_local = to_local.saturating_add(fee_msat);
				to_remote = to_remote.saturating_sub(fee_msat);
			}
		}
		(to_local, to_remote)
	}

	/// Checks that a concluded construction matches what was negotiated in
	/// `splice_init`/`splice_ack`.
	pub fn matches_constructed(&self, constructed: &ConstructedTransaction) -> bool {
		constructed.holder_contribution_satoshis == self.our_contribution_satoshis
			&& constructed.counterparty_contribution_satoshis == self.their_contribution_satoshis
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pending(ours: i64, theirs: i64, liquidity_fee_msat: Option<u64>) -> PendingSplice {
		PendingSplice {
			we_initiated: true,
			our_contribution_satoshis: ours,
			their_contribution_satoshis: theirs,
			funding_feerate_per_kw: 1000,
			locktime: 0,
			funding_tx_index: 1,
			liquidity_fee_msat,
			request_funding: None,
		}
	}

	#[test]
	fn test_post_capacity() {
		assert_eq!(pending(500_000, 0, None).post_capacity_satoshis(1_500_000), 2_000_000);
		assert_eq!(pending(-400_000, 0, None).post_capacity_satoshis(1_500_000), 1_100_000);
		assert_eq!(pending(-400_000, 100_000, None).post_capacity_satoshis(1_500_000), 1_200_000);
		// saturation rather than wrap on absurd values
		assert_eq!(pending(-2_000_000, 0, None).post_capacity_satoshis(1_500_000), 0);
	}

	#[test]
	fn test_post_balances() {
		// 1.5M sat capacity, 500k splice-in by us.
		let (to_local, to_remote) =
			pending(500_000, 0, None).post_balances_msat(800_000_000, 700_000_000);
		assert_eq!(to_local, 1_300_000_000);
		assert_eq!(to_remote, 700_000_000);

		// A liquidity purchase moves the fee from our balance to theirs
		let (to_local, to_remote) =
			pending(0, 500_000, Some(1_100_000)).post_balances_msat(800_000_000, 700_000_000);
		assert_eq!(to_local, 800_000_000 - 1_100_000);
		assert_eq!(to_remote, 700_000_000 + 500_000_000 + 1_100_000);
	}
}
