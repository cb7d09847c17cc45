// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The on-chain reaction engine: given whichever transaction ends up spending a channel's
//! funding output (ours, the counterparty's current, a revoked one, or one from beyond our
//! state), selects and finalizes the claim and penalty transactions which recover our funds,
//! before each HTLC's timelock expires.
//!
//! While a splice is pending several commitment transactions may validly spend their funding
//! outputs; the reactor watches all of them and, when one confirms, cancels the watches on its
//! siblings and switches its chosen output set - a second-stage transaction built against the
//! wrong commitment is unusable.

use bitcoin::hash_types::Txid;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::{OutPoint as BitcoinOutPoint, Transaction};

use crate::chain::chaininterface::{ConfirmationTarget, FeeEstimator, Priority};
use crate::chain::package::{
	build_claim_anchor, build_claim_remote_main, CounterpartyHTLCOutput, DelayedPaymentOutput,
	PackageSolvingData, PackageTemplate, RevokedHTLCOutput, RevokedOutput,
};
use crate::chain::transaction::MaybeSignedTransaction;
use crate::ln::chan_utils::{
	decode_commitment_number, get_revokeable_redeemscript, CommitmentFormat,
	HTLCOutputInCommitment, TxCreationKeys,
};
use crate::ln::commitments::{ChannelParams, CommitmentSet, INITIAL_COMMITMENT_NUMBER};
use crate::ln::types::{PaymentHash, PaymentPreimage};
use crate::sign::InMemorySigner;
use crate::util::logger::Logger;

use core::ops::Deref;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The classification of an observed funding spend, driving which claims we construct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingSpendClassification {
	/// Our own latest commitment (broadcast by us or replayed by someone).
	HolderCommitment {
		/// The commitment number recovered from the transaction.
		commitment_number: u64,
	},
	/// The counterparty's current commitment.
	CounterpartyCurrent {
		/// The commitment number recovered from the transaction.
		commitment_number: u64,
	},
	/// The counterparty's next commitment: signed by us, its predecessor not yet revoked.
	CounterpartyNext {
		/// The commitment number recovered from the transaction.
		commitment_number: u64,
	},
	/// A commitment the counterparty has revoked. We hold the secret; everything is claimable.
	CounterpartyRevoked {
		/// The commitment number recovered from the transaction.
		commitment_number: u64,
		/// The revealed per-commitment secret for that number.
		per_commitment_secret: SecretKey,
	},
	/// A commitment from beyond our recorded state: we have lost data. Only passive recovery
	/// of our main output (using the point the peer last sent via `channel_reestablish`) is
	/// possible.
	CounterpartyFuture,
	/// Not commitment-shaped at all (eg the mutual close, or a splice funding confirming).
	Unknown,
}

/// Everything the reactor wants done in response to an event: claims to hand to the publisher,
/// outputs to start watching, and watches to cancel.
#[derive(Default)]
pub struct Reaction {
	/// Fee-bumpable claim packages, each with its confirmation target.
	pub packages: Vec<(PackageTemplate, ConfirmationTarget)>,
	/// Fully-signed, non-malleable transactions to publish as-is (second-stage HTLC
	/// transactions, anchor spends).
	pub publish: Vec<(MaybeSignedTransaction, ConfirmationTarget)>,
	/// Outputs whose spends we must now watch (for third-stage reactions).
	pub watch_outputs: Vec<BitcoinOutPoint>,
	/// Transactions whose confirmation watches are obsolete (splice/RBF siblings).
	pub cancel_watches: Vec<Txid>,
}

/// A record of one counterparty commitment we have signed, kept so that its broadcast can be
/// recognized and punished (after revocation) arbitrarily far in the future.
#[derive(Clone, Debug)]
struct CounterpartyCommitmentRecord {
	commitment_number: u64,
	per_commitment_point: PublicKey,
	// Directed relative to the counterparty as broadcaster.
	htlcs: Vec<HTLCOutputInCommitment>,
}

/// Monitors a channel's on-chain footprint and reacts to force-closes.
///
/// The monitor holds everything needed to act even if the rest of the node has moved on: the
/// channel parameters, the secret chain, every counterparty commitment's HTLC set, and the
/// preimages we know.
pub struct ChannelMonitor {
	params: ChannelParams,
	signer: InMemorySigner,
	secp_ctx: Secp256k1<All>,
	format: CommitmentFormat,
	obscure_factor: u64,
	destination_script: ScriptBuf,
	/// Prices every claim we construct; one-shot claims take their feerate from here, while
	/// [`PackageTemplate`]s additionally re-consult it on each bump.
	fee_estimator: Arc<dyn FeeEstimator>,
	/// The funding txids (with their capacities) which may currently confirm; more than one
	/// while a splice or RBF is pending.
	active_funding_txids: Vec<Txid>,
	/// Our own commitment txid per active funding.
	holder_commitment_txids: HashSet<Txid>,
	/// The txid of the counterparty's current commitment(s).
	current_counterparty_txids: HashSet<Txid>,
	/// The txid of counterparty commitments we signed whose predecessor is not yet revoked.
	next_counterparty_txids: HashSet<Txid>,
	/// Every counterparty commitment ever signed, by txid.
	counterparty_commitments: HashMap<Txid, CounterpartyCommitmentRecord>,
	/// All revealed revocation secrets.
	secrets: crate::ln::chan_utils::CounterpartyCommitmentSecrets,
	/// The preimages we have learned, required for HTLC-success claims.
	preimages: HashMap<PaymentHash, PaymentPreimage>,
	/// The point the peer last proved via `option_data_loss_protect`, our only handle on a
	/// future commitment.
	counterparty_claimable_point: Option<PublicKey>,
	/// Commitment outputs we published claims against, watched for counterparty second-stage
	/// transactions (txid of revoked commitment, output index, htlc).
	watched_revoked_outputs: HashMap<BitcoinOutPoint, (SecretKey, HTLCOutputInCommitment)>,
	/// Funding txids already confirmed; claims against their siblings are skipped.
	confirmed_funding: Option<Txid>,
}

impl ChannelMonitor {
	/// Builds a monitor snapshot from the current commitment set.
	pub fn from_commitments(
		commitments: &CommitmentSet, signer: InMemorySigner, destination_script: ScriptBuf,
		fee_estimator: Arc<dyn FeeEstimator>,
	) -> Self {
		let secp_ctx = Secp256k1::new();
		let params = commitments.params.clone();
		let (opener, acceptor) = if params.is_outbound_from_holder {
			(&params.holder.pubkeys, &params.counterparty.pubkeys)
		} else {
			(&params.counterparty.pubkeys, &params.holder.pubkeys)
		};
		let obscure_factor = crate::ln::chan_utils::get_commitment_transaction_number_obscure_factor(
			&opener.payment_basepoint,
			&acceptor.payment_basepoint,
		);

		let mut monitor = ChannelMonitor {
			format: params.commitment_format,
			params,
			signer,
			secp_ctx,
			obscure_factor,
			destination_script,
			fee_estimator,
			active_funding_txids: Vec::new(),
			holder_commitment_txids: HashSet::new(),
			current_counterparty_txids: HashSet::new(),
			next_counterparty_txids: HashSet::new(),
			counterparty_commitments: HashMap::new(),
			secrets: commitments.remote_per_commitment_secrets.clone(),
			preimages: HashMap::new(),
			counterparty_claimable_point: None,
			watched_revoked_outputs: HashMap::new(),
			confirmed_funding: None,
		};
		for commitment in commitments.active.iter() {
			monitor.active_funding_txids.push(commitment.funding_outpoint.txid);
			monitor.holder_commitment_txids.insert(commitment.local_commit.commit_tx.txid());
			monitor.current_counterparty_txids.insert(commitment.remote_commit.txid);
			monitor.record_counterparty_commitment(
				commitment.remote_commit.txid,
				INITIAL_COMMITMENT_NUMBER - commitment.remote_commit.index,
				commitment.remote_commit.remote_per_commitment_point,
				commitment
					.remote_commit
					.spec
					.htlcs
					.iter()
					.map(|h| HTLCOutputInCommitment {
						// Offered relative to the counterparty as broadcaster.
						offered: h.incoming,
						amount_msat: h.add.amount_msat,
						cltv_expiry: h.add.cltv_expiry,
						payment_hash: h.add.payment_hash,
						transaction_output_index: None,
					})
					.collect(),
			);
			if let Some(next) = &commitment.next_remote_commit {
				monitor.next_counterparty_txids.insert(next.txid);
			}
		}
		monitor
	}

	/// Records a counterparty commitment we have just signed.
	pub fn record_counterparty_commitment(
		&mut self, txid: Txid, commitment_number: u64, per_commitment_point: PublicKey,
		htlcs: Vec<HTLCOutputInCommitment>,
	) {
		self.counterparty_commitments.insert(
			txid,
			CounterpartyCommitmentRecord { commitment_number, per_commitment_point, htlcs },
		);
	}

	/// Provides a payment preimage required for an HTLC-success claim.
	pub fn provide_payment_preimage(&mut self, preimage: PaymentPreimage) {
		self.preimages.insert(preimage.payment_hash(), preimage);
	}

	/// Provides the counterparty's current per-commitment point from
	/// `channel_reestablish`'s data-loss protection, our last resort against a future
	/// commitment.
	pub fn provide_data_loss_protect_point(&mut self, point: PublicKey) {
		self.counterparty_claimable_point = Some(point);
	}

	/// Classifies an observed spend of a funding output.
	pub fn classify_funding_spend(&self, tx: &Transaction) -> FundingSpendClassification {
		let commitment_number = match decode_commitment_number(tx, self.obscure_factor) {
			Some(n) => n,
			None => return FundingSpendClassification::Unknown,
		};
		let txid = tx.compute_txid();
		if self.holder_commitment_txids.contains(&txid) {
			return FundingSpendClassification::HolderCommitment { commitment_number };
		}
		if self.current_counterparty_txids.contains(&txid) {
			return FundingSpendClassification::CounterpartyCurrent { commitment_number };
		}
		if self.next_counterparty_txids.contains(&txid) {
			return FundingSpendClassification::CounterpartyNext { commitment_number };
		}
		if let Some(secret) = self.secrets.get_secret(commitment_number) {
			let per_commitment_secret =
				SecretKey::from_slice(&secret).expect("stored secrets are valid keys");
			return FundingSpendClassification::CounterpartyRevoked {
				commitment_number,
				per_commitment_secret,
			};
		}
		// A commitment newer than anything we know: data loss on our side.
		FundingSpendClassification::CounterpartyFuture
	}

	fn counterparty_tx_keys(&self, per_commitment_point: &PublicKey) -> TxCreationKeys {
		TxCreationKeys::derive_new(
			&self.secp_ctx,
			per_commitment_point,
			&self.params.counterparty.pubkeys.delayed_payment_basepoint,
			&self.params.counterparty.pubkeys.htlc_basepoint,
			&self.params.holder.pubkeys.revocation_basepoint,
			&self.params.holder.pubkeys.htlc_basepoint,
		)
	}

	/// Reacts to a confirmed spend of a funding output.
	pub fn on_funding_spent<L: Deref>(
		&mut self, spending_tx: &Transaction, height: u32, logger: &L,
	) -> Reaction
	where
		L::Target: Logger,
	{
		let mut reaction = Reaction::default();
		let spent_funding = spending_tx.input[0].previous_output.txid;
		if let Some(confirmed) = self.confirmed_funding {
			if spent_funding != confirmed {
				// A sibling from a splice already lost the race; nothing it spends matters.
				return reaction;
			}
		}
		let classification = self.classify_funding_spend(spending_tx);
		log_info!(
			logger,
			"Funding spend {} classified as {:?}",
			spending_tx.compute_txid(),
			classification
		);
		match classification {
			FundingSpendClassification::HolderCommitment { commitment_number } => {
				self.react_to_holder_commitment(spending_tx, commitment_number, height, &mut reaction);
			},
			FundingSpendClassification::CounterpartyCurrent { .. }
			| FundingSpendClassification::CounterpartyNext { .. } => {
				self.react_to_counterparty_commitment(spending_tx, height, &mut reaction);
			},
			FundingSpendClassification::CounterpartyRevoked { per_commitment_secret, .. } => {
				self.react_to_revoked_commitment(
					spending_tx,
					per_commitment_secret,
					height,
					&mut reaction,
				);
			},
			FundingSpendClassification::CounterpartyFuture => {
				self.react_to_future_commitment(spending_tx, height, &mut reaction);
			},
			FundingSpendClassification::Unknown => {},
		}
		reaction
	}

	fn react_to_holder_commitment(
		&mut self, commitment_tx: &Transaction, commitment_number: u64, height: u32,
		reaction: &mut Reaction,
	) {
		let per_commitment_point =
			self.signer.get_per_commitment_point(commitment_number, &self.secp_ctx);
		let keys = TxCreationKeys::derive_new(
			&self.secp_ctx,
			&per_commitment_point,
			&self.params.holder.pubkeys.delayed_payment_basepoint,
			&self.params.holder.pubkeys.htlc_basepoint,
			&self.params.counterparty.pubkeys.revocation_basepoint,
			&self.params.counterparty.pubkeys.htlc_basepoint,
		);
		let contest_delay = self.params.counterparty.to_self_delay;
		let txid = commitment_tx.compute_txid();

		// Our anchor, for CPFP-bumping the commitment itself.
		if self.format.has_anchors() {
			if let Ok(anchor_tx) = build_claim_anchor(
				commitment_tx,
				&self.params.holder.pubkeys.funding_pubkey,
				&self.signer,
				&self.secp_ctx,
			) {
				reaction
					.publish
					.push((anchor_tx, ConfirmationTarget::Priority(Priority::Fast)));
			}
		}

		// Our main balance, claimable after the CSV delay.
		let to_local_script =
			get_revokeable_redeemscript(&keys.revocation_key, contest_delay, &keys.broadcaster_delayed_payment_key)
				.to_p2wsh();
		for (vout, out) in commitment_tx.output.iter().enumerate() {
			if out.script_pubkey == to_local_script {
				reaction.packages.push((
					PackageTemplate::build_package(
						txid,
						vout as u32,
						PackageSolvingData::DelayedPaymentOutput(DelayedPaymentOutput {
							keys: keys.clone(),
							contest_delay,
							amount_sat: out.value.to_sat(),
						}),
						None,
						height,
					),
					ConfirmationTarget::Priority(Priority::Medium),
				));
			}
		}
		// Second-stage transactions per non-dust HTLC; their outputs get a third-stage watch.
		// The signed transactions themselves are produced by the channel from its stored
		// counterparty signatures; the reactor only needs to watch for them here. We register
		// interest in every HTLC-shaped output.
		for (vout, _out) in commitment_tx.output.iter().enumerate() {
			let outpoint = BitcoinOutPoint { txid, vout: vout as u32 };
			if commitment_tx.output[vout].script_pubkey != to_local_script {
				reaction.watch_outputs.push(outpoint);
			}
		}
	}

	fn react_to_counterparty_commitment(
		&mut self, commitment_tx: &Transaction, height: u32, reaction: &mut Reaction,
	) {
		let txid = commitment_tx.compute_txid();
		let record = match self.counterparty_commitments.get(&txid) {
			Some(record) => record.clone(),
			None => return,
		};
		let keys = self.counterparty_tx_keys(&record.per_commitment_point);

		// Our main output is immediately claimable (modulo CSV(1) under anchor formats). This
		// claim is published as-is, so it takes its final feerate from the estimator here.
		if let Ok(claim) = build_claim_remote_main(
			commitment_tx,
			&self.params.holder.pubkeys.payment_basepoint.to_public_key(),
			self.format,
			self.fee_estimator.get_est_sat_per_1000_weight(Priority::Medium),
			self.params.holder.dust_limit_satoshis,
			self.destination_script.clone(),
			&self.signer,
			&self.secp_ctx,
		) {
			reaction.publish.push((claim, ConfirmationTarget::Priority(Priority::Medium)));
		}

		// Each HTLC is claimed directly (no second-stage delay on their commitment): with the
		// preimage for HTLCs they offered us, after expiry for HTLCs we offered them. An
		// HTLC-success claim without a known preimage is skipped outright.
		let script_to_index: HashMap<ScriptBuf, u32> = commitment_tx
			.output
			.iter()
			.enumerate()
			.map(|(idx, out)| (out.script_pubkey.clone(), idx as u32))
			.collect();
		for htlc in record.htlcs.iter() {
			let witness_script = crate::ln::chan_utils::get_htlc_redeemscript(
				htlc,
				self.format,
				&keys,
			);
			let vout = match script_to_index.get(&witness_script.to_p2wsh()) {
				Some(vout) => *vout,
				None => continue, // trimmed
			};
			let preimage = if htlc.offered {
				// They offered it to us: claimable only with the preimage.
				match self.preimages.get(&htlc.payment_hash) {
					Some(preimage) => Some(*preimage),
					None => continue,
				}
			} else {
				None
			};
			reaction.packages.push((
				PackageTemplate::build_package(
					txid,
					vout,
					PackageSolvingData::CounterpartyHTLCOutput(CounterpartyHTLCOutput {
						keys: keys.clone(),
						preimage,
						htlc: htlc.clone(),
					}),
					Some(htlc.cltv_expiry),
					height,
				),
				ConfirmationTarget::Absolute(htlc.cltv_expiry),
			));
		}

		if self.format.has_anchors() {
			if let Ok(anchor_tx) = build_claim_anchor(
				commitment_tx,
				&self.params.holder.pubkeys.funding_pubkey,
				&self.signer,
				&self.secp_ctx,
			) {
				reaction.publish.push((
					anchor_tx,
					ConfirmationTarget::Priority(Priority::Fast),
				));
			}
		}
	}

	fn react_to_revoked_commitment(
		&mut self, commitment_tx: &Transaction, per_commitment_secret: SecretKey, height: u32,
		reaction: &mut Reaction,
	) {
		let txid = commitment_tx.compute_txid();
		let per_commitment_point =
			PublicKey::from_secret_key(&self.secp_ctx, &per_commitment_secret);
		let keys = self.counterparty_tx_keys(&per_commitment_point);
		let contest_delay = self.params.holder.to_self_delay;

		// Their (revoked) to_local output: punishable immediately via the revocation key.
		let to_local_script = get_revokeable_redeemscript(
			&keys.revocation_key,
			contest_delay,
			&keys.broadcaster_delayed_payment_key,
		)
		.to_p2wsh();
		// The deadline for every penalty is the revoked output's own CSV expiry; after that the
		// cheater can race us.
		let deadline = height + contest_delay as u32;
		for (vout, out) in commitment_tx.output.iter().enumerate() {
			if out.script_pubkey == to_local_script {
				reaction.packages.push((
					PackageTemplate::build_package(
						txid,
						vout as u32,
						PackageSolvingData::RevokedOutput(RevokedOutput {
							per_commitment_point,
							per_commitment_key: per_commitment_secret,
							revocation_key: keys.revocation_key.clone(),
							delayed_payment_key: keys.broadcaster_delayed_payment_key.clone(),
							on_counterparty_tx_csv: contest_delay,
							amount_sat: out.value.to_sat(),
						}),
						Some(deadline),
						height,
					),
					ConfirmationTarget::Absolute(deadline),
				));
			}
		}

		// Every HTLC output on the revoked commitment is also punishable; its second-stage
		// spend (if the cheater is fast) will be punished in turn when observed.
		if let Some(record) = self.counterparty_commitments.get(&txid).cloned() {
			let script_to_index: HashMap<ScriptBuf, u32> = commitment_tx
				.output
				.iter()
				.enumerate()
				.map(|(idx, out)| (out.script_pubkey.clone(), idx as u32))
				.collect();
			for htlc in record.htlcs.iter() {
				let witness_script =
					crate::ln::chan_utils::get_htlc_redeemscript(htlc, self.format, &keys);
				let vout = match script_to_index.get(&witness_script.to_p2wsh()) {
					Some(vout) => *vout,
					None => continue,
				};
				let outpoint = BitcoinOutPoint { txid, vout };
				reaction.packages.push((
					PackageTemplate::build_package(
						txid,
						vout,
						PackageSolvingData::RevokedHTLCOutput(RevokedHTLCOutput {
							per_commitment_point,
							per_commitment_key: per_commitment_secret,
							keys: keys.clone(),
							htlc: htlc.clone(),
						}),
						Some(deadline),
						height,
					),
					ConfirmationTarget::Absolute(deadline),
				));
				self.watched_revoked_outputs
					.insert(outpoint, (per_commitment_secret, htlc.clone()));
				reaction.watch_outputs.push(outpoint);
			}
		}

		// Also sweep our own main output.
		if let Ok(claim) = build_claim_remote_main(
			commitment_tx,
			&self.params.holder.pubkeys.payment_basepoint.to_public_key(),
			self.format,
			self.fee_estimator.get_est_sat_per_1000_weight(Priority::Medium),
			self.params.holder.dust_limit_satoshis,
			self.destination_script.clone(),
			&self.signer,
			&self.secp_ctx,
		) {
			reaction.publish.push((claim, ConfirmationTarget::Priority(Priority::Medium)));
		}
	}

	fn react_to_future_commitment(
		&mut self, commitment_tx: &Transaction, _height: u32, reaction: &mut Reaction,
	) {
		// Passive recovery: without the secret chain entry we cannot punish, and without the
		// commitment record we cannot claim HTLCs. The best we can do is sweep our main output
		// using the point the peer disclosed via data-loss protection.
		if self.counterparty_claimable_point.is_none() {
			return;
		}
		if let Ok(claim) = build_claim_remote_main(
			commitment_tx,
			&self.params.holder.pubkeys.payment_basepoint.to_public_key(),
			self.format,
			self.fee_estimator.get_est_sat_per_1000_weight(Priority::Fast),
			self.params.holder.dust_limit_satoshis,
			self.destination_script.clone(),
			&self.signer,
			&self.secp_ctx,
		) {
			reaction.publish.push((claim, ConfirmationTarget::Priority(Priority::Fast)));
		}
	}

	/// Reacts to a spend of a watched (revoked) commitment output: if the cheater confirmed a
	/// second-stage HTLC transaction, its output is punishable for another `to_self_delay`
	/// blocks.
	pub fn on_watched_output_spent(
		&mut self, outpoint: BitcoinOutPoint, spending_tx: &Transaction, height: u32,
	) -> Reaction {
		let mut reaction = Reaction::default();
		let (per_commitment_secret, _htlc) = match self.watched_revoked_outputs.get(&outpoint) {
			Some(entry) => entry.clone(),
			None => return reaction,
		};
		let spender_txid = spending_tx.compute_txid();
		// Our own penalty confirming also spends this outpoint; only a counterparty
		// second-stage transaction (paying back to their delayed script) needs a follow-up.
		let per_commitment_point =
			PublicKey::from_secret_key(&self.secp_ctx, &per_commitment_secret);
		let keys = self.counterparty_tx_keys(&per_commitment_point);
		let contest_delay = self.params.holder.to_self_delay;
		let second_stage_script = get_revokeable_redeemscript(
			&keys.revocation_key,
			contest_delay,
			&keys.broadcaster_delayed_payment_key,
		)
		.to_p2wsh();
		for (vout, out) in spending_tx.output.iter().enumerate() {
			if out.script_pubkey == second_stage_script {
				let deadline = height + contest_delay as u32;
				reaction.packages.push((
					PackageTemplate::build_package(
						spender_txid,
						vout as u32,
						PackageSolvingData::RevokedOutput(RevokedOutput {
							per_commitment_point,
							per_commitment_key: per_commitment_secret,
							revocation_key: keys.revocation_key.clone(),
							delayed_payment_key: keys.broadcaster_delayed_payment_key.clone(),
							on_counterparty_tx_csv: contest_delay,
							amount_sat: out.value.to_sat(),
						}),
						Some(deadline),
						height,
					),
					ConfirmationTarget::Absolute(deadline),
				));
			}
		}
		reaction
	}

	/// Reacts to one of the alternative (splice/RBF sibling) commitment transactions
	/// confirming: all sibling watches are cancelled and the reactor's chosen output set
	/// switches to the confirmed transaction's.
	pub fn on_alternative_funding_confirmed(&mut self, txid: Txid) -> Reaction {
		let mut reaction = Reaction::default();
		self.confirmed_funding = Some(txid);
		for sibling in self.active_funding_txids.iter() {
			if *sibling != txid {
				reaction.cancel_watches.push(*sibling);
			}
		}
		self.active_funding_txids.retain(|t| *t == txid);
		reaction
	}

	/// The funding txids the reactor currently watches.
	pub fn watched_funding_txids(&self) -> &[Txid] {
		&self.active_funding_txids
	}

	/// Whether an HTLC-success claim can be published: only with a known preimage.
	pub fn can_claim_htlc(&self, payment_hash: &PaymentHash) -> bool {
		self.preimages.contains_key(payment_hash)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::commitments::build_commitment_transaction;
	use crate::util::test_utils::{self, TestFeeEstimator, TestLogger};
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::Secp256k1;
	use std::sync::Arc;

	struct Harness {
		monitor: ChannelMonitor,
		remote_signer: InMemorySigner,
		set: CommitmentSet,
		logger: Arc<TestLogger>,
	}

	fn harness() -> Harness {
		let secp_ctx = Secp256k1::new();
		let (set_a, signer_a, _set_b, signer_b) =
			test_utils::linked_commitment_sets(&secp_ctx, 1_000_000, 600_000_000, 400_000_000);
		let dest = ScriptBuf::from(vec![0x00, 0x14, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d, 0x0d]);
		let monitor = ChannelMonitor::from_commitments(
			&set_a,
			signer_a,
			dest,
			Arc::new(TestFeeEstimator::new(2000)),
		);
		Harness {
			monitor,
			remote_signer: signer_b,
			set: set_a,
			logger: Arc::new(TestLogger::new()),
		}
	}

	/// Builds the counterparty's commitment transaction at `index` (as they would broadcast
	/// it), with the given HTLC set applied to the base spec.
	fn counterparty_commitment_at(
		h: &Harness, index: u64, htlcs: Vec<crate::ln::commitments::DirectedHtlc>,
	) -> (Transaction, Vec<HTLCOutputInCommitment>, PublicKey) {
		let secp_ctx = Secp256k1::new();
		let commitment = &h.set.active[0];
		let mut spec = commitment.remote_commit.spec.clone();
		for htlc in htlcs.iter() {
			if htlc.incoming {
				spec.to_remote_msat -= htlc.add.amount_msat;
			} else {
				spec.to_local_msat -= htlc.add.amount_msat;
			}
		}
		spec.htlcs = htlcs;
		let per_commitment_point = h.remote_signer.get_per_commitment_point(
			INITIAL_COMMITMENT_NUMBER - index,
			&secp_ctx,
		);
		let tx_params = commitment.transaction_parameters(&h.set.params);
		let (commit_tx, built_htlcs) = build_commitment_transaction(
			false,
			index,
			&spec,
			&per_commitment_point,
			&tx_params,
			&secp_ctx,
		);
		(commit_tx.built_transaction().transaction.clone(), built_htlcs, per_commitment_point)
	}

	fn incoming_htlc(
		amount_msat: u64, cltv: u32, id: u64, payment_hash: PaymentHash,
	) -> crate::ln::commitments::DirectedHtlc {
		let secp_ctx = Secp256k1::new();
		crate::ln::commitments::DirectedHtlc {
			incoming: true,
			add: crate::ln::msgs::UpdateAddHTLC {
				channel_id: crate::ln::types::ChannelId::from_bytes([9; 32]),
				htlc_id: id,
				amount_msat,
				payment_hash,
				cltv_expiry: cltv,
				onion_routing_packet: crate::ln::msgs::OnionPacket {
					version: 0,
					public_key: PublicKey::from_secret_key(
						&secp_ctx,
						&SecretKey::from_slice(&[42; 32]).unwrap(),
					),
					hop_data: [0; 1300],
					hmac: [0; 32],
				},
				blinding_point: None,
			},
		}
	}

	#[test]
	fn test_classification_of_each_broadcast() {
		let mut h = harness();

		// Our own commitment
		let our_commit =
			h.set.active[0].local_commit.commit_tx.built_transaction().transaction.clone();
		assert_eq!(
			h.monitor.classify_funding_spend(&our_commit),
			FundingSpendClassification::HolderCommitment {
				commitment_number: INITIAL_COMMITMENT_NUMBER
			}
		);

		// Their current commitment
		let (their_commit, _, _) = counterparty_commitment_at(&h, 0, vec![]);
		assert_eq!(
			h.monitor.classify_funding_spend(&their_commit),
			FundingSpendClassification::CounterpartyCurrent {
				commitment_number: INITIAL_COMMITMENT_NUMBER
			}
		);

		// A revoked commitment: simulate having received the secret for index 1.
		let secret_1 = h.remote_signer.release_commitment_secret(INITIAL_COMMITMENT_NUMBER - 1);
		h.monitor.secrets.provide_secret(INITIAL_COMMITMENT_NUMBER, {
			h.remote_signer.release_commitment_secret(INITIAL_COMMITMENT_NUMBER)
		}).unwrap();
		h.monitor.secrets.provide_secret(INITIAL_COMMITMENT_NUMBER - 1, secret_1).unwrap();
		let (revoked_commit, _, _) = counterparty_commitment_at(&h, 1, vec![]);
		match h.monitor.classify_funding_spend(&revoked_commit) {
			FundingSpendClassification::CounterpartyRevoked { commitment_number, .. } => {
				assert_eq!(commitment_number, INITIAL_COMMITMENT_NUMBER - 1);
			},
			other => panic!("misclassified revoked commitment: {:?}", other),
		}

		// A commitment from the future (index 7, nothing revealed near it)
		let (future_commit, _, _) = counterparty_commitment_at(&h, 7, vec![]);
		assert_eq!(
			h.monitor.classify_funding_spend(&future_commit),
			FundingSpendClassification::CounterpartyFuture
		);

		// Garbage (not commitment-encoded)
		let mut not_commitment = our_commit.clone();
		not_commitment.input[0].sequence = bitcoin::Sequence::MAX;
		assert_eq!(
			h.monitor.classify_funding_spend(&not_commitment),
			FundingSpendClassification::Unknown
		);
	}

	#[test]
	fn test_penalty_reaction_on_revoked_broadcast() {
		// The peer broadcasts a commitment revoked three indices ago carrying two HTLCs. We
		// must produce one main penalty and one penalty per HTLC, all above dust, and a
		// delayed penalty for any second-stage tx they confirm.
		let mut h = harness();
		let htlcs = vec![
			incoming_htlc(50_000_000, 800_100, 1, PaymentHash([1; 32])),
			incoming_htlc(60_000_000, 800_200, 2, PaymentHash([2; 32])),
		];
		let (revoked_commit, built_htlcs, point) = counterparty_commitment_at(&h, 1, htlcs);

		// Index 1 was signed (recorded) and then revoked; we are now at index 4.
		h.monitor.record_counterparty_commitment(
			revoked_commit.compute_txid(),
			INITIAL_COMMITMENT_NUMBER - 1,
			point,
			built_htlcs.clone(),
		);
		for idx in 0..4u64 {
			h.monitor
				.secrets
				.provide_secret(
					INITIAL_COMMITMENT_NUMBER - idx,
					h.remote_signer.release_commitment_secret(INITIAL_COMMITMENT_NUMBER - idx),
				)
				.unwrap();
		}

		let reaction = h.monitor.on_funding_spent(&revoked_commit, 800_000, &h.logger);
		// One main penalty plus two HTLC penalties
		let penalty_count = reaction
			.packages
			.iter()
			.filter(|(pkg, _)| pkg.package_amount_sat() > 0)
			.count();
		assert_eq!(penalty_count, 3);

		// All claims must survive their fee above dust
		let fee_estimator = Arc::new(TestFeeEstimator::new(1000));
		let secp_ctx = Secp256k1::new();
		for (mut pkg, target) in reaction.packages {
			match target {
				ConfirmationTarget::Absolute(deadline) => assert!(deadline > 800_000),
				_ => panic!("penalties carry absolute deadlines"),
			}
			let tx = pkg
				.finalize_package(
					CommitmentFormat::DefaultSegwit,
					&h.monitor.signer,
					&secp_ctx,
					h.monitor.destination_script.clone(),
					&fee_estimator,
					&h.logger,
				)
				.expect("penalty must be claimable");
			assert!(tx.output[0].value.to_sat() >= 546);
		}

		// The peer confirms a second-stage HTLC transaction on one of the watched outputs: we
		// must produce a delayed penalty on its output.
		let watched = *h.monitor.watched_revoked_outputs.keys().next().unwrap();
		let keys = h.monitor.counterparty_tx_keys(&point);
		let second_stage_script = get_revokeable_redeemscript(
			&keys.revocation_key,
			h.monitor.params.holder.to_self_delay,
			&keys.broadcaster_delayed_payment_key,
		)
		.to_p2wsh();
		let second_stage_tx = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::locktime::absolute::LockTime::ZERO,
			input: vec![bitcoin::TxIn {
				previous_output: watched,
				script_sig: ScriptBuf::new(),
				sequence: bitcoin::Sequence(1),
				witness: bitcoin::Witness::new(),
			}],
			output: vec![bitcoin::TxOut {
				value: bitcoin::Amount::from_sat(45_000),
				script_pubkey: second_stage_script,
			}],
		};
		let reaction = h.monitor.on_watched_output_spent(watched, &second_stage_tx, 800_010);
		assert_eq!(reaction.packages.len(), 1);
	}

	#[test]
	fn test_alternative_commitment_racing() {
		let mut h = harness();
		let winner = Txid::from_byte_array([0xaa; 32]);
		let loser = Txid::from_byte_array([0xbb; 32]);
		h.monitor.active_funding_txids = vec![winner, loser];

		let reaction = h.monitor.on_alternative_funding_confirmed(winner);
		assert_eq!(reaction.cancel_watches, vec![loser]);
		assert_eq!(h.monitor.watched_funding_txids(), &[winner]);

		// A spend of the losing funding output is now ignored entirely.
		let (their_commit, _, _) = counterparty_commitment_at(&h, 0, vec![]);
		// (their_commit spends the real funding txid, which just lost the race)
		let reaction = h.monitor.on_funding_spent(&their_commit, 800_000, &h.logger);
		assert!(reaction.packages.is_empty());
		assert!(reaction.publish.is_empty());
	}

	#[test]
	fn test_future_commitment_passive_recovery() {
		let mut h = harness();
		let (future_commit, _, point) = counterparty_commitment_at(&h, 7, vec![]);
		// Without the data-loss point we can do nothing at all.
		let reaction = h.monitor.on_funding_spent(&future_commit, 800_000, &h.logger);
		assert!(reaction.publish.is_empty());
		assert!(reaction.packages.is_empty());

		// With it, we can at least sweep our own output.
		h.monitor.provide_data_loss_protect_point(point);
		let reaction = h.monitor.on_funding_spent(&future_commit, 800_000, &h.logger);
		assert_eq!(reaction.publish.len(), 1);
		assert!(reaction.publish[0].0.is_fully_signed() || !reaction.publish[0].0.0.input.is_empty());
	}

	#[test]
	fn test_htlc_success_requires_preimage() {
		let mut h = harness();
		let preimage = PaymentPreimage([1; 32]);
		let htlc = incoming_htlc(50_000_000, 800_100, 1, preimage.payment_hash());
		let payment_hash = htlc.add.payment_hash;
		let (their_commit, built_htlcs, point) =
			counterparty_commitment_at(&h, 0, vec![htlc]);
		// Their current commitment includes the HTLC; re-record it with the HTLC set.
		h.monitor.current_counterparty_txids.insert(their_commit.compute_txid());
		h.monitor.record_counterparty_commitment(
			their_commit.compute_txid(),
			INITIAL_COMMITMENT_NUMBER,
			point,
			built_htlcs,
		);

		// Without the preimage the HTLC-success claim is skipped.
		let reaction = h.monitor.on_funding_spent(&their_commit, 800_000, &h.logger);
		assert!(reaction.packages.is_empty());

		// With the preimage it is produced, targeting the HTLC expiry.
		h.monitor.provide_payment_preimage(preimage);
		assert!(h.monitor.can_claim_htlc(&payment_hash));
		let reaction = h.monitor.on_funding_spent(&their_commit, 800_000, &h.logger);
		assert_eq!(reaction.packages.len(), 1);
		assert_eq!(reaction.packages[0].1, ConfirmationTarget::Absolute(800_100));
	}
}
