// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities to assemble claimable outpoints in packages of one or more transactions.
//! Those packages carry the metadata guiding their fee-bumping re-schedule. This file also
//! includes witness weight computation and fee computation methods, and the pure constructors
//! for every claim and penalty transaction the engine may publish after a force-close.

use bitcoin::amount::Amount;
use bitcoin::locktime::absolute::LockTime;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::{OutPoint as BitcoinOutPoint, Transaction, TxIn, TxOut, Version};
use bitcoin::hash_types::Txid;
use bitcoin::{Sequence, Witness};

use crate::chain::chaininterface::{ConfirmationTarget, FeeEstimator, Priority, MIN_RELAY_FEE_SAT_PER_1000_WEIGHT};
use crate::chain::transaction::MaybeSignedTransaction;
use crate::ln::chan_utils::{
	get_anchor_redeemscript, get_htlc_redeemscript_with_explicit_keys,
	get_revokeable_redeemscript, get_to_countersignatory_with_anchors_redeemscript,
	CommitmentFormat, HTLCOutputInCommitment, TxCreationKeys,
};
use crate::ln::channel_keys::{DelayedPaymentKey, RevocationKey};
use crate::ln::msgs::DecodeError;
use crate::ln::types::PaymentPreimage;
use crate::sign::InMemorySigner;
use crate::util::logger::Logger;
use crate::util::ser::{Readable, Writeable, Writer};

use core::cmp;
use core::ops::Deref;
use std::io::Read;

// number_of_witness_elements + sig_length + revocation_sig + pubkey_length + revocationpubkey + witness_script_length + witness_script
pub(crate) const WEIGHT_REVOKED_OFFERED_HTLC: u64 = 1 + 1 + 73 + 1 + 33 + 1 + 133;
// number_of_witness_elements + sig_length + revocation_sig + pubkey_length + revocationpubkey + witness_script_length + witness_script
pub(crate) const WEIGHT_REVOKED_RECEIVED_HTLC: u64 = 1 + 1 + 73 + 1 + 33 + 1 + 139;
// number_of_witness_elements + sig_length + counterpartyhtlc_sig + preimage_length + preimage + witness_script_length + witness_script
pub(crate) const WEIGHT_OFFERED_HTLC: u64 = 1 + 1 + 73 + 1 + 32 + 1 + 133;
// number_of_witness_elements + sig_length + counterpartyhtlc_sig + empty_vec_length + empty_vec + witness_script_length + witness_script
pub(crate) const WEIGHT_RECEIVED_HTLC: u64 = 1 + 1 + 73 + 1 + 1 + 1 + 139;
// number_of_witness_elements + sig_length + revocation_sig + true_length + op_true + witness_script_length + witness_script
pub(crate) const WEIGHT_REVOKED_OUTPUT: u64 = 1 + 1 + 73 + 1 + 1 + 1 + 77;
// number_of_witness_elements + sig_length + delayed_sig + false_length + empty_vec + witness_script_length + witness_script
pub(crate) const WEIGHT_DELAYED_OUTPUT: u64 = 1 + 1 + 73 + 1 + 1 + 1 + 77;

/// Height delay at which transactions are fee-bumped/rebroadcasted with a low priority.
const LOW_FREQUENCY_BUMP_INTERVAL: u32 = 15;
/// Height delay at which transactions are fee-bumped/rebroadcasted with a middle priority.
const MIDDLE_FREQUENCY_BUMP_INTERVAL: u32 = 3;
/// Height delay at which transactions are fee-bumped/rebroadcasted with a high priority.
const HIGH_FREQUENCY_BUMP_INTERVAL: u32 = 1;

/// Why a claim transaction could not be constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimError {
	/// The parent transaction has no output matching the expected script.
	OutputNotFound,
	/// The claimed amount, after deducting the claim's fee, would fall below the dust limit.
	AmountBelowDustLimit,
}

/// Locates the output of `parent_tx` paying to `script_pubkey`.
fn find_output(parent_tx: &Transaction, script_pubkey: &Script) -> Result<(u32, u64), ClaimError> {
	parent_tx
		.output
		.iter()
		.enumerate()
		.find(|(_, out)| out.script_pubkey.as_script() == script_pubkey)
		.map(|(idx, out)| (idx as u32, out.value.to_sat()))
		.ok_or(ClaimError::OutputNotFound)
}

/// Builds the skeleton of a single-input claim: one input spending `outpoint` with `sequence`,
/// one output to `destination_script` carrying `value` minus the fee implied by
/// `claim_weight` at `feerate_per_kw`.
fn build_claim_skeleton(
	outpoint: BitcoinOutPoint, sequence: Sequence, lock_time: LockTime, value_sat: u64,
	claim_weight: u64, feerate_per_kw: u32, dust_limit_sat: u64, destination_script: ScriptBuf,
) -> Result<Transaction, ClaimError> {
	// The skeleton below weighs 4 (version) + 4 (locktime) + 1 + 41*4/4... computed as weight
	// units directly: fixed fields plus one input and one output.
	let base_weight = (4 + 4 + 1 + 1) as u64 * 4
		+ 2
		+ 41 * 4
		+ (8 + 1 + destination_script.len() as u64) * 4;
	let fee = (base_weight + claim_weight) * feerate_per_kw as u64 / 1000;
	let claimed = value_sat.saturating_sub(fee);
	if claimed < dust_limit_sat {
		return Err(ClaimError::AmountBelowDustLimit);
	}
	Ok(Transaction {
		version: Version::TWO,
		lock_time,
		input: vec![TxIn {
			previous_output: outpoint,
			script_sig: ScriptBuf::new(),
			sequence,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(claimed),
			script_pubkey: destination_script,
		}],
	})
}

fn push_sig(witness: &mut Witness, sig: &secp256k1::ecdsa::Signature) {
	let mut sig_bytes = sig.serialize_der().to_vec();
	sig_bytes.push(EcdsaSighashType::All as u8);
	witness.push(sig_bytes);
}

/// Builds and signs a claim of our own `to_local` output after its CSV delay (or of a
/// second-stage HTLC transaction's output, which carries the same script).
pub fn build_claim_main_delayed<T: secp256k1::Signing>(
	parent_tx: &Transaction, keys: &TxCreationKeys, contest_delay: u16, feerate_per_kw: u32,
	dust_limit_sat: u64, destination_script: ScriptBuf, signer: &InMemorySigner,
	secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	let witness_script = get_revokeable_redeemscript(
		&keys.revocation_key,
		contest_delay,
		&keys.broadcaster_delayed_payment_key,
	);
	let (vout, value) = find_output(parent_tx, &witness_script.to_p2wsh())?;
	let mut tx = build_claim_skeleton(
		BitcoinOutPoint { txid: parent_tx.compute_txid(), vout },
		Sequence(contest_delay as u32),
		LockTime::ZERO,
		value,
		WEIGHT_DELAYED_OUTPUT,
		feerate_per_kw,
		dust_limit_sat,
		destination_script,
	)?;
	let sig = signer
		.sign_delayed_payment(&tx, 0, value, &keys.per_commitment_point, &witness_script, secp_ctx)
		.expect("the claim transaction we just built is signable");
	let mut witness = Witness::new();
	push_sig(&mut witness, &sig);
	witness.push(Vec::new());
	witness.push(witness_script.as_bytes());
	tx.input[0].witness = witness;
	Ok(MaybeSignedTransaction(tx))
}

/// Builds and signs a claim of our main output on the counterparty's commitment.
pub fn build_claim_remote_main<T: secp256k1::Signing>(
	commitment_tx: &Transaction, payment_key: &PublicKey, format: CommitmentFormat,
	feerate_per_kw: u32, dust_limit_sat: u64, destination_script: ScriptBuf,
	signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	if format.has_anchors() {
		let witness_script = get_to_countersignatory_with_anchors_redeemscript(payment_key);
		let (vout, value) = find_output(commitment_tx, &witness_script.to_p2wsh())?;
		let mut tx = build_claim_skeleton(
			BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
			Sequence(1),
			LockTime::ZERO,
			value,
			WEIGHT_DELAYED_OUTPUT,
			feerate_per_kw,
			dust_limit_sat,
			destination_script,
		)?;
		let sig = signer
			.sign_remote_main_output(&tx, 0, value, &witness_script, secp_ctx)
			.expect("the claim transaction we just built is signable");
		let mut witness = Witness::new();
		push_sig(&mut witness, &sig);
		witness.push(witness_script.as_bytes());
		tx.input[0].witness = witness;
		Ok(MaybeSignedTransaction(tx))
	} else {
		// A plain P2WPKH to our static payment key; any wallet can sweep it, so the witness is
		// left to the wallet via the descriptor and we only locate the output here.
		let script = {
			use bitcoin::hashes::Hash;
			bitcoin::script::Builder::new()
				.push_opcode(bitcoin::opcodes::all::OP_PUSHBYTES_0)
				.push_slice(
					&bitcoin::WPubkeyHash::hash(&payment_key.serialize()).to_byte_array(),
				)
				.into_script()
		};
		let (vout, value) = find_output(commitment_tx, &script)?;
		let tx = build_claim_skeleton(
			BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
			Sequence::ENABLE_RBF_NO_LOCKTIME,
			LockTime::ZERO,
			value,
			crate::sign::P2WPKH_WITNESS_WEIGHT,
			feerate_per_kw,
			dust_limit_sat,
			destination_script,
		)?;
		Ok(MaybeSignedTransaction(tx))
	}
}

/// Builds and signs a direct claim of an HTLC output on the counterparty's commitment: with the
/// preimage for an HTLC they offered, or after expiry for one they received from us.
pub fn build_claim_counterparty_htlc<T: secp256k1::Signing>(
	commitment_tx: &Transaction, htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys,
	format: CommitmentFormat, preimage: Option<PaymentPreimage>, feerate_per_kw: u32,
	dust_limit_sat: u64, destination_script: ScriptBuf, signer: &InMemorySigner,
	secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	// `keys` here are the *counterparty's* commitment keys: they broadcast, we countersign.
	let witness_script = get_htlc_redeemscript_with_explicit_keys(
		htlc,
		format,
		&keys.broadcaster_htlc_key,
		&keys.countersignatory_htlc_key,
		&keys.revocation_key,
	);
	let (vout, value) = find_output(commitment_tx, &witness_script.to_p2wsh())?;
	let (weight, lock_time) = if preimage.is_some() {
		(WEIGHT_OFFERED_HTLC, LockTime::ZERO)
	} else {
		(WEIGHT_RECEIVED_HTLC, LockTime::from_consensus(htlc.cltv_expiry))
	};
	let sequence = if format.has_anchors() { Sequence(1) } else { Sequence::ENABLE_RBF_NO_LOCKTIME };
	let mut tx = build_claim_skeleton(
		BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
		sequence,
		lock_time,
		value,
		weight,
		feerate_per_kw,
		dust_limit_sat,
		destination_script,
	)?;
	let sig = signer
		.sign_counterparty_htlc_transaction(
			&tx,
			0,
			value,
			&keys.per_commitment_point,
			&witness_script,
			secp_ctx,
		)
		.expect("the claim transaction we just built is signable");
	let mut witness = Witness::new();
	push_sig(&mut witness, &sig);
	if let Some(preimage) = preimage {
		witness.push(preimage.0.to_vec());
	} else {
		// Due to BIP146 (MINIMALIF) this must be a zero-length element to relay.
		witness.push(Vec::new());
	}
	witness.push(witness_script.as_bytes());
	tx.input[0].witness = witness;
	Ok(MaybeSignedTransaction(tx))
}

/// Builds and signs the penalty spend of a revoked commitment's `to_local` output.
pub fn build_main_penalty<T: secp256k1::Signing>(
	commitment_tx: &Transaction, revocation_key: &RevocationKey, contest_delay: u16,
	delayed_payment_key: &DelayedPaymentKey, per_commitment_key: &SecretKey,
	feerate_per_kw: u32, dust_limit_sat: u64, destination_script: ScriptBuf,
	signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	let witness_script =
		get_revokeable_redeemscript(revocation_key, contest_delay, delayed_payment_key);
	let (vout, value) = find_output(commitment_tx, &witness_script.to_p2wsh())?;
	let mut tx = build_claim_skeleton(
		BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
		Sequence::ENABLE_RBF_NO_LOCKTIME,
		LockTime::ZERO,
		value,
		WEIGHT_REVOKED_OUTPUT,
		feerate_per_kw,
		dust_limit_sat,
		destination_script,
	)?;
	let sig = signer
		.sign_justice_revoked_output(&tx, 0, value, per_commitment_key, &witness_script, secp_ctx)
		.expect("the penalty transaction we just built is signable");
	let mut witness = Witness::new();
	push_sig(&mut witness, &sig);
	witness.push(vec![1]);
	witness.push(witness_script.as_bytes());
	tx.input[0].witness = witness;
	Ok(MaybeSignedTransaction(tx))
}

/// Builds and signs the penalty spend of a revoked commitment's HTLC output.
pub fn build_htlc_penalty<T: secp256k1::Signing>(
	commitment_tx: &Transaction, htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys,
	format: CommitmentFormat, per_commitment_key: &SecretKey, feerate_per_kw: u32,
	dust_limit_sat: u64, destination_script: ScriptBuf, signer: &InMemorySigner,
	secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	let witness_script = get_htlc_redeemscript_with_explicit_keys(
		htlc,
		format,
		&keys.broadcaster_htlc_key,
		&keys.countersignatory_htlc_key,
		&keys.revocation_key,
	);
	let (vout, value) = find_output(commitment_tx, &witness_script.to_p2wsh())?;
	let weight =
		if htlc.offered { WEIGHT_REVOKED_OFFERED_HTLC } else { WEIGHT_REVOKED_RECEIVED_HTLC };
	let mut tx = build_claim_skeleton(
		BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
		Sequence::ENABLE_RBF_NO_LOCKTIME,
		LockTime::ZERO,
		value,
		weight,
		feerate_per_kw,
		dust_limit_sat,
		destination_script,
	)?;
	let sig = signer
		.sign_justice_revoked_htlc(&tx, 0, value, per_commitment_key, &witness_script, secp_ctx)
		.expect("the penalty transaction we just built is signable");
	let mut witness = Witness::new();
	push_sig(&mut witness, &sig);
	witness.push(keys.revocation_key.to_public_key().serialize().to_vec());
	witness.push(witness_script.as_bytes());
	tx.input[0].witness = witness;
	Ok(MaybeSignedTransaction(tx))
}

/// Builds and signs the penalty spend of the output of a revoked second-stage HTLC transaction
/// the counterparty managed to confirm.
pub fn build_htlc_delayed_penalty<T: secp256k1::Signing>(
	htlc_tx: &Transaction, revocation_key: &RevocationKey, contest_delay: u16,
	delayed_payment_key: &DelayedPaymentKey, per_commitment_key: &SecretKey,
	feerate_per_kw: u32, dust_limit_sat: u64, destination_script: ScriptBuf,
	signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	// The second-stage output carries the same revokeable script as `to_local`.
	build_main_penalty(
		htlc_tx,
		revocation_key,
		contest_delay,
		delayed_payment_key,
		per_commitment_key,
		feerate_per_kw,
		dust_limit_sat,
		destination_script,
		signer,
		secp_ctx,
	)
}

/// Builds and signs a spend of our anchor output. The transaction has no outputs of its own -
/// its entire value contributes to fee, and the wallet is expected to attach inputs and a
/// change output before broadcast (CPFP).
pub fn build_claim_anchor<T: secp256k1::Signing>(
	commitment_tx: &Transaction, funding_pubkey: &PublicKey, signer: &InMemorySigner,
	secp_ctx: &Secp256k1<T>,
) -> Result<MaybeSignedTransaction, ClaimError> {
	let witness_script = get_anchor_redeemscript(funding_pubkey);
	let (vout, _value) = find_output(commitment_tx, &witness_script.to_p2wsh())?;
	let mut tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: BitcoinOutPoint { txid: commitment_tx.compute_txid(), vout },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}],
		output: vec![],
	};
	let sig = signer
		.sign_anchor_input(&tx, 0, secp_ctx)
		.expect("the anchor spend we just built is signable");
	let mut witness = Witness::new();
	push_sig(&mut witness, &sig);
	witness.push(witness_script.as_bytes());
	tx.input[0].witness = witness;
	Ok(MaybeSignedTransaction(tx))
}

/// A struct to describe a revoked output, carrying all information needed to generate a solving
/// witness spending a commitment `to_local` output or a second-stage HTLC transaction output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokedOutput {
	pub(crate) per_commitment_point: PublicKey,
	pub(crate) per_commitment_key: SecretKey,
	pub(crate) revocation_key: RevocationKey,
	pub(crate) delayed_payment_key: DelayedPaymentKey,
	pub(crate) on_counterparty_tx_csv: u16,
	pub(crate) amount_sat: u64,
}

impl_writeable!(RevokedOutput, {
	per_commitment_point,
	per_commitment_key,
	revocation_key,
	delayed_payment_key,
	on_counterparty_tx_csv,
	amount_sat
});

/// A struct to describe a revoked HTLC output and the keys to punish it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokedHTLCOutput {
	pub(crate) per_commitment_point: PublicKey,
	pub(crate) per_commitment_key: SecretKey,
	pub(crate) keys: TxCreationKeys,
	pub(crate) htlc: HTLCOutputInCommitment,
}

impl Writeable for RevokedHTLCOutput {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.per_commitment_point.write(w)?;
		self.per_commitment_key.write(w)?;
		self.keys.write(w)?;
		self.htlc.write(w)
	}
}
impl Readable for RevokedHTLCOutput {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(RevokedHTLCOutput {
			per_commitment_point: Readable::read(r)?,
			per_commitment_key: Readable::read(r)?,
			keys: Readable::read(r)?,
			htlc: Readable::read(r)?,
		})
	}
}

/// A struct to describe a direct claim of an HTLC on a counterparty commitment transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterpartyHTLCOutput {
	pub(crate) keys: TxCreationKeys,
	pub(crate) preimage: Option<PaymentPreimage>,
	pub(crate) htlc: HTLCOutputInCommitment,
}

impl Writeable for CounterpartyHTLCOutput {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.keys.write(w)?;
		self.preimage.write(w)?;
		self.htlc.write(w)
	}
}
impl Readable for CounterpartyHTLCOutput {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(CounterpartyHTLCOutput {
			keys: Readable::read(r)?,
			preimage: Readable::read(r)?,
			htlc: Readable::read(r)?,
		})
	}
}

/// A claim of our own `to_local` (or a second-stage output) after its delay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelayedPaymentOutput {
	pub(crate) keys: TxCreationKeys,
	pub(crate) contest_delay: u16,
	pub(crate) amount_sat: u64,
}

impl Writeable for DelayedPaymentOutput {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.keys.write(w)?;
		self.contest_delay.write(w)?;
		self.amount_sat.write(w)
	}
}
impl Readable for DelayedPaymentOutput {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(DelayedPaymentOutput {
			keys: Readable::read(r)?,
			contest_delay: Readable::read(r)?,
			amount_sat: Readable::read(r)?,
		})
	}
}

/// A wrapper encapsulating all in-protocol differing claim types.
///
/// The generic API offers access to an output's common attributes and allows transformation
/// such as finalizing an input claiming the output.
#[derive(Clone, Debug, PartialEq)]
pub enum PackageSolvingData {
	/// A revoked `to_local` or second-stage output, spendable via the revocation key.
	RevokedOutput(RevokedOutput),
	/// A revoked HTLC output, spendable via the revocation key.
	RevokedHTLCOutput(RevokedHTLCOutput),
	/// An HTLC on the counterparty's commitment, claimable directly.
	CounterpartyHTLCOutput(CounterpartyHTLCOutput),
	/// Our own delayed main (or second-stage) output.
	DelayedPaymentOutput(DelayedPaymentOutput),
	/// Our anchor output on a commitment.
	AnchorOutput(PublicKey),
}

impl PackageSolvingData {
	fn amount_sat(&self) -> u64 {
		match self {
			PackageSolvingData::RevokedOutput(outp) => outp.amount_sat,
			PackageSolvingData::RevokedHTLCOutput(outp) => outp.htlc.amount_msat / 1000,
			PackageSolvingData::CounterpartyHTLCOutput(outp) => outp.htlc.amount_msat / 1000,
			PackageSolvingData::DelayedPaymentOutput(outp) => outp.amount_sat,
			PackageSolvingData::AnchorOutput(_) => crate::ln::chan_utils::ANCHOR_OUTPUT_VALUE_SATOSHI,
		}
	}

	fn weight(&self) -> u64 {
		match self {
			PackageSolvingData::RevokedOutput(_) => WEIGHT_REVOKED_OUTPUT,
			PackageSolvingData::RevokedHTLCOutput(outp) => {
				if outp.htlc.offered {
					WEIGHT_REVOKED_OFFERED_HTLC
				} else {
					WEIGHT_REVOKED_RECEIVED_HTLC
				}
			},
			PackageSolvingData::CounterpartyHTLCOutput(outp) => {
				if outp.preimage.is_some() {
					WEIGHT_OFFERED_HTLC
				} else {
					WEIGHT_RECEIVED_HTLC
				}
			},
			PackageSolvingData::DelayedPaymentOutput(_) => WEIGHT_DELAYED_OUTPUT,
			PackageSolvingData::AnchorOutput(_) => WEIGHT_REVOKED_OUTPUT,
		}
	}

	fn is_aggregable(&self) -> bool {
		// Timelocked claims have differing satisfying heights and are kept alone.
		match self {
			PackageSolvingData::RevokedOutput(_) => true,
			PackageSolvingData::RevokedHTLCOutput(_) => true,
			PackageSolvingData::CounterpartyHTLCOutput(outp) => outp.preimage.is_some(),
			PackageSolvingData::DelayedPaymentOutput(_) => false,
			PackageSolvingData::AnchorOutput(_) => false,
		}
	}

	fn finalize_input<T: secp256k1::Signing>(
		&self, bumped_tx: &mut Transaction, i: usize, format: CommitmentFormat,
		signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
	) -> bool {
		match self {
			PackageSolvingData::RevokedOutput(outp) => {
				let witness_script = get_revokeable_redeemscript(
					&outp.revocation_key,
					outp.on_counterparty_tx_csv,
					&outp.delayed_payment_key,
				);
				if let Ok(sig) = signer.sign_justice_revoked_output(
					&bumped_tx,
					i,
					outp.amount_sat,
					&outp.per_commitment_key,
					&witness_script,
					secp_ctx,
				) {
					let mut witness = Witness::new();
					push_sig(&mut witness, &sig);
					witness.push(vec![1]);
					witness.push(witness_script.as_bytes());
					bumped_tx.input[i].witness = witness;
				} else {
					return false;
				}
			},
			PackageSolvingData::RevokedHTLCOutput(outp) => {
				let witness_script = get_htlc_redeemscript_with_explicit_keys(
					&outp.htlc,
					format,
					&outp.keys.broadcaster_htlc_key,
					&outp.keys.countersignatory_htlc_key,
					&outp.keys.revocation_key,
				);
				if let Ok(sig) = signer.sign_justice_revoked_htlc(
					&bumped_tx,
					i,
					outp.htlc.amount_msat / 1000,
					&outp.per_commitment_key,
					&witness_script,
					secp_ctx,
				) {
					let mut witness = Witness::new();
					push_sig(&mut witness, &sig);
					witness.push(outp.keys.revocation_key.to_public_key().serialize().to_vec());
					witness.push(witness_script.as_bytes());
					bumped_tx.input[i].witness = witness;
				} else {
					return false;
				}
			},
			PackageSolvingData::CounterpartyHTLCOutput(outp) => {
				let witness_script = get_htlc_redeemscript_with_explicit_keys(
					&outp.htlc,
					format,
					&outp.keys.broadcaster_htlc_key,
					&outp.keys.countersignatory_htlc_key,
					&outp.keys.revocation_key,
				);
				if outp.preimage.is_none() {
					bumped_tx.lock_time = LockTime::from_consensus(outp.htlc.cltv_expiry);
				}
				if let Ok(sig) = signer.sign_counterparty_htlc_transaction(
					&bumped_tx,
					i,
					outp.htlc.amount_msat / 1000,
					&outp.keys.per_commitment_point,
					&witness_script,
					secp_ctx,
				) {
					let mut witness = Witness::new();
					push_sig(&mut witness, &sig);
					if let Some(preimage) = outp.preimage {
						witness.push(preimage.0.to_vec());
					} else {
						// Due to BIP146 (MINIMALIF) this must be a zero-length element to relay.
						witness.push(Vec::new());
					}
					witness.push(witness_script.as_bytes());
					bumped_tx.input[i].witness = witness;
				} else {
					return false;
				}
			},
			PackageSolvingData::DelayedPaymentOutput(outp) => {
				let witness_script = get_revokeable_redeemscript(
					&outp.keys.revocation_key,
					outp.contest_delay,
					&outp.keys.broadcaster_delayed_payment_key,
				);
				bumped_tx.input[i].sequence = Sequence(outp.contest_delay as u32);
				if let Ok(sig) = signer.sign_delayed_payment(
					&bumped_tx,
					i,
					outp.amount_sat,
					&outp.keys.per_commitment_point,
					&witness_script,
					secp_ctx,
				) {
					let mut witness = Witness::new();
					push_sig(&mut witness, &sig);
					witness.push(Vec::new());
					witness.push(witness_script.as_bytes());
					bumped_tx.input[i].witness = witness;
				} else {
					return false;
				}
			},
			PackageSolvingData::AnchorOutput(funding_pubkey) => {
				let witness_script = get_anchor_redeemscript(funding_pubkey);
				if let Ok(sig) = signer.sign_anchor_input(&bumped_tx, i, secp_ctx) {
					let mut witness = Witness::new();
					push_sig(&mut witness, &sig);
					witness.push(witness_script.as_bytes());
					bumped_tx.input[i].witness = witness;
				} else {
					return false;
				}
			},
		}
		true
	}
}

impl Writeable for PackageSolvingData {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		match self {
			PackageSolvingData::RevokedOutput(outp) => {
				0u8.write(writer)?;
				outp.write(writer)
			},
			PackageSolvingData::RevokedHTLCOutput(outp) => {
				1u8.write(writer)?;
				outp.write(writer)
			},
			PackageSolvingData::CounterpartyHTLCOutput(outp) => {
				2u8.write(writer)?;
				outp.write(writer)
			},
			PackageSolvingData::DelayedPaymentOutput(outp) => {
				3u8.write(writer)?;
				outp.write(writer)
			},
			PackageSolvingData::AnchorOutput(key) => {
				4u8.write(writer)?;
				key.write(writer)
			},
		}
	}
}
impl Readable for PackageSolvingData {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable>::read(reader)? {
			0 => PackageSolvingData::RevokedOutput(Readable::read(reader)?),
			1 => PackageSolvingData::RevokedHTLCOutput(Readable::read(reader)?),
			2 => PackageSolvingData::CounterpartyHTLCOutput(Readable::read(reader)?),
			3 => PackageSolvingData::DelayedPaymentOutput(Readable::read(reader)?),
			4 => PackageSolvingData::AnchorOutput(Readable::read(reader)?),
			_ => return Err(DecodeError::UnknownVersion),
		})
	}
}

/// A structure describing claimable outputs which are to be (re-)published together, with the
/// metadata guiding their fee-bumping re-schedule. As packages are time-sensitive, failing to
/// confirm one before its deadline translates to a loss of funds.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageTemplate {
	// Claimable outpoints and solving data to generate satisfying witnesses.
	inputs: Vec<(BitcoinOutPoint, PackageSolvingData)>,
	// Block height before which this package's claims must confirm (typically the soonest HTLC
	// expiry in the set), if any.
	soonest_conf_deadline: Option<u32>,
	// Cache of package feerate committed at previous (re)broadcast.
	feerate_previous: u64,
	// Height at which the next fee-bump and rebroadcast will be attempted.
	height_timer: Option<u32>,
	// Confirmation height of the transaction whose outputs this package claims. If a reorg
	// unconfirms it, the package is wiped and regenerated.
	height_original: u32,
}

impl PackageTemplate {
	/// Builds a package claiming a single output.
	pub fn build_package(
		txid: Txid, vout: u32, input_solving_data: PackageSolvingData,
		soonest_conf_deadline: Option<u32>, height_original: u32,
	) -> Self {
		PackageTemplate {
			inputs: vec![(BitcoinOutPoint { txid, vout }, input_solving_data)],
			soonest_conf_deadline,
			feerate_previous: 0,
			height_timer: None,
			height_original,
		}
	}

	/// The outpoints this package claims.
	pub fn outpoints(&self) -> Vec<&BitcoinOutPoint> {
		self.inputs.iter().map(|(o, _)| o).collect()
	}

	/// The confirmation target the publisher should escalate fees against.
	pub fn confirmation_target(&self) -> ConfirmationTarget {
		match self.soonest_conf_deadline {
			Some(height) => ConfirmationTarget::Absolute(height),
			None => ConfirmationTarget::Priority(Priority::Medium),
		}
	}

	/// The block height before which this package must confirm, if any.
	pub fn timelock(&self) -> Option<u32> {
		self.soonest_conf_deadline
	}

	/// The height this package's parent confirmed at.
	pub fn height_original(&self) -> u32 {
		self.height_original
	}

	/// The next height at which this package should be fee-bumped and rebroadcast.
	pub fn timer(&self) -> Option<u32> {
		self.height_timer
	}

	/// Updates the rebroadcast timer.
	pub fn set_timer(&mut self, new_timer: Option<u32>) {
		self.height_timer = new_timer;
	}

	/// Merges another (compatible, aggregable) package into this one to save on fees.
	pub fn merge_package(&mut self, mut merge_from: PackageTemplate) {
		assert_eq!(self.height_original, merge_from.height_original);
		for (k, v) in merge_from.inputs.drain(..) {
			self.inputs.push((k, v));
		}
		self.soonest_conf_deadline = match (self.soonest_conf_deadline, merge_from.soonest_conf_deadline) {
			(Some(a), Some(b)) => Some(cmp::min(a, b)),
			(a, b) => a.or(b),
		};
		self.feerate_previous = cmp::max(self.feerate_previous, merge_from.feerate_previous);
		self.height_timer = cmp::min(self.height_timer, merge_from.height_timer);
	}

	/// Whether this package may be merged with `other`.
	pub fn can_merge_with(&self, other: &PackageTemplate) -> bool {
		self.height_original == other.height_original
			&& self.inputs.iter().all(|(_, i)| i.is_aggregable())
			&& other.inputs.iter().all(|(_, i)| i.is_aggregable())
	}

	/// The total claimed value.
	pub fn package_amount_sat(&self) -> u64 {
		self.inputs.iter().map(|(_, outp)| outp.amount_sat()).sum()
	}

	/// The predicted weight of the claim transaction.
	pub fn package_weight(&self, destination_script: &Script) -> u64 {
		let mut inputs_weight = 0;
		let mut witnesses_weight = 2u64; // count segwit flags
		for (_, outp) in self.inputs.iter() {
			// previous_out_point: 36 bytes ; var_int: 1 byte ; sequence: 4 bytes
			inputs_weight += 41 * 4;
			witnesses_weight += outp.weight();
		}
		// version: 4 bytes ; count_tx_in: 1 byte ; count_tx_out: 1 byte ; lock_time: 4 bytes
		let transaction_weight = 10 * 4;
		// value: 8 bytes ; var_int: 1 byte ; pk_script
		let output_weight = (8 + 1 + destination_script.len() as u64) * 4;
		inputs_weight + witnesses_weight + transaction_weight + output_weight
	}

	/// Builds and fully signs the claim transaction for this package, paying the remainder
	/// after fees to `destination_script`.
	pub fn finalize_package<F: Deref, L: Deref, T: secp256k1::Signing>(
		&mut self, format: CommitmentFormat, signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
		destination_script: ScriptBuf, fee_estimator: &F, logger: &L,
	) -> Option<Transaction>
	where
		F::Target: FeeEstimator,
		L::Target: Logger,
	{
		let predicted_weight = self.package_weight(&destination_script);
		let input_amounts = self.package_amount_sat();
		let (output_value, new_feerate) = compute_output_value(
			predicted_weight,
			input_amounts,
			self.feerate_previous,
			fee_estimator,
			logger,
		)?;
		self.feerate_previous = new_feerate;

		let mut bumped_tx = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: self
				.inputs
				.iter()
				.map(|(outpoint, _)| TxIn {
					previous_output: *outpoint,
					script_sig: ScriptBuf::new(),
					sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
					witness: Witness::new(),
				})
				.collect(),
			output: vec![TxOut {
				value: Amount::from_sat(output_value),
				script_pubkey: destination_script,
			}],
		};
		for (i, (outpoint, out)) in self.inputs.iter().enumerate() {
			log_trace!(logger, "Adding claiming input for outpoint {}:{}", outpoint.txid, outpoint.vout);
			if !out.finalize_input(&mut bumped_tx, i, format, signer, secp_ctx) {
				return None;
			}
		}
		log_trace!(logger, "Finalized transaction {} ready to broadcast", bumped_tx.compute_txid());
		Some(bumped_tx)
	}

	/// In LN, claimed outputs are time-sensitive: we must spend them before some timelock
	/// expiry. As the chain tip nears the deadline, the height timer is scaled down to increase
	/// the bump frequency and with it our odds of confirming in time.
	pub fn get_height_timer(&self, current_height: u32) -> u32 {
		match self.soonest_conf_deadline {
			Some(deadline) if deadline <= current_height + MIDDLE_FREQUENCY_BUMP_INTERVAL => {
				current_height + HIGH_FREQUENCY_BUMP_INTERVAL
			},
			Some(deadline) if deadline - current_height <= LOW_FREQUENCY_BUMP_INTERVAL => {
				current_height + MIDDLE_FREQUENCY_BUMP_INTERVAL
			},
			_ => current_height + LOW_FREQUENCY_BUMP_INTERVAL,
		}
	}
}

impl Writeable for PackageTemplate {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		(self.inputs.len() as u16).write(writer)?;
		for (ref outpoint, ref claim) in self.inputs.iter() {
			outpoint.txid.write(writer)?;
			outpoint.vout.write(writer)?;
			claim.write(writer)?;
		}
		self.soonest_conf_deadline.write(writer)?;
		self.feerate_previous.write(writer)?;
		self.height_timer.write(writer)?;
		self.height_original.write(writer)
	}
}
impl Readable for PackageTemplate {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let input_count: u16 = Readable::read(reader)?;
		let mut inputs = Vec::with_capacity(cmp::min(input_count as usize, 64));
		for _ in 0..input_count {
			let txid: Txid = Readable::read(reader)?;
			let vout: u32 = Readable::read(reader)?;
			let claim: PackageSolvingData = Readable::read(reader)?;
			inputs.push((BitcoinOutPoint { txid, vout }, claim));
		}
		Ok(PackageTemplate {
			inputs,
			soonest_conf_deadline: Readable::read(reader)?,
			feerate_previous: Readable::read(reader)?,
			height_timer: Readable::read(reader)?,
			height_original: Readable::read(reader)?,
		})
	}
}

/// Attempt to propose a fee for a claim transaction from its spent output values and predicted
/// weight. We start with the high priority feerate, then fall back to lower priorities until we
/// have enough value available to claim something.
fn compute_fee_from_spent_amounts<F: Deref, L: Deref>(
	input_amounts: u64, predicted_weight: u64, fee_estimator: &F, logger: &L,
) -> Option<(u64, u64)>
where
	F::Target: FeeEstimator,
	L::Target: Logger,
{
	for (priority, label) in [
		(Priority::Fast, "high"),
		(Priority::Medium, "medium"),
		(Priority::Slow, "low"),
	] {
		let feerate = fee_estimator.get_est_sat_per_1000_weight(priority) as u64;
		let fee = feerate * predicted_weight / 1000;
		if input_amounts > fee {
			if priority != Priority::Fast {
				log_warn!(
					logger,
					"Used {} priority fee for an on-chain claim as higher priority fees were more than the entire claim balance ({} sat)",
					label,
					input_amounts
				);
			}
			return Some((fee, feerate));
		}
	}
	log_error!(
		logger,
		"Failed to generate an on-chain claim as even the low priority fee was more than the entire claim balance ({} sat)",
		input_amounts
	);
	None
}

/// Attempt to propose a bumped fee for a claim. If the fee estimator's rates have been rising,
/// they are used directly; otherwise the previous feerate is blindly bumped by 25%, clamped to
/// respect BIP125 rules 3 and 4.
fn feerate_bump<F: Deref, L: Deref>(
	predicted_weight: u64, input_amounts: u64, previous_feerate: u64, fee_estimator: &F,
	logger: &L,
) -> Option<(u64, u64)>
where
	F::Target: FeeEstimator,
	L::Target: Logger,
{
	let new_fee = match compute_fee_from_spent_amounts(input_amounts, predicted_weight, fee_estimator, logger) {
		Some((new_fee, new_feerate)) if new_feerate > previous_feerate => new_fee,
		_ => {
			// ...else just increase the previous feerate by 25% (because that's a nice number)
			let bumped_fee = previous_feerate * predicted_weight / 750;
			if input_amounts <= bumped_fee {
				log_trace!(logger, "Can't 25% bump new claiming tx, amount {} is too small", input_amounts);
				return None;
			}
			bumped_fee
		},
	};

	let previous_fee = previous_feerate * predicted_weight / 1000;
	let min_relay_fee = MIN_RELAY_FEE_SAT_PER_1000_WEIGHT * predicted_weight / 1000;
	// BIP 125 Opt-in Full Replace-by-Fee Signaling
	// 	* 3. The replacement transaction pays an absolute fee of at least the sum paid by the
	//	     original transactions.
	//	* 4. The replacement transaction must also pay for its own bandwidth at or above the
	//	     rate set by the node's minimum relay fee setting.
	let new_fee = cmp::max(new_fee, previous_fee + min_relay_fee);
	Some((new_fee, new_fee * 1000 / predicted_weight))
}

/// Deduce a new proposed fee and output value for a claiming transaction. If the proposed fee
/// exceeds the claimable amount, everything is burned to miner fees to deter a counterparty
/// from racing us.
pub(crate) fn compute_output_value<F: Deref, L: Deref>(
	predicted_weight: u64, input_amounts: u64, previous_feerate: u64, fee_estimator: &F,
	logger: &L,
) -> Option<(u64, u64)>
where
	F::Target: FeeEstimator,
	L::Target: Logger,
{
	// If the old feerate is 0, this is the first claim attempt and normal estimation applies.
	if previous_feerate != 0 {
		if let Some((new_fee, feerate)) =
			feerate_bump(predicted_weight, input_amounts, previous_feerate, fee_estimator, logger)
		{
			return Some((input_amounts.saturating_sub(new_fee), feerate));
		}
	} else if let Some((new_fee, feerate)) =
		compute_fee_from_spent_amounts(input_amounts, predicted_weight, fee_estimator, logger)
	{
		return Some((input_amounts - new_fee, feerate));
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::chan_utils::{ChannelPublicKeys, TxCreationKeys};
	use crate::ln::channel_keys::RevocationBasepoint;
	use crate::ln::types::PaymentHash;
	use crate::util::test_utils::{TestFeeEstimator, TestLogger};
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::Secp256k1;
	use std::sync::Arc;

	fn signer() -> InMemorySigner {
		InMemorySigner::new(
			SecretKey::from_slice(&[1; 32]).unwrap(),
			SecretKey::from_slice(&[2; 32]).unwrap(),
			SecretKey::from_slice(&[3; 32]).unwrap(),
			SecretKey::from_slice(&[4; 32]).unwrap(),
			SecretKey::from_slice(&[5; 32]).unwrap(),
			[6; 32],
			SecretKey::from_slice(&[7; 32]).unwrap(),
		)
	}

	fn keys_for_commitment(
		secp_ctx: &Secp256k1<bitcoin::secp256k1::All>, signer: &InMemorySigner,
		per_commitment_key: &SecretKey,
	) -> TxCreationKeys {
		let per_commitment_point = PublicKey::from_secret_key(secp_ctx, per_commitment_key);
		let broadcaster_keys: ChannelPublicKeys = signer.pubkeys(secp_ctx);
		// For a penalty we are the countersignatory: the revocation basepoint is ours.
		TxCreationKeys::derive_new(
			secp_ctx,
			&per_commitment_point,
			&broadcaster_keys.delayed_payment_basepoint,
			&broadcaster_keys.htlc_basepoint,
			&RevocationBasepoint(PublicKey::from_secret_key(secp_ctx, &signer.revocation_base_key)),
			&broadcaster_keys.htlc_basepoint,
		)
	}

	fn revoked_commitment(
		secp_ctx: &Secp256k1<bitcoin::secp256k1::All>, keys: &TxCreationKeys, value_sat: u64,
	) -> Transaction {
		let _ = secp_ctx;
		let to_local_script =
			get_revokeable_redeemscript(&keys.revocation_key, 144, &keys.broadcaster_delayed_payment_key)
				.to_p2wsh();
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: BitcoinOutPoint {
					txid: Txid::from_byte_array([7; 32]),
					vout: 0,
				},
				script_sig: ScriptBuf::new(),
				sequence: Sequence(0x80000000),
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(value_sat),
				script_pubkey: to_local_script,
			}],
		}
	}

	#[test]
	fn test_main_penalty_builds_and_carries_witness() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let per_commitment_key = SecretKey::from_slice(&[11; 32]).unwrap();
		let keys = keys_for_commitment(&secp_ctx, &signer, &per_commitment_key);
		let commitment_tx = revoked_commitment(&secp_ctx, &keys, 100_000);
		let dest = ScriptBuf::from(vec![0x00, 0x14, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a]);

		let penalty = build_main_penalty(
			&commitment_tx,
			&keys.revocation_key,
			144,
			&keys.broadcaster_delayed_payment_key,
			&per_commitment_key,
			2000,
			546,
			dest,
			&signer,
			&secp_ctx,
		)
		.unwrap();
		assert!(penalty.is_fully_signed());
		assert_eq!(penalty.0.input.len(), 1);
		// sig, OP_TRUE selector, script
		assert_eq!(penalty.0.input[0].witness.len(), 3);
		assert!(penalty.0.output[0].value.to_sat() < 100_000);
	}

	#[test]
	fn test_claim_fails_when_output_missing() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let per_commitment_key = SecretKey::from_slice(&[11; 32]).unwrap();
		let keys = keys_for_commitment(&secp_ctx, &signer, &per_commitment_key);
		let commitment_tx = revoked_commitment(&secp_ctx, &keys, 100_000);
		// Different delay -> different script -> no matching output.
		let res = build_main_penalty(
			&commitment_tx,
			&keys.revocation_key,
			145,
			&keys.broadcaster_delayed_payment_key,
			&per_commitment_key,
			2000,
			546,
			ScriptBuf::new(),
			&signer,
			&secp_ctx,
		);
		assert_eq!(res.err(), Some(ClaimError::OutputNotFound));
	}

	#[test]
	fn test_claim_fails_when_below_dust() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let per_commitment_key = SecretKey::from_slice(&[11; 32]).unwrap();
		let keys = keys_for_commitment(&secp_ctx, &signer, &per_commitment_key);
		// An 800 sat output cannot pay a meaningful fee and stay above dust.
		let commitment_tx = revoked_commitment(&secp_ctx, &keys, 800);
		let res = build_main_penalty(
			&commitment_tx,
			&keys.revocation_key,
			144,
			&keys.broadcaster_delayed_payment_key,
			&per_commitment_key,
			2000,
			546,
			ScriptBuf::new(),
			&signer,
			&secp_ctx,
		);
		assert_eq!(res.err(), Some(ClaimError::AmountBelowDustLimit));
	}

	#[test]
	fn test_htlc_penalty_builds() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let per_commitment_key = SecretKey::from_slice(&[11; 32]).unwrap();
		let keys = keys_for_commitment(&secp_ctx, &signer, &per_commitment_key);
		let htlc = HTLCOutputInCommitment {
			offered: true,
			amount_msat: 50_000_000,
			cltv_expiry: 800_000,
			payment_hash: PaymentHash([5; 32]),
			transaction_output_index: Some(0),
		};
		let script = get_htlc_redeemscript_with_explicit_keys(
			&htlc,
			CommitmentFormat::DefaultSegwit,
			&keys.broadcaster_htlc_key,
			&keys.countersignatory_htlc_key,
			&keys.revocation_key,
		);
		let commitment_tx = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![],
			output: vec![TxOut {
				value: Amount::from_sat(50_000),
				script_pubkey: script.to_p2wsh(),
			}],
		};
		let penalty = build_htlc_penalty(
			&commitment_tx,
			&htlc,
			&keys,
			CommitmentFormat::DefaultSegwit,
			&per_commitment_key,
			2000,
			546,
			ScriptBuf::from(vec![0x00, 0x14, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b, 0x0b]),
			&signer,
			&secp_ctx,
		)
		.unwrap();
		assert!(penalty.is_fully_signed());
		// sig, revocation key, script
		assert_eq!(penalty.0.input[0].witness.len(), 3);
	}

	#[test]
	fn test_package_merge_and_fees() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let per_commitment_key = SecretKey::from_slice(&[11; 32]).unwrap();
		let keys = keys_for_commitment(&secp_ctx, &signer, &per_commitment_key);

		let revoked = RevokedOutput {
			per_commitment_point: PublicKey::from_secret_key(&secp_ctx, &per_commitment_key),
			per_commitment_key,
			revocation_key: keys.revocation_key.clone(),
			delayed_payment_key: keys.broadcaster_delayed_payment_key.clone(),
			on_counterparty_tx_csv: 144,
			amount_sat: 100_000,
		};
		let mut pkg_a = PackageTemplate::build_package(
			Txid::from_byte_array([1; 32]),
			0,
			PackageSolvingData::RevokedOutput(revoked.clone()),
			Some(800_050),
			100,
		);
		let pkg_b = PackageTemplate::build_package(
			Txid::from_byte_array([1; 32]),
			1,
			PackageSolvingData::RevokedOutput(revoked),
			Some(800_020),
			100,
		);
		assert!(pkg_a.can_merge_with(&pkg_b));
		pkg_a.merge_package(pkg_b);
		assert_eq!(pkg_a.outpoints().len(), 2);
		assert_eq!(pkg_a.timelock(), Some(800_020));
		assert_eq!(pkg_a.package_amount_sat(), 200_000);
		assert_eq!(
			pkg_a.confirmation_target(),
			ConfirmationTarget::Absolute(800_020)
		);

		// Bump cadence escalates as the deadline approaches
		assert_eq!(pkg_a.get_height_timer(800_000), 800_003);
		assert_eq!(pkg_a.get_height_timer(800_018), 800_019);
		assert_eq!(pkg_a.get_height_timer(799_000), 799_015);

		// And the first finalize pass uses the estimator's feerate
		let fee_estimator = Arc::new(TestFeeEstimator::new(2000));
		let logger = Arc::new(TestLogger::new());
		let tx = pkg_a
			.finalize_package(
				CommitmentFormat::DefaultSegwit,
				&signer,
				&secp_ctx,
				ScriptBuf::from(vec![0x00, 0x14, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c, 0x0c]),
				&fee_estimator,
				&logger,
			)
			.unwrap();
		assert_eq!(tx.input.len(), 2);
		assert_eq!(tx.output.len(), 1);
		assert!(tx.output[0].value.to_sat() < 200_000);
		assert!(tx.input.iter().all(|input| !input.witness.is_empty()));
	}
}
