// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Provides keys to the channel engine and checks/signs transactions with them.
//!
//! The [`InMemorySigner`] here is a simple software implementation holding the channel's secret
//! keys directly; a production deployment may instead route these calls to an external signing
//! device, in which case it should enforce its own policy checks before signing.

pub mod taproot;

use bitcoin::amount::Amount;
use bitcoin::hashes::Hash;
use bitcoin::script::Script;
use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Transaction;

use crate::ln::chan_utils::{
	ChannelPublicKeys, ChannelTransactionParameters, ClosingTransaction, CommitmentTransaction,
	HolderCommitmentTransaction, get_anchor_redeemscript,
};
use crate::ln::channel_keys::{
	build_commitment_point, build_commitment_secret, derive_private_key, DelayedPaymentBasepoint,
	HtlcBasepoint, PaymentBasepoint, RevocationBasepoint, RevocationKey,
};
use crate::util::ser::Writeable;

/// The weight of a P2WPKH input's witness (signature plus compressed pubkey).
pub const P2WPKH_WITNESS_WEIGHT: u64 = 1 + 73 + 1 + 33 + 1;
/// The weight of a taproot key-path spend's witness.
pub const P2TR_KEY_PATH_WITNESS_WEIGHT: u64 = 1 + 1 + 64;

/// Computes the BIP143 sighash message for a P2WSH input.
pub(crate) fn sighash_p2wsh(
	tx: &Transaction, input: usize, witness_script: &Script, amount_sat: u64,
	sighash_type: EcdsaSighashType,
) -> Result<Message, ()> {
	let sighash = SighashCache::new(tx)
		.p2wsh_signature_hash(input, witness_script, Amount::from_sat(amount_sat), sighash_type)
		.map_err(|_| ())?;
	Ok(Message::from_digest(sighash.to_byte_array()))
}

/// A signer for one channel, deriving every per-commitment key from a handful of static secrets.
///
/// All signing methods are deterministic given their inputs; the only secret state which must
/// never be reused or persisted is the MuSig2 nonce material handled in [`taproot`].
#[derive(Clone, Debug)]
pub struct InMemorySigner {
	/// Private key of anything else spendable on-chain by us, used in the funding 2-of-2.
	pub funding_key: SecretKey,
	/// Holder secret key for blinded revocation pubkey.
	pub revocation_base_key: SecretKey,
	/// Holder secret key used for our balance in counterparty-broadcast commitment transactions.
	pub payment_base_key: SecretKey,
	/// Holder secret key used in an HTLC transaction.
	pub delayed_payment_base_key: SecretKey,
	/// Holder HTLC secret key used in commitment transaction HTLC outputs.
	pub htlc_base_key: SecretKey,
	/// Commitment seed from which all per-commitment secrets are derived.
	pub commitment_seed: [u8; 32],
	/// The node's identity key, used to witness liquidity-purchase commitments.
	pub node_secret: SecretKey,
}

impl_writeable!(InMemorySigner, {
	funding_key,
	revocation_base_key,
	payment_base_key,
	delayed_payment_base_key,
	htlc_base_key,
	commitment_seed,
	node_secret
});

impl InMemorySigner {
	/// Creates a new signer from its constituent secrets.
	pub fn new(
		funding_key: SecretKey, revocation_base_key: SecretKey, payment_base_key: SecretKey,
		delayed_payment_base_key: SecretKey, htlc_base_key: SecretKey, commitment_seed: [u8; 32],
		node_secret: SecretKey,
	) -> InMemorySigner {
		InMemorySigner {
			funding_key,
			revocation_base_key,
			payment_base_key,
			delayed_payment_base_key,
			htlc_base_key,
			commitment_seed,
			node_secret,
		}
	}

	/// The public basepoints this signer controls.
	pub fn pubkeys<T: secp256k1::Signing>(&self, secp_ctx: &Secp256k1<T>) -> ChannelPublicKeys {
		ChannelPublicKeys {
			funding_pubkey: PublicKey::from_secret_key(secp_ctx, &self.funding_key),
			revocation_basepoint: RevocationBasepoint(PublicKey::from_secret_key(
				secp_ctx,
				&self.revocation_base_key,
			)),
			payment_basepoint: PaymentBasepoint(PublicKey::from_secret_key(
				secp_ctx,
				&self.payment_base_key,
			)),
			delayed_payment_basepoint: DelayedPaymentBasepoint(PublicKey::from_secret_key(
				secp_ctx,
				&self.delayed_payment_base_key,
			)),
			htlc_basepoint: HtlcBasepoint(PublicKey::from_secret_key(
				secp_ctx,
				&self.htlc_base_key,
			)),
		}
	}

	/// The node id corresponding to [`Self::node_secret`].
	pub fn node_id<T: secp256k1::Signing>(&self, secp_ctx: &Secp256k1<T>) -> PublicKey {
		PublicKey::from_secret_key(secp_ctx, &self.node_secret)
	}

	/// Gets the per-commitment point for a specific commitment number (counting down).
	pub fn get_per_commitment_point<T: secp256k1::Signing>(
		&self, commitment_number: u64, secp_ctx: &Secp256k1<T>,
	) -> PublicKey {
		build_commitment_point(secp_ctx, &self.commitment_seed, commitment_number)
	}

	/// Gets the per-commitment secret for a specific commitment number (counting down). Only
	/// ever call this for commitments which are being irrevocably revoked - handing out a secret
	/// for a live commitment lets the counterparty take everything.
	pub fn release_commitment_secret(&self, commitment_number: u64) -> [u8; 32] {
		build_commitment_secret(&self.commitment_seed, commitment_number)
	}

	/// Signs a counterparty commitment and each of its non-dust HTLC transactions.
	///
	/// The HTLC signatures are made with our HTLC key tweaked by the counterparty's
	/// per-commitment point, using the sighash flag the commitment format mandates.
	pub fn sign_counterparty_commitment<T: secp256k1::Signing + secp256k1::Verification>(
		&self, commitment_tx: &CommitmentTransaction, tx_params: &ChannelTransactionParameters,
		secp_ctx: &Secp256k1<T>,
	) -> (Signature, Vec<Signature>) {
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		let sig = commitment_tx.built_transaction().sign(
			&self.funding_key,
			&funding_redeemscript,
			tx_params.channel_value_satoshis,
			secp_ctx,
		);

		let htlc_key = derive_private_key(
			secp_ctx,
			&commitment_tx.per_commitment_point(),
			&self.htlc_base_key,
		);
		let contest_delay = tx_params.as_counterparty_broadcastable().contest_delay();
		let mut htlc_sigs = Vec::with_capacity(commitment_tx.nondust_htlcs().len());
		for idx in 0..commitment_tx.nondust_htlcs().len() {
			let sighash = commitment_tx.htlc_tx_sighash(idx, contest_delay);
			htlc_sigs.push(secp_ctx.sign_ecdsa(&sighash, &htlc_key));
		}
		(sig, htlc_sigs)
	}

	/// Signs our own commitment transaction for broadcast.
	pub fn sign_holder_commitment<T: secp256k1::Signing>(
		&self, commitment_tx: &HolderCommitmentTransaction,
		tx_params: &ChannelTransactionParameters, secp_ctx: &Secp256k1<T>,
	) -> Signature {
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		commitment_tx.built_transaction().sign(
			&self.funding_key,
			&funding_redeemscript,
			tx_params.channel_value_satoshis,
			secp_ctx,
		)
	}

	/// Signs our own second-stage HTLC transactions on our commitment.
	pub fn sign_holder_htlc_transactions<T: secp256k1::Signing + secp256k1::Verification>(
		&self, commitment_tx: &CommitmentTransaction, contest_delay: u16,
		secp_ctx: &Secp256k1<T>,
	) -> Vec<Signature> {
		commitment_tx.get_htlc_sigs(&self.htlc_base_key, contest_delay, secp_ctx)
	}

	/// Create a signature for the given input in a transaction spending a commitment
	/// transaction's `to_local` output when our counterparty broadcasts an old state.
	///
	/// `per_commitment_key` is the revocation secret which was provided by our counterparty when
	/// they revoked the state which they eventually broadcast. It's not a holder secret key and
	/// does not allow the spending of any funds by itself.
	pub fn sign_justice_revoked_output<T: secp256k1::Signing>(
		&self, justice_tx: &Transaction, input: usize, amount_sat: u64,
		per_commitment_key: &SecretKey, witness_script: &Script, secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		let revocation_key = RevocationKey::derive_private_revocation_key(
			secp_ctx,
			per_commitment_key,
			&self.revocation_base_key,
		);
		let sighash =
			sighash_p2wsh(justice_tx, input, witness_script, amount_sat, EcdsaSighashType::All)?;
		Ok(secp_ctx.sign_ecdsa(&sighash, &revocation_key))
	}

	/// Create a signature for the given input in a transaction spending a commitment
	/// transaction's HTLC output when our counterparty broadcasts an old state.
	pub fn sign_justice_revoked_htlc<T: secp256k1::Signing>(
		&self, justice_tx: &Transaction, input: usize, amount_sat: u64,
		per_commitment_key: &SecretKey, witness_script: &Script, secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		// Same revocation key path; the witness script is the HTLC script rather than the
		// revokeable balance script.
		self.sign_justice_revoked_output(
			justice_tx,
			input,
			amount_sat,
			per_commitment_key,
			witness_script,
			secp_ctx,
		)
	}

	/// Create a signature for a claiming transaction for an HTLC output on the counterparty's
	/// commitment transaction, either offered or received.
	///
	/// `per_commitment_point` is the dynamic point the counterparty used for the broadcast
	/// state; our HTLC key for that state is derived from it.
	pub fn sign_counterparty_htlc_transaction<T: secp256k1::Signing>(
		&self, claim_tx: &Transaction, input: usize, amount_sat: u64,
		per_commitment_point: &PublicKey, witness_script: &Script, secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		let htlc_key = derive_private_key(secp_ctx, per_commitment_point, &self.htlc_base_key);
		let sighash =
			sighash_p2wsh(claim_tx, input, witness_script, amount_sat, EcdsaSighashType::All)?;
		Ok(secp_ctx.sign_ecdsa(&sighash, &htlc_key))
	}

	/// Create a signature for a delayed claim of our own `to_local` output (or a second-stage
	/// HTLC transaction output) after the CSV delay.
	pub fn sign_delayed_payment<T: secp256k1::Signing>(
		&self, claim_tx: &Transaction, input: usize, amount_sat: u64,
		per_commitment_point: &PublicKey, witness_script: &Script, secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		let delayed_key =
			derive_private_key(secp_ctx, per_commitment_point, &self.delayed_payment_base_key);
		let sighash =
			sighash_p2wsh(claim_tx, input, witness_script, amount_sat, EcdsaSighashType::All)?;
		Ok(secp_ctx.sign_ecdsa(&sighash, &delayed_key))
	}

	/// Create a signature spending our (non-delayed) main output on the counterparty's
	/// commitment. `witness_script` is the P2WPKH script code, or the CSV(1) script under anchor
	/// formats.
	pub fn sign_remote_main_output<T: secp256k1::Signing>(
		&self, claim_tx: &Transaction, input: usize, amount_sat: u64, witness_script: &Script,
		secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		let sighash =
			sighash_p2wsh(claim_tx, input, witness_script, amount_sat, EcdsaSighashType::All)?;
		Ok(secp_ctx.sign_ecdsa(&sighash, &self.payment_base_key))
	}

	/// Computes the signature for our anchor output's spend, at `input` within `anchor_tx`.
	pub fn sign_anchor_input<T: secp256k1::Signing>(
		&self, anchor_tx: &Transaction, input: usize, secp_ctx: &Secp256k1<T>,
	) -> Result<Signature, ()> {
		let funding_pubkey = PublicKey::from_secret_key(secp_ctx, &self.funding_key);
		let witness_script = get_anchor_redeemscript(&funding_pubkey);
		let sighash = sighash_p2wsh(
			anchor_tx,
			input,
			&witness_script,
			crate::ln::chan_utils::ANCHOR_OUTPUT_VALUE_SATOSHI,
			EcdsaSighashType::All,
		)?;
		Ok(secp_ctx.sign_ecdsa(&sighash, &self.funding_key))
	}

	/// Create a signature for a (proposed) closing transaction.
	///
	/// Note that, due to rounding, there may be one "missing" satoshi, and either party may have
	/// chosen to forgo their output as dust.
	pub fn sign_closing_transaction<T: secp256k1::Signing>(
		&self, closing_tx: &ClosingTransaction, tx_params: &ChannelTransactionParameters,
		secp_ctx: &Secp256k1<T>,
	) -> Signature {
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		closing_tx.sign(
			&self.funding_key,
			&funding_redeemscript,
			tx_params.channel_value_satoshis,
			secp_ctx,
		)
	}

	/// Signs an arbitrary serialized payload with the node key - used to witness
	/// liquidity-purchase commitments (`will_fund`).
	pub fn sign_with_node_key<T: secp256k1::Signing, M: Writeable>(
		&self, payload: &M, secp_ctx: &Secp256k1<T>,
	) -> Signature {
		let msg = message_for_payload(payload);
		secp_ctx.sign_ecdsa(&msg, &self.node_secret)
	}
}

/// Hashes a serialized payload into a signable message.
pub(crate) fn message_for_payload<M: Writeable>(payload: &M) -> Message {
	use bitcoin::hashes::sha256::Hash as Sha256;
	let encoded = payload.encode();
	Message::from_digest(Sha256::hash(&encoded).to_byte_array())
}

/// Verifies a node-key witness signature over a serialized payload, as used by `will_fund`.
pub fn verify_node_signature<T: secp256k1::Verification, M: Writeable>(
	payload: &M, signature: &Signature, node_id: &PublicKey, secp_ctx: &Secp256k1<T>,
) -> Result<(), ()> {
	let msg = message_for_payload(payload);
	secp_ctx.verify_ecdsa(&msg, signature, node_id).map_err(|_| ())
}

/// A simple entropy source: external users provide randomness to the engine explicitly, which
/// keeps the crate free of any direct RNG dependency and makes tests deterministic.
pub trait EntropySource {
	/// Gets a unique, cryptographically-secure random 32 byte value.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::Secp256k1;

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

	#[test]
	fn per_commitment_point_matches_released_secret() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		for commitment_number in [(1u64 << 48) - 1, (1 << 48) - 2, 42] {
			let point = signer.get_per_commitment_point(commitment_number, &secp_ctx);
			let secret =
				SecretKey::from_slice(&signer.release_commitment_secret(commitment_number))
					.unwrap();
			assert_eq!(PublicKey::from_secret_key(&secp_ctx, &secret), point);
		}
	}

	#[test]
	fn node_signature_roundtrip() {
		let secp_ctx = Secp256k1::new();
		let signer = signer();
		let payload = crate::ln::msgs::RequestFunding {
			requested_amount_satoshis: 100_000,
			funding_fee_base_satoshis: 500,
			funding_fee_proportional_millionths: 200,
		};
		let sig = signer.sign_with_node_key(&payload, &secp_ctx);
		assert!(verify_node_signature(&payload, &sig, &signer.node_id(&secp_ctx), &secp_ctx).is_ok());
		let other = crate::ln::msgs::RequestFunding {
			requested_amount_satoshis: 100_001,
			..payload
		};
		assert!(verify_node_signature(&other, &sig, &signer.node_id(&secp_ctx), &secp_ctx).is_err());
	}
}
