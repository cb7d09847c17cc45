// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Taproot-specific signing: the MuSig2 2-of-2 aggregate for the funding output, and the BIP-341
//! script trees used by taproot commitment outputs.
//!
//! MuSig2 nonces are secret material whose reuse is catastrophic: a nonce is produced exactly
//! once, consumed exactly once by [`MusigSession::partial_sign`], and is deliberately not
//! serializable - a restart always starts a fresh signing session.

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::opcodes;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::taproot::TaprootBuilder;

use crate::ln::channel_keys::{DelayedPaymentKey, RevocationKey};

use musig2::{AggNonce, BinaryEncoding, CompactSignature, KeyAggContext, PartialSignature, PubNonce, SecNonce};

/// The BIP-341 "nothing up my sleeve" point, used as the unspendable internal key of script-only
/// taproot outputs.
const NUMS_POINT: [u8; 33] = [
	0x02, 0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9,
	0x7a, 0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce,
	0x80, 0x3a, 0xc0,
];

/// Returns the unspendable internal key used for script-only taproot outputs.
pub fn nums_internal_key() -> XOnlyPublicKey {
	XOnlyPublicKey::from_slice(&NUMS_POINT[1..]).expect("NUMS point is a valid x coordinate")
}

fn musig_point(key: &PublicKey) -> musig2::secp::Point {
	musig2::secp::Point::from_slice(&key.serialize())
		.expect("a valid secp256k1 key is a valid point")
}

/// Computes the MuSig2 key aggregation context for the two funding keys, ordered
/// lexicographically by their serializations (matching the 2-of-2 script ordering).
pub fn funding_key_agg_context(
	holder_funding_key: &PublicKey, counterparty_funding_key: &PublicKey,
) -> KeyAggContext {
	let mut keys = [musig_point(holder_funding_key), musig_point(counterparty_funding_key)];
	if counterparty_funding_key.serialize()[..] < holder_funding_key.serialize()[..] {
		keys.swap(0, 1);
	}
	KeyAggContext::new(keys).expect("two distinct valid points always aggregate")
}

/// The aggregated funding output key for a taproot channel.
pub fn funding_aggregated_key(
	holder_funding_key: &PublicKey, counterparty_funding_key: &PublicKey,
) -> XOnlyPublicKey {
	let ctx = funding_key_agg_context(holder_funding_key, counterparty_funding_key);
	let point: musig2::secp::Point = ctx.aggregated_pubkey();
	XOnlyPublicKey::from_slice(&point.serialize()[1..])
		.expect("an aggregated point is a valid x coordinate")
}

/// The P2TR script for a taproot channel's funding output (MuSig2 key path only).
pub fn make_taproot_funding_script(
	holder_funding_key: &PublicKey, counterparty_funding_key: &PublicKey,
) -> ScriptBuf {
	let secp_ctx = Secp256k1::verification_only();
	let key = funding_aggregated_key(holder_funding_key, counterparty_funding_key);
	ScriptBuf::new_p2tr(&secp_ctx, key, None)
}

/// The tapscript leaf enforcing the broadcaster's `to_self_delay` on its `to_local` output.
pub fn get_to_local_delay_script(
	delayed_payment_key: &DelayedPaymentKey, contest_delay: u16,
) -> ScriptBuf {
	Builder::new()
		.push_x_only_key(&delayed_payment_key.to_public_key().x_only_public_key().0)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.push_int(contest_delay as i64)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_DROP)
		.into_script()
}

/// The tapscript leaf allowing the countersignatory to sweep a revoked `to_local` output.
pub fn get_to_local_revocation_script(revocation_key: &RevocationKey) -> ScriptBuf {
	Builder::new()
		.push_x_only_key(&revocation_key.to_public_key().x_only_public_key().0)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// The P2TR script for a taproot commitment's `to_local` output: an unspendable key path with a
/// two-leaf tree carrying the relative-timelock branch and the revocation branch.
pub fn make_taproot_to_local_script(
	revocation_key: &RevocationKey, contest_delay: u16, delayed_payment_key: &DelayedPaymentKey,
) -> ScriptBuf {
	let secp_ctx = Secp256k1::verification_only();
	let spend_info = TaprootBuilder::new()
		.add_leaf(1, get_to_local_delay_script(delayed_payment_key, contest_delay))
		.expect("the tree shape is static")
		.add_leaf(1, get_to_local_revocation_script(revocation_key))
		.expect("the tree shape is static")
		.finalize(&secp_ctx, nums_internal_key())
		.expect("a two-leaf tree always finalizes");
	ScriptBuf::new_p2tr(&secp_ctx, spend_info.internal_key(), spend_info.merkle_root())
}

/// The P2TR script for a taproot commitment's `to_remote` output: a single leaf enforcing
/// CSV(1) under the countersignatory's key.
pub fn make_taproot_to_remote_script(payment_key: &PublicKey) -> ScriptBuf {
	let secp_ctx = Secp256k1::verification_only();
	let leaf = Builder::new()
		.push_x_only_key(&payment_key.x_only_public_key().0)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.push_int(1)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_DROP)
		.into_script();
	let spend_info = TaprootBuilder::new()
		.add_leaf(0, leaf)
		.expect("the tree shape is static")
		.finalize(&secp_ctx, nums_internal_key())
		.expect("a single-leaf tree always finalizes");
	ScriptBuf::new_p2tr(&secp_ctx, spend_info.internal_key(), spend_info.merkle_root())
}

/// The P2TR script for a taproot commitment's anchor output: key path under the owner's funding
/// key, with an anyone-can-spend-after-16-blocks leaf.
pub fn make_taproot_anchor_script(funding_key: &PublicKey) -> ScriptBuf {
	let secp_ctx = Secp256k1::verification_only();
	let leaf = Builder::new()
		.push_int(16)
		.push_opcode(opcodes::all::OP_CSV)
		.into_script();
	let spend_info = TaprootBuilder::new()
		.add_leaf(0, leaf)
		.expect("the tree shape is static")
		.finalize(&secp_ctx, funding_key.x_only_public_key().0)
		.expect("a single-leaf tree always finalizes");
	ScriptBuf::new_p2tr(&secp_ctx, spend_info.internal_key(), spend_info.merkle_root())
}

/// A MuSig2 secret nonce with enforced single use.
///
/// There is intentionally no way to clone, copy or serialize this - once taken it is gone, and a
/// nonce which was never used simply gets dropped.
pub struct MusigNonce {
	secnonce: Option<SecNonce>,
}

impl MusigNonce {
	/// Generates a fresh nonce for a signing session.
	///
	/// `session_entropy` must be unique per session; the signing key and message are mixed in as
	/// a misuse defence, matching the MuSig2 recommendation.
	pub fn generate(
		session_entropy: [u8; 32], signing_key: &SecretKey, message: &[u8],
	) -> MusigNonce {
		let mut seed_engine = Sha256::engine();
		seed_engine.input(&session_entropy);
		seed_engine.input(&signing_key.secret_bytes());
		seed_engine.input(message);
		let seed = Sha256::from_engine(seed_engine).to_byte_array();
		let secnonce = SecNonce::build(seed).with_message(&message).build();
		MusigNonce { secnonce: Some(secnonce) }
	}

	/// The public counterpart, safe to hand to the counterparty.
	pub fn public_nonce(&self) -> Option<PubNonce> {
		self.secnonce.as_ref().map(|s| s.public_nonce())
	}

	fn take(&mut self) -> Option<SecNonce> {
		self.secnonce.take()
	}
}

/// A two-round MuSig2 signing session over the taproot funding output: nonce exchange, then
/// partial signatures, aggregated locally into a single Schnorr signature.
pub struct MusigSession {
	key_agg_ctx: KeyAggContext,
	local_nonce: MusigNonce,
	local_public_nonce: PubNonce,
	remote_public_nonce: Option<PubNonce>,
}

/// Things which can go wrong in a MuSig2 round.
#[derive(Debug, PartialEq, Eq)]
pub enum MusigError {
	/// The session is missing the counterparty's public nonce.
	MissingRemoteNonce,
	/// This session's secret nonce was already consumed.
	NonceAlreadyUsed,
	/// The counterparty's partial signature did not verify against their nonce and key.
	InvalidPartialSignature,
}

impl MusigSession {
	/// Starts a session for the given funding keys. The local nonce is created here and can be
	/// used exactly once.
	pub fn new(
		holder_funding_key: &PublicKey, counterparty_funding_key: &PublicKey,
		session_entropy: [u8; 32], signing_key: &SecretKey, message: &[u8],
	) -> MusigSession {
		let key_agg_ctx = funding_key_agg_context(holder_funding_key, counterparty_funding_key);
		let local_nonce = MusigNonce::generate(session_entropy, signing_key, message);
		let local_public_nonce =
			local_nonce.public_nonce().expect("a fresh nonce is always present");
		MusigSession { key_agg_ctx, local_nonce, local_public_nonce, remote_public_nonce: None }
	}

	/// The nonce to send to the counterparty.
	pub fn local_public_nonce(&self) -> PubNonce {
		self.local_public_nonce.clone()
	}

	/// Records the counterparty's public nonce, completing round one.
	pub fn receive_remote_nonce(&mut self, nonce: PubNonce) {
		self.remote_public_nonce = Some(nonce);
	}

	fn aggregated_nonce(&self) -> Result<AggNonce, MusigError> {
		let remote = self.remote_public_nonce.as_ref().ok_or(MusigError::MissingRemoteNonce)?;
		Ok(AggNonce::sum([self.local_public_nonce.clone(), remote.clone()]))
	}

	/// Produces our partial signature over `message`, consuming the local secret nonce.
	pub fn partial_sign(
		&mut self, signing_key: &SecretKey, message: &[u8],
	) -> Result<PartialSignature, MusigError> {
		let agg_nonce = self.aggregated_nonce()?;
		let secnonce = self.local_nonce.take().ok_or(MusigError::NonceAlreadyUsed)?;
		let seckey = musig2::secp::Scalar::from_slice(&signing_key.secret_bytes())
			.expect("a valid secret key is a valid scalar");
		musig2::sign_partial(&self.key_agg_ctx, seckey, secnonce, &agg_nonce, message)
			.map_err(|_| MusigError::InvalidPartialSignature)
	}

	/// Verifies the counterparty's partial signature and aggregates it with ours into the final
	/// Schnorr signature for the funding input.
	pub fn aggregate(
		&self, our_partial: PartialSignature, their_partial: PartialSignature,
		their_key: &PublicKey, message: &[u8],
	) -> Result<bitcoin::secp256k1::schnorr::Signature, MusigError> {
		let agg_nonce = self.aggregated_nonce()?;
		let their_nonce =
			self.remote_public_nonce.as_ref().ok_or(MusigError::MissingRemoteNonce)?;
		musig2::verify_partial(
			&self.key_agg_ctx,
			their_partial,
			&agg_nonce,
			musig_point(their_key),
			their_nonce,
			message,
		)
		.map_err(|_| MusigError::InvalidPartialSignature)?;

		let sig: CompactSignature = musig2::aggregate_partial_signatures(
			&self.key_agg_ctx,
			&agg_nonce,
			[our_partial, their_partial],
			message,
		)
		.map_err(|_| MusigError::InvalidPartialSignature)?;
		bitcoin::secp256k1::schnorr::Signature::from_slice(&sig.to_bytes())
			.map_err(|_| MusigError::InvalidPartialSignature)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::Secp256k1;

	#[test]
	fn nonce_is_single_use() {
		let sk = SecretKey::from_slice(&[11; 32]).unwrap();
		let mut nonce = MusigNonce::generate([1; 32], &sk, b"msg");
		assert!(nonce.public_nonce().is_some());
		assert!(nonce.take().is_some());
		assert!(nonce.take().is_none());
		assert!(nonce.public_nonce().is_none());
	}

	#[test]
	fn musig_two_party_signing() {
		let secp_ctx = Secp256k1::new();
		let sk_a = SecretKey::from_slice(&[21; 32]).unwrap();
		let sk_b = SecretKey::from_slice(&[22; 32]).unwrap();
		let pk_a = PublicKey::from_secret_key(&secp_ctx, &sk_a);
		let pk_b = PublicKey::from_secret_key(&secp_ctx, &sk_b);
		let message = [42u8; 32];

		let mut session_a = MusigSession::new(&pk_a, &pk_b, [1; 32], &sk_a, &message);
		let mut session_b = MusigSession::new(&pk_b, &pk_a, [2; 32], &sk_b, &message);
		session_a.receive_remote_nonce(session_b.local_public_nonce());
		session_b.receive_remote_nonce(session_a.local_public_nonce());

		let partial_a = session_a.partial_sign(&sk_a, &message).unwrap();
		let partial_b = session_b.partial_sign(&sk_b, &message).unwrap();

		let sig = session_a.aggregate(partial_a, partial_b, &pk_b, &message).unwrap();

		// The aggregate signature verifies under the aggregated x-only key
		let agg_key = funding_aggregated_key(&pk_a, &pk_b);
		let msg = bitcoin::secp256k1::Message::from_digest(message);
		assert!(secp_ctx.verify_schnorr(&sig, &msg, &agg_key).is_ok());

		// A second signing attempt on the same session must fail: the nonce is gone.
		assert_eq!(session_a.partial_sign(&sk_a, &message).err(), Some(MusigError::NonceAlreadyUsed));
	}

	#[test]
	fn taproot_output_scripts_are_p2tr() {
		let secp_ctx = Secp256k1::new();
		let sk = SecretKey::from_slice(&[31; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp_ctx, &sk);
		let revocation_key = RevocationKey(pk);
		let delayed_key = DelayedPaymentKey(pk);

		assert!(make_taproot_funding_script(&pk, &pk).is_p2tr());
		assert!(make_taproot_to_local_script(&revocation_key, 144, &delayed_key).is_p2tr());
		assert!(make_taproot_to_remote_script(&pk).is_p2tr());
		assert!(make_taproot_anchor_script(&pk).is_p2tr());
	}
}
