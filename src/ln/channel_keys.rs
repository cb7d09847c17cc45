// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Keys used to generate commitment transactions.
//!
//! Each commitment transaction uses a fresh set of transaction keys, all derived by tweaking a
//! static per-channel basepoint with that commitment's per-commitment point. The per-commitment
//! point itself comes from a deterministic secret chain seeded at channel open, which lets a
//! party reveal old secrets compactly when revoking.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

use std::io::Read;

/// Build the commitment secret from the seed and the commitment number.
///
/// Walks the 48-bit hash chain: for each set bit of `idx` (high to low), flip that bit in the
/// running secret and hash. Secrets for lower indices can thus be derived from higher ones, but
/// not vice versa.
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).to_byte_array();
		}
	}
	res
}

/// Build the per-commitment point corresponding to [`build_commitment_secret`] at `idx`.
pub fn build_commitment_point<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, commitment_seed: &[u8; 32], idx: u64,
) -> PublicKey {
	let secret = SecretKey::from_slice(&build_commitment_secret(commitment_seed, idx))
		.expect("A SHA256 output is a valid secret key with overwhelming probability");
	PublicKey::from_secret_key(secp_ctx, &secret)
}

/// Derives a per-commitment-transaction public key (eg an htlc key or a delayed_payment key)
/// from the base point and the per-commitment point:
/// `basepoint + SHA256(per_commitment_point || basepoint) * G`.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
fn derive_public_key<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey,
) -> PublicKey {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	let hashkey = PublicKey::from_secret_key(
		&secp_ctx,
		&SecretKey::from_slice(&res)
			.expect("Hashes should always be valid keys unless SHA-256 is broken"),
	);
	base_point.combine(&hashkey)
		.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak contains the hash of the key.")
}

/// Derives the private form of [`derive_public_key`] when the basepoint secret is known.
pub fn derive_private_key<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey,
) -> SecretKey {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&PublicKey::from_secret_key(&secp_ctx, &base_secret).serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	base_secret
		.clone()
		.add_tweak(&Scalar::from_be_bytes(res).unwrap())
		.expect("Addition only fails if the tweak is the inverse of the key")
}

macro_rules! basepoint_impl {
	($BasepointT:ty, $KeyT:ty, $KeyName:expr) => {
		impl $BasepointT {
			/// Get inner Public Key
			pub fn to_public_key(&self) -> PublicKey {
				self.0
			}
		}

		impl From<PublicKey> for $BasepointT {
			fn from(value: PublicKey) -> Self {
				Self(value)
			}
		}

		impl $KeyT {
			#[doc = concat!("Derive the ", $KeyName, " for a commitment from its basepoint and per-commitment point.")]
			pub fn from_basepoint<T: secp256k1::Signing>(
				secp_ctx: &Secp256k1<T>, basepoint: &$BasepointT,
				per_commitment_point: &PublicKey,
			) -> Self {
				Self(derive_public_key(secp_ctx, per_commitment_point, &basepoint.0))
			}

			#[doc = concat!("Build the ", $KeyName, " directly from the already-derived secret.")]
			pub fn from_secret_key<T: secp256k1::Signing>(
				secp_ctx: &Secp256k1<T>, sk: &SecretKey,
			) -> Self {
				Self(PublicKey::from_secret_key(&secp_ctx, &sk))
			}

			/// Get inner Public Key
			pub fn to_public_key(&self) -> PublicKey {
				self.0
			}
		}
	};
}

macro_rules! key_read_write {
	($SelfT:ty) => {
		impl Writeable for $SelfT {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				self.0.write(w)
			}
		}

		impl Readable for $SelfT {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let key: PublicKey = Readable::read(r)?;
				Ok(Self(key))
			}
		}
	};
}

/// Basepoint from which the CSV-delayed `to_local` key of each commitment is derived. A watcher
/// given this basepoint can reconstruct the delayed payment key for any revealed commitment.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct DelayedPaymentBasepoint(pub PublicKey);

/// The key to which a commitment's `to_local` output (and the output of each second-stage HTLC
/// transaction) pays, spendable by the broadcaster only after the agreed CSV delay.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DelayedPaymentKey(pub PublicKey);

basepoint_impl!(DelayedPaymentBasepoint, DelayedPaymentKey, "delayedpubkey");
key_read_write!(DelayedPaymentBasepoint);
key_read_write!(DelayedPaymentKey);

/// Basepoint from which each commitment's HTLC keys are derived.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct HtlcBasepoint(pub PublicKey);

/// The per-commitment key encumbering HTLC outputs, used to claim them on success or timeout.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct HtlcKey(pub PublicKey);

basepoint_impl!(HtlcBasepoint, HtlcKey, "htlcpubkey");
key_read_write!(HtlcBasepoint);
key_read_write!(HtlcKey);

/// Basepoint identifying a party's main balance. Also feeds the obscured commitment number (both
/// parties' payment basepoints are hashed together to produce the 48-bit XOR mask).
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct PaymentBasepoint(pub PublicKey);

/// The key a counterparty's `to_remote` output pays to.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PaymentKey(pub PublicKey);

basepoint_impl!(PaymentBasepoint, PaymentKey, "paymentpubkey");
key_read_write!(PaymentBasepoint);
key_read_write!(PaymentKey);

/// Basepoint from which a counterparty's revocation keys are derived. Handing this to a watcher
/// lets it construct justice transactions for any revoked commitment.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct RevocationBasepoint(pub PublicKey);

impl RevocationBasepoint {
	/// Get inner Public Key
	pub fn to_public_key(&self) -> PublicKey {
		self.0
	}
}

impl From<PublicKey> for RevocationBasepoint {
	fn from(value: PublicKey) -> Self {
		Self(value)
	}
}
key_read_write!(RevocationBasepoint);

/// The key which gates the penalty spend of a revoked commitment's outputs.
///
/// Unlike the other per-commitment keys this is a two-sided construction, so that it is only
/// computable once the broadcaster has revealed the matching per-commitment secret:
/// `revocation_basepoint * SHA256(revocation_basepoint || per_commitment_point)
///  + per_commitment_point * SHA256(per_commitment_point || revocation_basepoint)`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct RevocationKey(pub PublicKey);

impl RevocationKey {
	/// Derives the revocation public key. The per-commitment point always comes from the party
	/// which may broadcast (and thus may cheat); the basepoint always comes from the punisher.
	///
	/// Note that this is infallible iff we trust that at least one of the two input keys are
	/// randomly generated (ie our own).
	pub fn from_basepoint<T: secp256k1::Verification>(
		secp_ctx: &Secp256k1<T>, basepoint: &RevocationBasepoint, per_commitment_point: &PublicKey,
	) -> Self {
		let rev_append_commit_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&basepoint.to_public_key().serialize());
			sha.input(&per_commitment_point.serialize());

			Sha256::from_engine(sha).to_byte_array()
		};
		let commit_append_rev_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&per_commitment_point.serialize());
			sha.input(&basepoint.to_public_key().serialize());

			Sha256::from_engine(sha).to_byte_array()
		};

		let countersignatory_contrib = basepoint
			.to_public_key()
			.mul_tweak(&secp_ctx, &Scalar::from_be_bytes(rev_append_commit_hash_key).unwrap())
			.expect("Multiplying a valid public key by a hash is expected to never fail per secp256k1 docs");
		let broadcaster_contrib = per_commitment_point
			.mul_tweak(&secp_ctx, &Scalar::from_be_bytes(commit_append_rev_hash_key).unwrap())
			.expect("Multiplying a valid public key by a hash is expected to never fail per secp256k1 docs");
		let pk = countersignatory_contrib.combine(&broadcaster_contrib)
			.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak commits to the key.");
		Self(pk)
	}

	/// Derives the private revocation key, possible only once the broadcaster's per-commitment
	/// secret is known (ie once the corresponding commitment has been revoked).
	pub fn derive_private_revocation_key<T: secp256k1::Signing>(
		secp_ctx: &Secp256k1<T>, per_commitment_secret: &SecretKey,
		countersignatory_revocation_base_secret: &SecretKey,
	) -> SecretKey {
		let countersignatory_revocation_base_point =
			PublicKey::from_secret_key(&secp_ctx, &countersignatory_revocation_base_secret);
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

		let rev_append_commit_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&countersignatory_revocation_base_point.serialize());
			sha.input(&per_commitment_point.serialize());

			Sha256::from_engine(sha).to_byte_array()
		};
		let commit_append_rev_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&per_commitment_point.serialize());
			sha.input(&countersignatory_revocation_base_point.serialize());

			Sha256::from_engine(sha).to_byte_array()
		};

		let countersignatory_contrib = countersignatory_revocation_base_secret
			.clone()
			.mul_tweak(&Scalar::from_be_bytes(rev_append_commit_hash_key).unwrap())
			.expect("Multiplying a valid secret key by a hash is expected to never fail per secp256k1 docs");
		let broadcaster_contrib = per_commitment_secret
			.clone()
			.mul_tweak(&Scalar::from_be_bytes(commit_append_rev_hash_key).unwrap())
			.expect("Multiplying a valid secret key by a hash is expected to never fail per secp256k1 docs");
		countersignatory_contrib
			.add_tweak(&Scalar::from_be_bytes(broadcaster_contrib.secret_bytes()).unwrap())
			.expect("Addition only fails if the tweak is the inverse of the key")
	}

	/// Get inner Public Key
	pub fn to_public_key(&self) -> PublicKey {
		self.0
	}
}
key_read_write!(RevocationKey);

#[cfg(test)]
mod tests {
	use super::{build_commitment_secret, derive_private_key, derive_public_key, RevocationBasepoint, RevocationKey};
	use bitcoin::hashes::hex::FromHex;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	#[test]
	fn test_key_derivation() {
		// Test vectors from BOLT 3 Appendix E:
		let secp_ctx = Secp256k1::new();

		let base_secret = SecretKey::from_slice(
			&<Vec<u8>>::from_hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
				.unwrap()[..],
		)
		.unwrap();
		let per_commitment_secret = SecretKey::from_slice(
			&<Vec<u8>>::from_hex("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100")
				.unwrap()[..],
		)
		.unwrap();

		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		assert_eq!(
			base_point.serialize()[..],
			<Vec<u8>>::from_hex("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2")
				.unwrap()[..]
		);

		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		assert_eq!(
			per_commitment_point.serialize()[..],
			<Vec<u8>>::from_hex("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486")
				.unwrap()[..]
		);

		assert_eq!(
			derive_public_key(&secp_ctx, &per_commitment_point, &base_point).serialize()[..],
			<Vec<u8>>::from_hex("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5")
				.unwrap()[..]
		);

		assert_eq!(
			derive_private_key(&secp_ctx, &per_commitment_point, &base_secret)[..],
			<Vec<u8>>::from_hex("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f")
				.unwrap()[..]
		);

		assert_eq!(
			RevocationKey::from_basepoint(
				&secp_ctx,
				&RevocationBasepoint::from(base_point),
				&per_commitment_point
			)
			.to_public_key()
			.serialize()[..],
			<Vec<u8>>::from_hex("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0")
				.unwrap()[..]
		);

		assert_eq!(
			RevocationKey::derive_private_revocation_key(
				&secp_ctx,
				&per_commitment_secret,
				&base_secret
			)[..],
			<Vec<u8>>::from_hex("d09ffff62ddb2297ab000cc85bcb4283fdeb6aa052affbc9dddcf33b61078110")
				.unwrap()[..]
		);
	}

	#[test]
	fn test_per_commitment_generation() {
		// BOLT 3 Appendix D: generation tests.
		let seed_ff = [0xff; 32];
		assert_eq!(
			build_commitment_secret(&seed_ff, 281474976710655)[..],
			<Vec<u8>>::from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc")
				.unwrap()[..]
		);
		assert_eq!(
			build_commitment_secret(&seed_ff, 0xaaaaaaaaaaa)[..],
			<Vec<u8>>::from_hex("56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528")
				.unwrap()[..]
		);
		assert_eq!(
			build_commitment_secret(&seed_ff, 0x555555555555)[..],
			<Vec<u8>>::from_hex("9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31")
				.unwrap()[..]
		);
		let seed_00 = [0x00; 32];
		assert_eq!(
			build_commitment_secret(&seed_00, 281474976710655)[..],
			<Vec<u8>>::from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148")
				.unwrap()[..]
		);
		let seed_0101 = <Vec<u8>>::from_hex(
			"0101010101010101010101010101010101010101010101010101010101010101",
		)
		.unwrap();
		let mut seed = [0; 32];
		seed.copy_from_slice(&seed_0101);
		assert_eq!(
			build_commitment_secret(&seed, 1)[..],
			<Vec<u8>>::from_hex("915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c")
				.unwrap()[..]
		);
	}
}
