// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various wire-level types used throughout the channel protocol.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;

use crate::chain::transaction::OutPoint;
use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

use core::fmt;
use std::io::Read;

/// A unique 32-byte identifier for a channel.
///
/// A v1 channel id is the funding txid XORed (in the last two bytes) with the funding output
/// index. During channel setup, before the funding transaction exists, a temporary random id is
/// used instead.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
	/// Create a v1 channel id from a funding outpoint.
	pub fn v1_from_funding_outpoint(outpoint: OutPoint) -> Self {
		let mut res = [0; 32];
		res[..].copy_from_slice(&outpoint.txid[..]);
		res[30] ^= ((outpoint.index >> 8) & 0xff) as u8;
		res[31] ^= ((outpoint.index >> 0) & 0xff) as u8;
		Self(res)
	}

	/// Create a temporary channel id from pre-drawn entropy.
	pub fn temporary_from_entropy(entropy: [u8; 32]) -> Self {
		Self(entropy)
	}

	/// Create a channel id from raw bytes.
	pub fn from_bytes(data: [u8; 32]) -> Self {
		Self(data)
	}

	/// An all-zero channel id, which error and warning messages use to indicate they apply to all
	/// channels with the sending peer.
	pub fn new_zero() -> Self {
		Self([0; 32])
	}

	/// Whether this is the all-zero "applies to all channels" id.
	pub fn is_zero(&self) -> bool {
		self.0[..] == [0; 32]
	}
}

impl Writeable for ChannelId {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.0.write(w)
	}
}
impl Readable for ChannelId {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(ChannelId(buf))
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		crate::util::logger::DebugBytes(&self.0).fmt(f)
	}
}
impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// The payment hash of an HTLC: the SHA256 of a [`PaymentPreimage`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaymentHash(pub [u8; 32]);

/// The preimage whose SHA256 is a [`PaymentHash`] - proof of payment, and the key which unlocks
/// an HTLC-success spend.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
	/// The payment hash committing to this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).to_byte_array())
	}
}

macro_rules! hash_newtype_ser {
	($ty:ident) => {
		impl Writeable for $ty {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
				self.0.write(w)
			}
		}
		impl Readable for $ty {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let buf: [u8; 32] = Readable::read(r)?;
				Ok($ty(buf))
			}
		}
		impl fmt::Display for $ty {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				crate::util::logger::DebugBytes(&self.0).fmt(f)
			}
		}
		impl fmt::Debug for $ty {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				fmt::Display::fmt(self, f)
			}
		}
	};
}
hash_newtype_ser!(PaymentHash);
hash_newtype_ser!(PaymentPreimage);

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::hashes::Hash;
	use bitcoin::hash_types::Txid;

	#[test]
	fn test_channel_id_v1_derivation() {
		let txid = Txid::from_byte_array([2; 32]);
		let id_0 = ChannelId::v1_from_funding_outpoint(OutPoint { txid, index: 0 });
		assert_eq!(id_0.0[..30], [2; 32][..30]);
		assert_eq!(id_0.0[31], 2);
		let id_513 = ChannelId::v1_from_funding_outpoint(OutPoint { txid, index: 0x0201 });
		// 0x02 ^ 0x02 == 0, 0x02 ^ 0x01 == 3
		assert_eq!(id_513.0[30], 0);
		assert_eq!(id_513.0[31], 3);
		assert!(!id_513.is_zero());
	}

	#[test]
	fn test_preimage_to_hash() {
		let preimage = PaymentPreimage([42; 32]);
		let hash = preimage.payment_hash();
		assert_eq!(hash.0, Sha256::hash(&[42; 32]).to_byte_array());
	}
}
