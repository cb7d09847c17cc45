// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages and the error types produced when decoding them.
//!
//! Every channel message begins with a 2-byte type discriminant (see [`Encode`]) followed by the
//! message body: fixed fields in order, then an extension TLV stream running to the end of the
//! message. The transport which frames and routes messages lives outside this crate; only the
//! bodies are defined here.

use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Witness;

use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::util::ser::{TransactionU16LenLimited, Writeable};

use core::fmt;

/// 21 million * 10^8 * 1000
pub const MAX_VALUE_MSAT: u64 = 21_000_000_0000_0000_000;

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	UnknownVersion,
	/// Unknown feature mandating we fail to parse message (e.g., TLV with an even, unknown type)
	UnknownRequiredFeature,
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, text wasn't UTF-8, TLV was
	/// syntactically incorrect, etc
	InvalidValue,
	/// The buffer to be read was too short
	ShortRead,
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// Error from [`std::io`]
	Io(std::io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::UnknownVersion => f.write_str("Unknown version byte in serialization"),
			DecodeError::UnknownRequiredFeature => {
				f.write_str("Unknown required feature preventing decode")
			},
			DecodeError::InvalidValue => {
				f.write_str("Nonsense bytes didn't map to the type they were interpreted as")
			},
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::BadLengthDescriptor => {
				f.write_str("A length descriptor in the packet didn't describe the later data correctly")
			},
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl From<std::io::Error> for DecodeError {
	fn from(e: std::io::Error) -> Self {
		if e.kind() == std::io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// A serial id assigned to each input and output contributed to an interactively-constructed
/// transaction; its parity identifies the contributor (initiator even, acceptor odd).
pub type SerialId = u64;

/// BOLT 4 onion packet including hop data for the next peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
	/// BOLT 4 version number.
	pub version: u8,
	/// The ephemeral public key used to derive the shared secret for this hop.
	pub public_key: PublicKey,
	/// 1300 bytes encrypted payload for the next hop.
	pub hop_data: [u8; 1300],
	/// HMAC to verify the integrity of hop_data.
	pub hmac: [u8; 32],
}

impl_writeable!(OnionPacket, { version, public_key, hop_data, hmac });

/// The encrypted failure data relayed backwards for a failed HTLC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionErrorPacket {
	/// Opaque, encrypted failure data.
	pub data: Vec<u8>,
}

impl_writeable!(OnionErrorPacket, { data });

/// An `open_channel` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenChannel {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// A temporary channel ID, until the funding outpoint is announced
	pub temporary_channel_id: ChannelId,
	/// The channel value
	pub funding_satoshis: u64,
	/// The amount to push to the counterparty as part of the open, in milli-satoshi
	pub push_msat: u64,
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The feerate for the commitment transaction set by the sender, in satoshi per 1000 weight
	pub feerate_per_kw: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment basepoint used in paying to the sender
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// Channel flags; only the low bit (announce_channel) is currently defined
	pub channel_flags: u8,
}

impl_writeable_msg!(OpenChannel, {
	chain_hash,
	temporary_channel_id,
	funding_satoshis,
	push_msat,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	feerate_per_kw,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point,
	channel_flags,
}, {});

/// An `accept_channel` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptChannel {
	/// A temporary channel ID, until the funding outpoint is announced
	pub temporary_channel_id: ChannelId,
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// Minimum depth of the funding transaction before the channel is considered open
	pub minimum_depth: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment basepoint used in paying to the sender
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
}

impl_writeable_msg!(AcceptChannel, {
	temporary_channel_id,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	minimum_depth,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point,
}, {});

/// An `open_channel2` message to be sent to or received from a peer, beginning a dual-funded
/// (interactively constructed) channel open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenChannelV2 {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// A temporary channel ID derived using a zeroed out payment basepoint for this channel
	pub temporary_channel_id: ChannelId,
	/// The feerate for the funding transaction set by the channel initiator
	pub funding_feerate_sat_per_1000_weight: u32,
	/// The feerate for the commitment transaction set by the channel initiator
	pub commitment_feerate_sat_per_1000_weight: u32,
	/// Part of the channel value contributed by the channel initiator
	pub funding_satoshis: u64,
	/// The threshold below which outputs on transactions broadcast by the channel initiator will
	/// be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards channel initiator, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum HTLC size incoming to channel initiator, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards channel initiator
	pub max_accepted_htlcs: u16,
	/// The locktime for the funding transaction
	pub locktime: u32,
	/// The channel initiator's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment basepoint used in paying to the channel initiator
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to channel initiator for transactions broadcast by channel
	/// initiator
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to channel initiator
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-channel-initiator transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// The second to-be-broadcast-by-channel-initiator transaction's per commitment point
	pub second_per_commitment_point: PublicKey,
	/// Channel flags
	pub channel_flags: u8,
	/// Optionally, a requirement that only confirmed inputs can be added
	pub require_confirmed_inputs: Option<()>,
}

impl_writeable_msg!(OpenChannelV2, {
	chain_hash,
	temporary_channel_id,
	funding_feerate_sat_per_1000_weight,
	commitment_feerate_sat_per_1000_weight,
	funding_satoshis,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	locktime,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point,
	second_per_commitment_point,
	channel_flags,
}, {
	(2, require_confirmed_inputs, option),
});

/// An `accept_channel2` message to be sent to or received from a peer in response to an
/// [`OpenChannelV2`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptChannelV2 {
	/// The same temporary channel ID as given in the `open_channel2` message
	pub temporary_channel_id: ChannelId,
	/// Part of the channel value contributed by the channel acceptor
	pub funding_satoshis: u64,
	/// The threshold below which outputs on transactions broadcast by the channel acceptor will
	/// be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards channel acceptor, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum HTLC size incoming to channel acceptor, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// Minimum depth of the funding transaction before the channel is considered open
	pub minimum_depth: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards channel acceptor
	pub max_accepted_htlcs: u16,
	/// The channel acceptor's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment basepoint used in paying to the channel acceptor
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to channel acceptor for transactions broadcast by channel
	/// acceptor
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to channel acceptor
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-channel-acceptor transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// The second to-be-broadcast-by-channel-acceptor transaction's per commitment point
	pub second_per_commitment_point: PublicKey,
	/// Optionally, a requirement that only confirmed inputs can be added
	pub require_confirmed_inputs: Option<()>,
	/// A response to a pending liquidity purchase request, signed by the acceptor's node key
	pub will_fund: Option<WillFund>,
}

impl_writeable_msg!(AcceptChannelV2, {
	temporary_channel_id,
	funding_satoshis,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	htlc_minimum_msat,
	minimum_depth,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point,
	second_per_commitment_point,
}, {
	(2, require_confirmed_inputs, option),
	(3, will_fund, option),
});

/// A `funding_created` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingCreated {
	/// A temporary channel ID, until the funding is established
	pub temporary_channel_id: ChannelId,
	/// The funding transaction ID
	pub funding_txid: Txid,
	/// The specific output index funding this channel
	pub funding_output_index: u16,
	/// The signature of the channel initiator on the initial commitment transaction to be
	/// broadcast by the channel acceptor
	pub signature: Signature,
}

impl_writeable_msg!(FundingCreated, {
	temporary_channel_id,
	funding_txid,
	funding_output_index,
	signature,
}, {});

/// A `funding_signed` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The signature of the channel acceptor on the initial commitment transaction to be
	/// broadcast by the channel initiator
	pub signature: Signature,
}

impl_writeable_msg!(FundingSigned, {
	channel_id,
	signature,
}, {});

/// A `channel_ready` message to be sent to or received from a peer, indicating the funding
/// transaction has reached sufficient depth (or zero-conf was negotiated).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelReady {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The per-commitment point of the second commitment transaction
	pub next_per_commitment_point: PublicKey,
}

impl_writeable_msg!(ChannelReady, {
	channel_id,
	next_per_commitment_point,
}, {});

/// An `stfu` message requesting channel quiescence: a pause of all HTLC traffic before a
/// protocol which cannot tolerate concurrent updates (splicing).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stfu {
	/// The channel ID where quiescence is intended
	pub channel_id: ChannelId,
	/// Initiator flag, 1 if initiating, 0 if replying to an stfu.
	pub initiator: u8,
}

impl_writeable_msg!(Stfu, {
	channel_id,
	initiator,
}, {});

/// The rates and amount of a liquidity purchase request attached to a splice or dual-funded
/// open: the initiator asks the acceptor to contribute `requested_amount_satoshis` in exchange
/// for a fee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFunding {
	/// The amount the sender is asking its peer to contribute, in satoshis.
	pub requested_amount_satoshis: u64,
	/// The flat fee quoted/accepted for the contribution, in satoshis.
	pub funding_fee_base_satoshis: u64,
	/// The proportional fee quoted/accepted, in millionths of the contributed amount.
	pub funding_fee_proportional_millionths: u32,
}

impl_writeable!(RequestFunding, {
	requested_amount_satoshis,
	funding_fee_base_satoshis,
	funding_fee_proportional_millionths
});

/// The acceptor's commitment to fund a liquidity purchase: the quoted rates, witnessed by a
/// signature from the acceptor's node key. An invalid witness signature fails the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WillFund {
	/// The rates the acceptor commits to, echoing the request.
	pub rates: RequestFunding,
	/// A signature by the acceptor's node key over the serialized `rates`.
	pub signature: Signature,
}

impl_writeable!(WillFund, { rates, signature });

/// A `splice_init` message to be sent by or received from the splice initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpliceInit {
	/// The channel ID where splicing is intended
	pub channel_id: ChannelId,
	/// The amount the splice initiator is intending to add to its channel balance (splice-in)
	/// or remove from its channel balance (splice-out).
	pub funding_contribution_satoshis: i64,
	/// The feerate for the new funding transaction, set by the splice initiator
	pub funding_feerate_perkw: u32,
	/// The locktime for the new funding transaction
	pub locktime: u32,
	/// The key of the sender (splice initiator) controlling the new funding transaction
	pub funding_pubkey: PublicKey,
	/// If set, only confirmed inputs added (by the splice acceptor) will be accepted
	pub require_confirmed_inputs: Option<()>,
	/// A request that the acceptor contribute funds, for a fee
	pub request_funding: Option<RequestFunding>,
}

impl_writeable_msg!(SpliceInit, {
	channel_id,
	funding_contribution_satoshis,
	funding_feerate_perkw,
	locktime,
	funding_pubkey,
}, {
	(2, require_confirmed_inputs, option), // `splice_init_tlvs`
	(3, request_funding, option),
});

/// A `splice_ack` message to be received by or sent to the splice initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpliceAck {
	/// The channel ID where splicing is intended
	pub channel_id: ChannelId,
	/// The amount the splice acceptor is intending to add to its channel balance (splice-in)
	/// or remove from its channel balance (splice-out).
	pub funding_contribution_satoshis: i64,
	/// The key of the sender (splice acceptor) controlling the new funding transaction
	pub funding_pubkey: PublicKey,
	/// If set, only confirmed inputs added (by the splice initiator) will be accepted
	pub require_confirmed_inputs: Option<()>,
	/// The signed response to a pending liquidity purchase request
	pub will_fund: Option<WillFund>,
}

impl_writeable_msg!(SpliceAck, {
	channel_id,
	funding_contribution_satoshis,
	funding_pubkey,
}, {
	(2, require_confirmed_inputs, option), // `splice_ack_tlvs`
	(3, will_fund, option),
});

/// A `splice_locked` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpliceLocked {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The ID of the new funding transaction that has been locked
	pub splice_txid: Txid,
}

impl_writeable_msg!(SpliceLocked, {
	channel_id,
	splice_txid,
}, {});

/// A `tx_add_input` message for adding an input during interactive transaction construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAddInput {
	/// The channel ID
	pub channel_id: ChannelId,
	/// A randomly chosen unique identifier for this input, which is even for initiators and odd
	/// for non-initiators.
	pub serial_id: SerialId,
	/// Serialized transaction that contains the output this input spends to verify that it is
	/// non-malleable. Omitted for the shared splice input.
	pub prevtx: Option<TransactionU16LenLimited>,
	/// The index of the output being spent
	pub prevtx_out: u32,
	/// The sequence number of this input
	pub sequence: u32,
	/// The ID of the previous funding transaction, when it is being added as an input during a
	/// splice (the shared input).
	pub shared_input_txid: Option<Txid>,
}

impl_writeable_msg!(TxAddInput, {
	channel_id,
	serial_id,
	prevtx,
	prevtx_out,
	sequence,
}, {
	(0, shared_input_txid, option), // `funding_txid`
});

/// A `tx_add_output` message for adding an output during interactive transaction construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAddOutput {
	/// The channel ID
	pub channel_id: ChannelId,
	/// A randomly chosen unique identifier for this output, which is even for initiators and odd
	/// for non-initiators.
	pub serial_id: SerialId,
	/// The satoshi value of the output
	pub sats: u64,
	/// The scriptPubKey for the output
	pub script: ScriptBuf,
}

impl_writeable_msg!(TxAddOutput, {
	channel_id,
	serial_id,
	sats,
	script,
}, {});

/// A `tx_remove_input` message for removing an input during interactive transaction construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRemoveInput {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The serial ID of the input to be removed
	pub serial_id: SerialId,
}

impl_writeable_msg!(TxRemoveInput, {
	channel_id,
	serial_id,
}, {});

/// A `tx_remove_output` message for removing an output during interactive transaction
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRemoveOutput {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The serial ID of the output to be removed
	pub serial_id: SerialId,
}

impl_writeable_msg!(TxRemoveOutput, {
	channel_id,
	serial_id,
}, {});

/// A `tx_complete` message signalling the conclusion of a peer's transaction contributions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxComplete {
	/// The channel ID
	pub channel_id: ChannelId,
}

impl_writeable_msg!(TxComplete, {
	channel_id,
}, {});

/// A `tx_signatures` message containing the sender's signatures for a transaction constructed
/// with interactive transaction construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxSignatures {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The TXID
	pub tx_hash: Txid,
	/// The list of witnesses, one for each of the sender's inputs in serial id order
	pub witnesses: Vec<Witness>,
	/// Optional signature for the shared (previous funding) input of a splice
	pub shared_input_signature: Option<Signature>,
}

impl_writeable_msg!(TxSignatures, {
	channel_id,
	tx_hash,
	witnesses,
}, {
	(0, shared_input_signature, option), // `signature`
});

/// A `tx_init_rbf` message which initiates a replacement of the transaction after it's been
/// completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInitRbf {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The locktime of the transaction
	pub locktime: u32,
	/// The feerate of the transaction, which must be strictly greater than the previous attempt
	pub feerate_sat_per_1000_weight: u32,
	/// The number of satoshis the sender will contribute to or, if negative, remove from
	/// (e.g. splice-out) the funding output of the transaction
	pub funding_output_contribution: Option<i64>,
}

impl_writeable_msg!(TxInitRbf, {
	channel_id,
	locktime,
	feerate_sat_per_1000_weight,
}, {
	(0, funding_output_contribution, option),
});

/// A `tx_ack_rbf` message which acknowledges replacement of the transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAckRbf {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The number of satoshis the sender will contribute to or, if negative, remove from
	/// (e.g. splice-out) the funding output of the transaction
	pub funding_output_contribution: Option<i64>,
}

impl_writeable_msg!(TxAckRbf, {
	channel_id,
}, {
	(0, funding_output_contribution, option),
});

/// A `tx_abort` message which signals the cancellation of an in-progress transaction negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAbort {
	/// The channel ID
	pub channel_id: ChannelId,
	/// Message data: a human-readable description of why the negotiation was aborted
	pub data: Vec<u8>,
}

impl_writeable_msg!(TxAbort, {
	channel_id,
	data,
}, {});

/// A `shutdown` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shutdown {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The destination of this peer's funds on closing.
	///
	/// Must be in one of these forms: P2PKH, P2SH, P2WPKH, P2WSH, P2TR.
	pub scriptpubkey: ScriptBuf,
}

impl_writeable_msg!(Shutdown, {
	channel_id,
	scriptpubkey,
}, {});

/// The minimum and maximum fees which the sender is willing to place on the closing transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosingSignedFeeRange {
	/// The minimum absolute fee, in satoshis, which the sender is willing to place on the closing
	/// transaction
	pub min_fee_satoshis: u64,
	/// The maximum absolute fee, in satoshis, which the sender is willing to place on the closing
	/// transaction
	pub max_fee_satoshis: u64,
}

impl_writeable!(ClosingSignedFeeRange, { min_fee_satoshis, max_fee_satoshis });

/// A `closing_signed` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosingSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The proposed total fee for the closing transaction
	pub fee_satoshis: u64,
	/// A signature on the closing transaction
	pub signature: Signature,
	/// The minimum and maximum fees which the sender is willing to accept, provided only by new
	/// implementations which speed up the fee negotiation
	pub fee_range: Option<ClosingSignedFeeRange>,
}

impl_writeable_msg!(ClosingSigned, {
	channel_id,
	fee_satoshis,
	signature,
}, {
	(1, fee_range, option),
});

/// An `update_add_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID: strictly increasing per direction, starting at 0
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The onion routing packet with encrypted data for the next hop.
	pub onion_routing_packet: OnionPacket,
	/// The node's blinding key, if this HTLC is part of a blinded path.
	pub blinding_point: Option<PublicKey>,
}

impl_writeable_msg!(UpdateAddHTLC, {
	channel_id,
	htlc_id,
	amount_msat,
	payment_hash,
	cltv_expiry,
	onion_routing_packet,
}, {
	(0, blinding_point, option),
});

/// An `update_fulfill_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

impl_writeable_msg!(UpdateFulfillHTLC, {
	channel_id,
	htlc_id,
	payment_preimage,
}, {});

/// An `update_fail_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// Opaque, encrypted failure data to be relayed backwards
	pub reason: OnionErrorPacket,
}

impl_writeable_msg!(UpdateFailHTLC, {
	channel_id,
	htlc_id,
	reason,
}, {});

/// An `update_fail_malformed_htlc` message to be sent to or received from a peer, used when the
/// onion itself could not be processed and thus no encrypted failure can be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The SHA256 of the onion we received
	pub sha256_of_onion: [u8; 32],
	/// The failure code
	pub failure_code: u16,
}

impl_writeable_msg!(UpdateFailMalformedHTLC, {
	channel_id,
	htlc_id,
	sha256_of_onion,
	failure_code,
}, {});

/// Information about a batch of `commitment_signed` messages: during splicing several commitment
/// transactions are simultaneously live, and one `commitment_signed` is sent per active funding
/// transaction, all tagged with the same batch size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSignedBatch {
	/// How many `commitment_signed` messages comprise the logical batch
	pub batch_size: u16,
	/// The funding transaction whose commitment this message signs
	pub funding_txid: Txid,
}

impl_writeable!(CommitmentSignedBatch, { batch_size, funding_txid });

/// A `commitment_signed` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// A signature on the commitment transaction
	pub signature: Signature,
	/// Signatures on the HTLC transactions, in the order of the non-dust HTLC outputs
	pub htlc_signatures: Vec<Signature>,
	/// Information about the batch of messages this one belongs to, present whenever more than
	/// one funding transaction is active
	pub batch: Option<CommitmentSignedBatch>,
}

impl_writeable_msg!(CommitmentSigned, {
	channel_id,
	signature,
	htlc_signatures,
}, {
	(0, batch, option),
});

/// A `revoke_and_ack` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokeAndACK {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The secret corresponding to the per-commitment point of the now-revoked commitment
	pub per_commitment_secret: [u8; 32],
	/// The next sender-broadcast commitment transaction's per-commitment point
	pub next_per_commitment_point: PublicKey,
}

impl_writeable_msg!(RevokeAndACK, {
	channel_id,
	per_commitment_secret,
	next_per_commitment_point,
}, {});

/// An `update_fee` message to be sent to or received from a peer. Only the channel opener may
/// send this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFee {
	/// The channel ID
	pub channel_id: ChannelId,
	/// Fee rate per 1000-weight of the transaction
	pub feerate_per_kw: u32,
}

impl_writeable_msg!(UpdateFee, {
	channel_id,
	feerate_per_kw,
}, {});

/// A `channel_reestablish` message to be sent to or received from a peer on reconnection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelReestablish {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The next commitment number for the sender: one greater than the highest `commitment_signed`
	/// it has received (ie the number of the commitment it expects to be signed next)
	pub next_local_commitment_number: u64,
	/// The next commitment number for the recipient: one greater than the highest
	/// `revoke_and_ack` the sender has sent
	pub next_remote_commitment_number: u64,
	/// Proof that the sender knows the per-commitment secret of a specific commitment transaction
	/// belonging to the recipient (`option_data_loss_protect`)
	pub your_last_per_commitment_secret: [u8; 32],
	/// The sender's per-commitment point for their current commitment transaction
	/// (`option_data_loss_protect`)
	pub my_current_per_commitment_point: PublicKey,
	/// The txid of the interactively-constructed funding transaction the sender considers
	/// in-progress but not yet exchanged signatures for, if any
	pub next_funding_txid: Option<Txid>,
}

impl_writeable_msg!(ChannelReestablish, {
	channel_id,
	next_local_commitment_number,
	next_remote_commitment_number,
	your_last_per_commitment_secret,
	my_current_per_commitment_point,
}, {
	(0, next_funding_txid, option),
});

/// A `warning` message to be sent to or received from a peer.
///
/// Warnings indicate a protocol deviation which does not require closing the channel; the usual
/// response is to log, possibly disconnect, and carry on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarningMessage {
	/// The channel ID involved in the warning.
	///
	/// All-0s indicates a warning unrelated to a specific channel.
	pub channel_id: ChannelId,
	/// A possibly human-readable warning description.
	///
	/// The string should be sanitized before it is used (e.g. emitted to logs or printed to
	/// stdout). Otherwise, a well crafted error message may trigger a security vulnerability in
	/// the terminal emulator or the logging subsystem.
	pub data: String,
}

impl_writeable_msg!(WarningMessage, {
	channel_id,
	data,
}, {});

/// An `error` message to be sent to or received from a peer.
///
/// Receiving one for a live channel generally requires force-closing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
	/// The channel ID involved in the error.
	///
	/// All-0s indicates a channel-unrelated message.
	pub channel_id: ChannelId,
	/// A possibly human-readable error description.
	///
	/// The string should be sanitized before it is used (e.g. emitted to logs or printed to
	/// stdout). Otherwise, a well crafted error message may trigger a security vulnerability in
	/// the terminal emulator or the logging subsystem.
	pub data: String,
}

impl_writeable_msg!(ErrorMessage, {
	channel_id,
	data,
}, {});

/// Defines a type identifier for sending messages over the wire: every message is framed as the
/// 2-byte type followed by the message body.
pub trait Encode {
	/// The type identifying the message payload.
	const TYPE: u16;
}

impl Encode for WarningMessage {
	const TYPE: u16 = 1;
}
impl Encode for Stfu {
	const TYPE: u16 = 2;
}
impl Encode for ErrorMessage {
	const TYPE: u16 = 17;
}
impl Encode for OpenChannel {
	const TYPE: u16 = 32;
}
impl Encode for AcceptChannel {
	const TYPE: u16 = 33;
}
impl Encode for FundingCreated {
	const TYPE: u16 = 34;
}
impl Encode for FundingSigned {
	const TYPE: u16 = 35;
}
impl Encode for ChannelReady {
	const TYPE: u16 = 36;
}
impl Encode for Shutdown {
	const TYPE: u16 = 38;
}
impl Encode for ClosingSigned {
	const TYPE: u16 = 39;
}
impl Encode for OpenChannelV2 {
	const TYPE: u16 = 64;
}
impl Encode for AcceptChannelV2 {
	const TYPE: u16 = 65;
}
impl Encode for TxAddInput {
	const TYPE: u16 = 66;
}
impl Encode for TxAddOutput {
	const TYPE: u16 = 67;
}
impl Encode for TxRemoveInput {
	const TYPE: u16 = 68;
}
impl Encode for TxRemoveOutput {
	const TYPE: u16 = 69;
}
impl Encode for TxComplete {
	const TYPE: u16 = 70;
}
impl Encode for TxSignatures {
	const TYPE: u16 = 71;
}
impl Encode for TxInitRbf {
	const TYPE: u16 = 72;
}
impl Encode for TxAckRbf {
	const TYPE: u16 = 73;
}
impl Encode for TxAbort {
	const TYPE: u16 = 74;
}
impl Encode for SpliceInit {
	const TYPE: u16 = 80;
}
impl Encode for SpliceAck {
	const TYPE: u16 = 81;
}
impl Encode for SpliceLocked {
	const TYPE: u16 = 82;
}
impl Encode for UpdateAddHTLC {
	const TYPE: u16 = 128;
}
impl Encode for UpdateFulfillHTLC {
	const TYPE: u16 = 130;
}
impl Encode for UpdateFailHTLC {
	const TYPE: u16 = 131;
}
impl Encode for CommitmentSigned {
	const TYPE: u16 = 132;
}
impl Encode for RevokeAndACK {
	const TYPE: u16 = 133;
}
impl Encode for UpdateFee {
	const TYPE: u16 = 134;
}
impl Encode for UpdateFailMalformedHTLC {
	const TYPE: u16 = 135;
}
impl Encode for ChannelReestablish {
	const TYPE: u16 = 136;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::ser::{Readable, Writeable};
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::{Secp256k1, SecretKey};
	use std::io::Cursor;

	fn pubkey(byte: u8) -> PublicKey {
		let secp_ctx = Secp256k1::new();
		PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[byte; 32]).unwrap())
	}

	fn sig() -> Signature {
		let secp_ctx = Secp256k1::new();
		let sk = SecretKey::from_slice(&[42; 32]).unwrap();
		secp_ctx.sign_ecdsa(&bitcoin::secp256k1::Message::from_digest([7; 32]), &sk)
	}

	fn roundtrip<M: Writeable + Readable + PartialEq + core::fmt::Debug>(msg: &M) {
		let encoded = msg.encode();
		let decoded = M::read(&mut Cursor::new(&encoded)).unwrap();
		assert_eq!(*msg, decoded);
	}

	#[test]
	fn encoding_channel_reestablish() {
		let msg = ChannelReestablish {
			channel_id: ChannelId::from_bytes([4; 32]),
			next_local_commitment_number: 3,
			next_remote_commitment_number: 4,
			your_last_per_commitment_secret: [9; 32],
			my_current_per_commitment_point: pubkey(1),
			next_funding_txid: None,
		};
		let encoded = msg.encode();
		// channel_id ++ 2 be64s ++ secret ++ point, no TLVs
		assert_eq!(encoded.len(), 32 + 8 + 8 + 32 + 33);
		assert_eq!(&encoded[32..48], &[0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 4]);
		roundtrip(&msg);

		let msg_with_splice = ChannelReestablish {
			next_funding_txid: Some(Txid::from_byte_array([0xaa; 32])),
			..msg
		};
		let encoded = msg_with_splice.encode();
		// TLV record: type 0x00, length 0x20, 32-byte txid
		assert_eq!(encoded.len(), 113 + 2 + 32);
		assert_eq!(encoded[113], 0x00);
		assert_eq!(encoded[114], 0x20);
		roundtrip(&msg_with_splice);
	}

	#[test]
	fn encoding_commitment_signed_batch() {
		let msg = CommitmentSigned {
			channel_id: ChannelId::from_bytes([2; 32]),
			signature: sig(),
			htlc_signatures: vec![sig(), sig()],
			batch: Some(CommitmentSignedBatch {
				batch_size: 3,
				funding_txid: Txid::from_byte_array([0x02; 32]),
			}),
		};
		roundtrip(&msg);

		let no_batch = CommitmentSigned { batch: None, ..msg };
		roundtrip(&no_batch);
		// Without the TLV the message is exactly the fixed fields
		assert_eq!(no_batch.encode().len(), 32 + 64 + 2 + 2 * 64);
	}

	#[test]
	fn encoding_splice_init() {
		let msg = SpliceInit {
			channel_id: ChannelId::from_bytes([3; 32]),
			funding_contribution_satoshis: -100_000,
			funding_feerate_perkw: 2500,
			locktime: 840_000,
			funding_pubkey: pubkey(5),
			require_confirmed_inputs: Some(()),
			request_funding: Some(RequestFunding {
				requested_amount_satoshis: 500_000,
				funding_fee_base_satoshis: 1000,
				funding_fee_proportional_millionths: 100,
			}),
		};
		roundtrip(&msg);
		// A presence-only TLV record has zero length
		let encoded = msg.encode();
		let fixed_len = 32 + 8 + 4 + 4 + 33;
		assert_eq!(encoded[fixed_len], 2);
		assert_eq!(encoded[fixed_len + 1], 0);
	}

	#[test]
	fn encoding_tx_add_input() {
		use bitcoin::locktime::absolute::LockTime;
		use bitcoin::transaction::{Transaction, TxOut, Version};
		use bitcoin::{Amount, ScriptBuf};
		let prevtx = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![],
			output: vec![TxOut {
				value: Amount::from_sat(12345),
				script_pubkey: ScriptBuf::new(),
			}],
		};
		let msg = TxAddInput {
			channel_id: ChannelId::from_bytes([5; 32]),
			serial_id: 4886718345,
			prevtx: Some(crate::util::ser::TransactionU16LenLimited::new(prevtx).unwrap()),
			prevtx_out: 0,
			sequence: 0xfffffffd,
			shared_input_txid: None,
		};
		roundtrip(&msg);

		let shared = TxAddInput {
			prevtx: None,
			shared_input_txid: Some(Txid::from_byte_array([0x44; 32])),
			..msg
		};
		roundtrip(&shared);
	}

	#[test]
	fn encoding_update_add_htlc() {
		let msg = UpdateAddHTLC {
			channel_id: ChannelId::from_bytes([6; 32]),
			htlc_id: 2316138423780173,
			amount_msat: 3608586615801332854,
			payment_hash: PaymentHash([1; 32]),
			cltv_expiry: 821716,
			onion_routing_packet: OnionPacket {
				version: 0,
				public_key: pubkey(9),
				hop_data: [2; 1300],
				hmac: [3; 32],
			},
			blinding_point: None,
		};
		roundtrip(&msg);
		let blinded = UpdateAddHTLC { blinding_point: Some(pubkey(7)), ..msg };
		roundtrip(&blinded);
	}

	#[test]
	fn encoding_tx_signatures() {
		let msg = TxSignatures {
			channel_id: ChannelId::from_bytes([7; 32]),
			tx_hash: Txid::from_byte_array([8; 32]),
			witnesses: vec![
				Witness::from_slice(&[&[0xaau8; 71][..], &[0x02; 33][..]]),
				Witness::from_slice(&[&[0xbbu8; 71][..], &[0x03; 33][..]]),
			],
			shared_input_signature: Some(sig()),
		};
		roundtrip(&msg);
	}

	#[test]
	fn decoding_rejects_unknown_even_tlv() {
		let mut encoded = Stfu { channel_id: ChannelId::from_bytes([1; 32]), initiator: 1 }.encode();
		// Append TLV type 4 (even, unknown), zero length
		encoded.extend_from_slice(&[4, 0]);
		assert_eq!(
			Stfu::read(&mut Cursor::new(&encoded)).err(),
			Some(DecodeError::UnknownRequiredFeature)
		);
		// An odd unknown type is fine
		let mut encoded = Stfu { channel_id: ChannelId::from_bytes([1; 32]), initiator: 1 }.encode();
		encoded.extend_from_slice(&[5, 1, 0xff]);
		assert!(Stfu::read(&mut Cursor::new(&encoded)).is_ok());
	}
}
