// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The commitment set: the bilateral signed state of a channel.
//!
//! A channel normally has exactly one active [`Commitment`]. While a splice (or an RBF of one)
//! is in flight there are several, one per candidate funding transaction, and every HTLC update
//! applies to all of them atomically. Pending updates are tracked in ordered queues on each side
//! and only become part of a commitment through the sign/revoke round trip.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::hash_types::Txid;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};

use crate::chain::transaction::OutPoint;
use crate::ln::chan_utils::{
	commit_tx_fee_sat, CommitmentFormat, CommitmentTransaction, CounterpartyCommitmentSecrets,
	ChannelPublicKeys, ChannelTransactionParameters, HolderCommitmentTransaction,
	HTLCOutputInCommitment, TxCreationKeys, MAX_HTLCS,
};
use crate::ln::channel::ChannelError;
use crate::ln::msgs;
use crate::ln::msgs::DecodeError;
use crate::ln::types::{ChannelId, PaymentPreimage};
use crate::sign::InMemorySigner;
use crate::util::ser::{Readable, Writeable, Writer};

use core::cmp;
use std::io::Read;

/// The first commitment number, from which commitments count *down* in their on-chain encoding.
/// Commit indices in this module count up from zero; `INITIAL_COMMITMENT_NUMBER - index` is the
/// number encoded into the transaction.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The expiry of an HTLC must be a block height; values at or above this are timestamps.
pub(crate) const MAX_CLTV_EXPIRY: u32 = 500_000_000;

/// Per-party immutable settings agreed at channel opening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartyParams {
	/// The threshold below which this party omits outputs from its commitment.
	pub dust_limit_satoshis: u64,
	/// The maximum total value of HTLCs in flight *towards* this party.
	pub max_htlc_value_in_flight_msat: u64,
	/// The balance its counterparty must keep unencumbered, making cheating always costly.
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size this party accepts inbound, in milli-satoshi.
	pub htlc_minimum_msat: u64,
	/// The delay this party requires of its counterparty's `to_local` outputs.
	pub to_self_delay: u16,
	/// The maximum number of HTLCs in flight towards this party.
	pub max_accepted_htlcs: u16,
	/// This party's channel basepoints.
	pub pubkeys: ChannelPublicKeys,
}

impl_writeable!(PartyParams, {
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	pubkeys
});

/// The immutable parameters of a channel, born at opening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelParams {
	/// The channel id derived from the (initial) funding outpoint.
	pub channel_id: ChannelId,
	/// Our settings.
	pub holder: PartyParams,
	/// The counterparty's settings.
	pub counterparty: PartyParams,
	/// Whether we opened the channel (and thus pay commitment fees).
	pub is_outbound_from_holder: bool,
	/// The negotiated commitment format.
	pub commitment_format: CommitmentFormat,
}

impl_writeable!(ChannelParams, {
	channel_id,
	holder,
	counterparty,
	is_outbound_from_holder,
	commitment_format
});

/// The confirmation status of one commitment's funding transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingStatus {
	/// A single-funded (v1) channel whose funding transaction has not yet confirmed.
	SingleFundedUnconfirmed,
	/// An interactively-funded transaction (open, splice or RBF) which has not yet confirmed.
	DualFundedUnconfirmed {
		/// Whether we contributed liquidity at the counterparty's request, for a fee.
		liquidity_fee_msat: Option<u64>,
	},
	/// Used with zero-conf: the transaction is published and treated as usable before
	/// confirmation.
	ZeroconfPublished,
	/// Confirmed on chain to the required depth.
	Confirmed,
}

impl Writeable for FundingStatus {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		match self {
			FundingStatus::SingleFundedUnconfirmed => 0u8.write(w),
			FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat } => {
				1u8.write(w)?;
				liquidity_fee_msat.write(w)
			},
			FundingStatus::ZeroconfPublished => 2u8.write(w),
			FundingStatus::Confirmed => 3u8.write(w),
		}
	}
}
impl Readable for FundingStatus {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable>::read(r)? {
			0 => FundingStatus::SingleFundedUnconfirmed,
			1 => FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat: Readable::read(r)? },
			2 => FundingStatus::ZeroconfPublished,
			3 => FundingStatus::Confirmed,
			_ => return Err(DecodeError::UnknownVersion),
		})
	}
}

/// An in-flight HTLC tagged with its direction from the local point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectedHtlc {
	/// Whether the HTLC flows towards us (ie the counterparty offered it).
	pub incoming: bool,
	/// The `update_add_htlc` which created it.
	pub add: msgs::UpdateAddHTLC,
}

impl_writeable!(DirectedHtlc, { incoming, add });

impl DirectedHtlc {
	fn to_htlc_output_in_commitment(&self, local_commit: bool) -> HTLCOutputInCommitment {
		// An HTLC is "offered" relative to a commitment if its broadcaster sent it. On our own
		// commitment our outgoing HTLCs are offered; on the counterparty's it is the reverse.
		HTLCOutputInCommitment {
			offered: self.incoming != local_commit,
			amount_msat: self.add.amount_msat,
			cltv_expiry: self.add.cltv_expiry,
			payment_hash: self.add.payment_hash,
			transaction_output_index: None,
		}
	}
}

/// One of the six update messages which modify the pending commitment state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateMessage {
	/// An `update_add_htlc`.
	AddHtlc(msgs::UpdateAddHTLC),
	/// An `update_fulfill_htlc`.
	FulfillHtlc(msgs::UpdateFulfillHTLC),
	/// An `update_fail_htlc`.
	FailHtlc(msgs::UpdateFailHTLC),
	/// An `update_fail_malformed_htlc`.
	FailMalformedHtlc(msgs::UpdateFailMalformedHTLC),
	/// An `update_fee`.
	Fee(msgs::UpdateFee),
}

impl Writeable for UpdateMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		match self {
			UpdateMessage::AddHtlc(msg) => {
				0u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::FulfillHtlc(msg) => {
				1u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::FailHtlc(msg) => {
				2u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::FailMalformedHtlc(msg) => {
				3u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::Fee(msg) => {
				4u8.write(w)?;
				msg.write(w)
			},
		}
	}
}
impl Readable for UpdateMessage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable>::read(r)? {
			0 => UpdateMessage::AddHtlc(Readable::read(r)?),
			1 => UpdateMessage::FulfillHtlc(Readable::read(r)?),
			2 => UpdateMessage::FailHtlc(Readable::read(r)?),
			3 => UpdateMessage::FailMalformedHtlc(Readable::read(r)?),
			4 => UpdateMessage::Fee(Readable::read(r)?),
			_ => return Err(DecodeError::UnknownVersion),
		})
	}
}

fn write_update_vec<W: Writer>(v: &Vec<UpdateMessage>, w: &mut W) -> Result<(), std::io::Error> {
	(v.len() as u16).write(w)?;
	for upd in v.iter() {
		upd.write(w)?;
	}
	Ok(())
}
fn read_update_vec<R: Read>(r: &mut R) -> Result<Vec<UpdateMessage>, DecodeError> {
	let len: u16 = Readable::read(r)?;
	let mut ret = Vec::with_capacity(cmp::min(len as usize, MAX_HTLCS as usize * 2));
	for _ in 0..len {
		ret.push(Readable::read(r)?);
	}
	Ok(ret)
}

/// Updates we have sent, keyed by how far through the sign/revoke round trip they are.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalChanges {
	/// Sent to the peer but not yet included in any `commitment_signed` of ours.
	pub proposed: Vec<UpdateMessage>,
	/// Included in our last `commitment_signed`, awaiting the peer's `revoke_and_ack`.
	pub signed: Vec<UpdateMessage>,
	/// Irrevocably part of the peer's commitment, not yet reflected in ours.
	pub acked: Vec<UpdateMessage>,
}

/// Updates the peer has sent, keyed by how far through the sign/revoke round trip they are.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteChanges {
	/// Received from the peer but not yet included in any commitment.
	pub proposed: Vec<UpdateMessage>,
	/// Part of our commitment (we revoked the predecessor), not yet signed into theirs.
	pub acked: Vec<UpdateMessage>,
	/// Included in the last commitment we signed for them, awaiting their `revoke_and_ack`.
	pub signed: Vec<UpdateMessage>,
}

/// The state of one commitment transaction: balances, feerate and the pending HTLC set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSpec {
	/// The in-flight HTLCs, directed from the local point of view.
	pub htlcs: Vec<DirectedHtlc>,
	/// The feerate of the commitment transaction, in sat per 1000 weight units.
	pub feerate_per_kw: u32,
	/// Our balance before fee deduction, in milli-satoshi.
	pub to_local_msat: u64,
	/// The counterparty's balance before fee deduction, in milli-satoshi.
	pub to_remote_msat: u64,
}

impl Writeable for CommitmentSpec {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		(self.htlcs.len() as u16).write(w)?;
		for htlc in self.htlcs.iter() {
			htlc.write(w)?;
		}
		self.feerate_per_kw.write(w)?;
		self.to_local_msat.write(w)?;
		self.to_remote_msat.write(w)
	}
}
impl Readable for CommitmentSpec {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let htlc_count: u16 = Readable::read(r)?;
		let mut htlcs = Vec::with_capacity(cmp::min(htlc_count as usize, MAX_HTLCS as usize * 2));
		for _ in 0..htlc_count {
			htlcs.push(Readable::read(r)?);
		}
		Ok(CommitmentSpec {
			htlcs,
			feerate_per_kw: Readable::read(r)?,
			to_local_msat: Readable::read(r)?,
			to_remote_msat: Readable::read(r)?,
		})
	}
}

impl CommitmentSpec {
	/// The total value carried by the spec. For every valid spec this equals the channel
	/// capacity (in milli-satoshi) of the commitment it belongs to.
	pub fn total_msat(&self) -> u64 {
		self.to_local_msat
			+ self.to_remote_msat
			+ self.htlcs.iter().map(|h| h.add.amount_msat).sum::<u64>()
	}

	/// The sum of in-flight HTLCs towards us.
	pub fn htlc_value_in_flight_incoming_msat(&self) -> u64 {
		self.htlcs.iter().filter(|h| h.incoming).map(|h| h.add.amount_msat).sum()
	}

	/// The sum of in-flight HTLCs towards the counterparty.
	pub fn htlc_value_in_flight_outgoing_msat(&self) -> u64 {
		self.htlcs.iter().filter(|h| !h.incoming).map(|h| h.add.amount_msat).sum()
	}

	fn find_htlc(&self, incoming: bool, htlc_id: u64) -> Option<usize> {
		self.htlcs
			.iter()
			.position(|h| h.incoming == incoming && h.add.htlc_id == htlc_id)
	}

	/// Applies ordered local and remote change lists to this spec, producing the spec of the
	/// next commitment. Specs are always kept in the local party's point of view, whichever
	/// side's commitment they describe; the flip happens only at transaction-build time.
	///
	/// Additions are applied before settlements, since a settlement in one list may refer to an
	/// addition in the other which has not yet been committed.
	pub fn reduce(
		&self, local_changes: &[UpdateMessage], remote_changes: &[UpdateMessage],
	) -> Result<CommitmentSpec, ChannelError> {
		let mut spec = self.clone();

		for change in local_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				if spec.to_local_msat < add.amount_msat {
					return Err(ChannelError::Close("Cannot send value that would put us under our balance".to_owned()));
				}
				spec.to_local_msat -= add.amount_msat;
				spec.htlcs.push(DirectedHtlc { incoming: false, add: add.clone() });
			}
		}
		for change in remote_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				if spec.to_remote_msat < add.amount_msat {
					return Err(ChannelError::Close("Peer sent value that would put them under their balance".to_owned()));
				}
				spec.to_remote_msat -= add.amount_msat;
				spec.htlcs.push(DirectedHtlc { incoming: true, add: add.clone() });
			}
		}

		for change in local_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(fulfill) => {
					// We settle an incoming HTLC; its value becomes ours.
					let idx = spec.find_htlc(true, fulfill.htlc_id).ok_or_else(|| {
						ChannelError::Close("Fulfilled an unknown incoming HTLC".to_owned())
					})?;
					spec.to_local_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::FailHtlc(fail) => {
					let idx = spec.find_htlc(true, fail.htlc_id).ok_or_else(|| {
						ChannelError::Close("Failed an unknown incoming HTLC".to_owned())
					})?;
					spec.to_remote_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::FailMalformedHtlc(fail) => {
					let idx = spec.find_htlc(true, fail.htlc_id).ok_or_else(|| {
						ChannelError::Close("Failed an unknown incoming HTLC".to_owned())
					})?;
					spec.to_remote_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::Fee(fee) => {
					spec.feerate_per_kw = fee.feerate_per_kw;
				},
			}
		}
		for change in remote_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(fulfill) => {
					// The peer settles one of our outgoing HTLCs; its value becomes theirs.
					let idx = spec.find_htlc(false, fulfill.htlc_id).ok_or_else(|| {
						ChannelError::Close("Peer fulfilled an unknown outgoing HTLC".to_owned())
					})?;
					spec.to_remote_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::FailHtlc(fail) => {
					let idx = spec.find_htlc(false, fail.htlc_id).ok_or_else(|| {
						ChannelError::Close("Peer failed an unknown outgoing HTLC".to_owned())
					})?;
					spec.to_local_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::FailMalformedHtlc(fail) => {
					let idx = spec.find_htlc(false, fail.htlc_id).ok_or_else(|| {
						ChannelError::Close("Peer failed an unknown outgoing HTLC".to_owned())
					})?;
					spec.to_local_msat += spec.htlcs[idx].add.amount_msat;
					spec.htlcs.swap_remove(idx);
				},
				UpdateMessage::Fee(fee) => {
					spec.feerate_per_kw = fee.feerate_per_kw;
				},
			}
		}

		Ok(spec)
	}
}

/// Our own signed commitment at a given index.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCommit {
	/// The commit index (counting up from zero).
	pub index: u64,
	/// The spec this commitment was built from.
	pub spec: CommitmentSpec,
	/// The fully-signed commitment transaction with the counterparty's signatures.
	pub commit_tx: HolderCommitmentTransaction,
}

impl Writeable for LocalCommit {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.index.write(w)?;
		self.spec.write(w)?;
		self.commit_tx.write(w)
	}
}
impl Readable for LocalCommit {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(LocalCommit {
			index: Readable::read(r)?,
			spec: Readable::read(r)?,
			commit_tx: Readable::read(r)?,
		})
	}
}

/// The counterparty's commitment at a given index. We never hold their full signed transaction,
/// only what we need to recognize it on chain and to rebuild it for penalties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommit {
	/// The commit index (counting up from zero).
	pub index: u64,
	/// The spec this commitment was built from (HTLC directions still from *our* point of view).
	pub spec: CommitmentSpec,
	/// The txid of the counterparty's commitment transaction.
	pub txid: Txid,
	/// The per-commitment point the counterparty used for this commitment.
	pub remote_per_commitment_point: PublicKey,
}

impl_writeable!(RemoteCommit, { index, spec, txid, remote_per_commitment_point });

/// One commitment: a funding output which exists (or may come to exist) on chain, with one
/// signed state on each side.
#[derive(Clone, Debug, PartialEq)]
pub struct Commitment {
	/// Which funding transaction this commitment builds on: 0 for the original funding, +1 for
	/// each splice. RBF attempts share an index and pairwise double-spend.
	pub funding_tx_index: u64,
	/// The funding outpoint this commitment spends.
	pub funding_outpoint: OutPoint,
	/// The value of the funding output, ie this commitment's capacity.
	pub capacity_satoshis: u64,
	/// The confirmation status of the funding transaction.
	pub funding_status: FundingStatus,
	/// Our signed commitment.
	pub local_commit: LocalCommit,
	/// The counterparty's commitment.
	pub remote_commit: RemoteCommit,
	/// Their next commitment, once we have signed it and before they have revoked the previous
	/// one.
	pub next_remote_commit: Option<RemoteCommit>,
}

impl Writeable for Commitment {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.funding_tx_index.write(w)?;
		self.funding_outpoint.write(w)?;
		self.capacity_satoshis.write(w)?;
		self.funding_status.write(w)?;
		self.local_commit.write(w)?;
		self.remote_commit.write(w)?;
		self.next_remote_commit.write(w)
	}
}
impl Readable for Commitment {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Commitment {
			funding_tx_index: Readable::read(r)?,
			funding_outpoint: Readable::read(r)?,
			capacity_satoshis: Readable::read(r)?,
			funding_status: Readable::read(r)?,
			local_commit: Readable::read(r)?,
			remote_commit: Readable::read(r)?,
			next_remote_commit: Readable::read(r)?,
		})
	}
}

impl Commitment {
	/// Assembles the transaction-building parameters for this commitment's funding output.
	pub fn transaction_parameters(&self, params: &ChannelParams) -> ChannelTransactionParameters {
		ChannelTransactionParameters {
			holder_pubkeys: params.holder.pubkeys.clone(),
			holder_selected_contest_delay: params.holder.to_self_delay,
			holder_dust_limit_satoshis: params.holder.dust_limit_satoshis,
			counterparty_pubkeys: params.counterparty.pubkeys.clone(),
			counterparty_selected_contest_delay: params.counterparty.to_self_delay,
			counterparty_dust_limit_satoshis: params.counterparty.dust_limit_satoshis,
			is_outbound_from_holder: params.is_outbound_from_holder,
			funding_outpoint: self.funding_outpoint,
			channel_value_satoshis: self.capacity_satoshis,
			commitment_format: params.commitment_format,
		}
	}

	/// Whether this commitment's funding transaction may still confirm.
	pub fn is_confirmed(&self) -> bool {
		matches!(self.funding_status, FundingStatus::Confirmed)
	}
}

/// Builds the [`CommitmentTransaction`] for one side of one commitment, from primitive inputs.
pub(crate) fn build_commitment_transaction<T: secp256k1::Signing + secp256k1::Verification>(
	local: bool, commit_index: u64, spec: &CommitmentSpec, per_commitment_point: &PublicKey,
	tx_params: &ChannelTransactionParameters, secp_ctx: &Secp256k1<T>,
) -> (CommitmentTransaction, Vec<HTLCOutputInCommitment>) {
	let directed = if local {
		tx_params.as_holder_broadcastable()
	} else {
		tx_params.as_counterparty_broadcastable()
	};
	let keys = TxCreationKeys::from_channel_static_keys(
		per_commitment_point,
		directed.broadcaster_pubkeys(),
		directed.countersignatory_pubkeys(),
		secp_ctx,
	);
	let (to_broadcaster_msat, to_countersignatory_msat) = if local {
		(spec.to_local_msat, spec.to_remote_msat)
	} else {
		(spec.to_remote_msat, spec.to_local_msat)
	};
	let mut htlcs: Vec<HTLCOutputInCommitment> =
		spec.htlcs.iter().map(|h| h.to_htlc_output_in_commitment(local)).collect();
	let commit_tx = CommitmentTransaction::new(
		INITIAL_COMMITMENT_NUMBER - commit_index,
		to_broadcaster_msat,
		to_countersignatory_msat,
		keys,
		spec.feerate_per_kw,
		&mut htlcs,
		&directed,
	);
	(commit_tx, htlcs)
}

/// The full bilateral state of a channel's commitments: the active (and retained inactive)
/// commitments plus the pending update queues on both sides.
#[derive(Clone, PartialEq, Debug)]
pub struct CommitmentSet {
	/// The channel's immutable parameters.
	pub params: ChannelParams,
	/// The commitments whose funding output exists (or may confirm). All of them advance in
	/// lock-step through the update protocol.
	pub active: Vec<Commitment>,
	/// Superseded commitments, retained until no reorg can resurrect their funding output.
	pub inactive: Vec<Commitment>,
	/// Updates we have sent.
	pub local_changes: LocalChanges,
	/// Updates the peer has sent.
	pub remote_changes: RemoteChanges,
	/// The id our next outgoing HTLC will carry.
	pub next_local_htlc_id: u64,
	/// The id we expect on the peer's next `update_add_htlc`.
	pub next_remote_htlc_id: u64,
	/// The peer's per-commitment point for their next commitment, from their last
	/// `revoke_and_ack` (or `channel_ready` for the first commitment).
	pub remote_next_per_commitment_point: Option<PublicKey>,
	/// All revealed counterparty per-commitment secrets.
	pub remote_per_commitment_secrets: CounterpartyCommitmentSecrets,
}

impl Writeable for CommitmentSet {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.params.write(w)?;
		(self.active.len() as u16).write(w)?;
		for commitment in self.active.iter() {
			commitment.write(w)?;
		}
		(self.inactive.len() as u16).write(w)?;
		for commitment in self.inactive.iter() {
			commitment.write(w)?;
		}
		write_update_vec(&self.local_changes.proposed, w)?;
		write_update_vec(&self.local_changes.signed, w)?;
		write_update_vec(&self.local_changes.acked, w)?;
		write_update_vec(&self.remote_changes.proposed, w)?;
		write_update_vec(&self.remote_changes.acked, w)?;
		write_update_vec(&self.remote_changes.signed, w)?;
		self.next_local_htlc_id.write(w)?;
		self.next_remote_htlc_id.write(w)?;
		self.remote_next_per_commitment_point.write(w)?;
		self.remote_per_commitment_secrets.write(w)
	}
}
impl Readable for CommitmentSet {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let params = Readable::read(r)?;
		let active_count: u16 = Readable::read(r)?;
		let mut active = Vec::with_capacity(cmp::min(active_count as usize, 16));
		for _ in 0..active_count {
			active.push(Readable::read(r)?);
		}
		let inactive_count: u16 = Readable::read(r)?;
		let mut inactive = Vec::with_capacity(cmp::min(inactive_count as usize, 16));
		for _ in 0..inactive_count {
			inactive.push(Readable::read(r)?);
		}
		let local_changes = LocalChanges {
			proposed: read_update_vec(r)?,
			signed: read_update_vec(r)?,
			acked: read_update_vec(r)?,
		};
		let remote_changes = RemoteChanges {
			proposed: read_update_vec(r)?,
			acked: read_update_vec(r)?,
			signed: read_update_vec(r)?,
		};
		Ok(CommitmentSet {
			params,
			active,
			inactive,
			local_changes,
			remote_changes,
			next_local_htlc_id: Readable::read(r)?,
			next_remote_htlc_id: Readable::read(r)?,
			remote_next_per_commitment_point: Readable::read(r)?,
			remote_per_commitment_secrets: Readable::read(r)?,
		})
	}
}

impl CommitmentSet {
	/// Creates a set with a single initial commitment.
	pub fn new(
		params: ChannelParams, initial: Commitment, remote_next_per_commitment_point: PublicKey,
	) -> Self {
		CommitmentSet {
			params,
			active: vec![initial],
			inactive: Vec::new(),
			local_changes: LocalChanges::default(),
			remote_changes: RemoteChanges::default(),
			next_local_htlc_id: 0,
			next_remote_htlc_id: 0,
			remote_next_per_commitment_point: Some(remote_next_per_commitment_point),
			remote_per_commitment_secrets: CounterpartyCommitmentSecrets::new(),
		}
	}

	/// The index of our current commitment.
	pub fn local_commit_index(&self) -> u64 {
		self.active[0].local_commit.index
	}

	/// The index of the counterparty's current (latest revoked-into) commitment.
	pub fn remote_commit_index(&self) -> u64 {
		self.active[0].remote_commit.index
	}

	/// Whether we have signed a remote commitment whose predecessor the peer has not yet
	/// revoked. No new signature may be sent until the revocation arrives.
	pub fn awaiting_remote_revocation(&self) -> bool {
		self.active[0].next_remote_commit.is_some()
	}

	/// The spec of our latest commitment.
	pub fn latest_local_spec(&self) -> &CommitmentSpec {
		&self.active[0].local_commit.spec
	}

	/// The spec the next remote commitment would have if we signed right now.
	pub fn next_remote_spec(&self) -> Result<CommitmentSpec, ChannelError> {
		self.active[0]
			.remote_commit
			.spec
			.reduce(&self.local_changes.proposed, &self.remote_changes.acked)
	}

	fn commit_fee_and_reserve_msat(&self, spec: &CommitmentSpec, extra_htlcs: usize) -> u64 {
		// The opener pays the commit fee; both sides honor the reserve.
		let num_htlcs = spec.htlcs.len() + extra_htlcs;
		let fee_msat =
			commit_tx_fee_sat(spec.feerate_per_kw, num_htlcs, self.params.commitment_format) * 1000;
		let reserve_msat = self.params.counterparty.channel_reserve_satoshis * 1000;
		fee_msat + reserve_msat
	}

	/// Proposes a new outgoing HTLC, validating it against the counterparty's constraints and
	/// our balance on the next remote commitment.
	pub fn send_add_htlc(
		&mut self, amount_msat: u64, payment_hash: crate::ln::types::PaymentHash,
		cltv_expiry: u32, onion_routing_packet: msgs::OnionPacket,
		blinding_point: Option<PublicKey>,
	) -> Result<msgs::UpdateAddHTLC, ChannelError> {
		if amount_msat < self.params.counterparty.htlc_minimum_msat {
			return Err(ChannelError::Ignore(format!(
				"Cannot send HTLC of {} msat, below the counterparty minimum of {} msat",
				amount_msat, self.params.counterparty.htlc_minimum_msat
			)));
		}
		if cltv_expiry >= MAX_CLTV_EXPIRY {
			return Err(ChannelError::Ignore("HTLC expiry must be a block height".to_owned()));
		}

		let spec = self.next_remote_spec()?;
		let outgoing_count =
			spec.htlcs.iter().filter(|h| !h.incoming).count();
		if outgoing_count as u16 + 1 > self.params.counterparty.max_accepted_htlcs {
			return Err(ChannelError::Ignore("Cannot push more than the counterparty's max accepted HTLCs".to_owned()));
		}
		if spec.htlc_value_in_flight_outgoing_msat() + amount_msat
			> self.params.counterparty.max_htlc_value_in_flight_msat
		{
			return Err(ChannelError::Ignore("Cannot exceed the counterparty's max HTLC value in flight".to_owned()));
		}
		let required_msat = amount_msat
			+ if self.params.is_outbound_from_holder {
				// As opener we pay the commitment fee on top of the reserve.
				self.commit_fee_and_reserve_msat(&spec, 1)
			} else {
				self.params.counterparty.channel_reserve_satoshis * 1000
			};
		if spec.to_local_msat < required_msat {
			return Err(ChannelError::Ignore(format!(
				"Cannot send HTLC of {} msat: only {} msat available after fee and reserve",
				amount_msat, spec.to_local_msat.saturating_sub(required_msat - amount_msat)
			)));
		}

		let add = msgs::UpdateAddHTLC {
			channel_id: self.params.channel_id,
			htlc_id: self.next_local_htlc_id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
			blinding_point,
		};
		self.next_local_htlc_id += 1;
		self.local_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
		Ok(add)
	}

	/// Validates and queues an incoming `update_add_htlc`.
	pub fn receive_add_htlc(&mut self, msg: &msgs::UpdateAddHTLC) -> Result<(), ChannelError> {
		if msg.htlc_id != self.next_remote_htlc_id {
			return Err(ChannelError::Close(format!(
				"Remote skipped HTLC id: expected {}, got {}",
				self.next_remote_htlc_id, msg.htlc_id
			)));
		}
		if msg.amount_msat < self.params.holder.htlc_minimum_msat {
			return Err(ChannelError::Close(format!(
				"Remote sent HTLC of {} msat, below our minimum of {} msat",
				msg.amount_msat, self.params.holder.htlc_minimum_msat
			)));
		}
		if msg.amount_msat > msgs::MAX_VALUE_MSAT {
			return Err(ChannelError::Close("Remote sent HTLC above total bitcoin supply".to_owned()));
		}
		if msg.cltv_expiry >= MAX_CLTV_EXPIRY {
			return Err(ChannelError::Close("Remote sent HTLC with a timestamp expiry".to_owned()));
		}

		// Validate against our next local commitment including everything pending.
		let spec = self
			.latest_local_spec()
			.reduce(&self.local_changes.acked, &self.remote_changes.proposed)?;
		let incoming_count = spec.htlcs.iter().filter(|h| h.incoming).count();
		if incoming_count as u16 + 1 > self.params.holder.max_accepted_htlcs {
			return Err(ChannelError::Close("Remote exceeded our max accepted HTLCs".to_owned()));
		}
		if spec.htlc_value_in_flight_incoming_msat() + msg.amount_msat
			> self.params.holder.max_htlc_value_in_flight_msat
		{
			return Err(ChannelError::Close("Remote exceeded our max HTLC value in flight".to_owned()));
		}
		let required_msat = msg.amount_msat
			+ if self.params.is_outbound_from_holder {
				self.params.holder.channel_reserve_satoshis * 1000
			} else {
				// The peer opened the channel: they pay the fee from their balance.
				let num_htlcs = spec.htlcs.len() + 1;
				commit_tx_fee_sat(spec.feerate_per_kw, num_htlcs, self.params.commitment_format)
					* 1000 + self.params.holder.channel_reserve_satoshis * 1000
			};
		if spec.to_remote_msat < required_msat {
			return Err(ChannelError::Close("Remote cannot afford this HTLC over their reserve and fees".to_owned()));
		}

		self.next_remote_htlc_id += 1;
		self.remote_changes.proposed.push(UpdateMessage::AddHtlc(msg.clone()));
		Ok(())
	}

	fn committed_incoming_htlc(&self, htlc_id: u64) -> Option<&DirectedHtlc> {
		self.latest_local_spec().htlcs.iter().find(|h| h.incoming && h.add.htlc_id == htlc_id)
	}

	fn committed_outgoing_htlc(&self, htlc_id: u64) -> Option<&DirectedHtlc> {
		self.latest_local_spec().htlcs.iter().find(|h| !h.incoming && h.add.htlc_id == htlc_id)
	}

	/// Settles an incoming HTLC with its preimage.
	pub fn send_fulfill_htlc(
		&mut self, htlc_id: u64, payment_preimage: PaymentPreimage,
	) -> Result<msgs::UpdateFulfillHTLC, ChannelError> {
		let htlc = self
			.committed_incoming_htlc(htlc_id)
			.ok_or_else(|| ChannelError::Ignore(format!("Unknown incoming HTLC id {}", htlc_id)))?;
		if Sha256::hash(&payment_preimage.0).to_byte_array() != htlc.add.payment_hash.0 {
			return Err(ChannelError::Ignore("Preimage does not match the payment hash".to_owned()));
		}
		let fulfill = msgs::UpdateFulfillHTLC {
			channel_id: self.params.channel_id,
			htlc_id,
			payment_preimage,
		};
		self.local_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
		Ok(fulfill)
	}

	/// Validates an incoming `update_fulfill_htlc` settling one of our outgoing HTLCs.
	pub fn receive_fulfill_htlc(
		&mut self, msg: &msgs::UpdateFulfillHTLC,
	) -> Result<(), ChannelError> {
		let htlc = self.committed_outgoing_htlc(msg.htlc_id).ok_or_else(|| {
			ChannelError::Close(format!("Peer fulfilled unknown outgoing HTLC id {}", msg.htlc_id))
		})?;
		if Sha256::hash(&msg.payment_preimage.0).to_byte_array() != htlc.add.payment_hash.0 {
			return Err(ChannelError::Close("Peer sent a preimage not matching the payment hash".to_owned()));
		}
		self.remote_changes.proposed.push(UpdateMessage::FulfillHtlc(msg.clone()));
		Ok(())
	}

	/// Fails an incoming HTLC.
	pub fn send_fail_htlc(
		&mut self, htlc_id: u64, reason: msgs::OnionErrorPacket,
	) -> Result<msgs::UpdateFailHTLC, ChannelError> {
		if self.committed_incoming_htlc(htlc_id).is_none() {
			return Err(ChannelError::Ignore(format!("Unknown incoming HTLC id {}", htlc_id)));
		}
		let fail =
			msgs::UpdateFailHTLC { channel_id: self.params.channel_id, htlc_id, reason };
		self.local_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
		Ok(fail)
	}

	/// Validates an incoming `update_fail_htlc`.
	pub fn receive_fail_htlc(&mut self, msg: &msgs::UpdateFailHTLC) -> Result<(), ChannelError> {
		if self.committed_outgoing_htlc(msg.htlc_id).is_none() {
			return Err(ChannelError::Close(format!(
				"Peer failed unknown outgoing HTLC id {}",
				msg.htlc_id
			)));
		}
		self.remote_changes.proposed.push(UpdateMessage::FailHtlc(msg.clone()));
		Ok(())
	}

	/// Validates an incoming `update_fail_malformed_htlc`.
	pub fn receive_fail_malformed_htlc(
		&mut self, msg: &msgs::UpdateFailMalformedHTLC,
	) -> Result<(), ChannelError> {
		if self.committed_outgoing_htlc(msg.htlc_id).is_none() {
			return Err(ChannelError::Close(format!(
				"Peer failed unknown outgoing HTLC id {}",
				msg.htlc_id
			)));
		}
		// The BADONION bit must be set for a malformed failure.
		if msg.failure_code & 0x8000 == 0 {
			return Err(ChannelError::Close("Peer sent update_fail_malformed_htlc without BADONION".to_owned()));
		}
		self.remote_changes.proposed.push(UpdateMessage::FailMalformedHtlc(msg.clone()));
		Ok(())
	}

	/// Proposes a commitment feerate change. Only the channel opener may do this.
	pub fn send_fee(&mut self, feerate_per_kw: u32) -> Result<msgs::UpdateFee, ChannelError> {
		if !self.params.is_outbound_from_holder {
			return Err(ChannelError::Ignore("Only the channel opener may send update_fee".to_owned()));
		}
		let fee = msgs::UpdateFee { channel_id: self.params.channel_id, feerate_per_kw };
		self.local_changes.proposed.push(UpdateMessage::Fee(fee.clone()));
		Ok(fee)
	}

	/// Validates an incoming `update_fee`.
	pub fn receive_fee(
		&mut self, msg: &msgs::UpdateFee, feerate_floor: u32,
	) -> Result<(), ChannelError> {
		if self.params.is_outbound_from_holder {
			return Err(ChannelError::Close("Non-opener peer sent update_fee".to_owned()));
		}
		if msg.feerate_per_kw < feerate_floor {
			return Err(ChannelError::Close(format!(
				"Peer's feerate {} is below our floor of {}",
				msg.feerate_per_kw, feerate_floor
			)));
		}
		self.remote_changes.proposed.push(UpdateMessage::Fee(msg.clone()));
		Ok(())
	}

	/// Signs the counterparty's next commitment on every active funding transaction, producing
	/// one `commitment_signed` per commitment (tagged with batch info when there are several).
	pub fn send_commit<T: secp256k1::Signing + secp256k1::Verification>(
		&mut self, signer: &InMemorySigner, secp_ctx: &Secp256k1<T>,
	) -> Result<Vec<msgs::CommitmentSigned>, ChannelError> {
		if self.awaiting_remote_revocation() {
			return Err(ChannelError::Ignore("Cannot sign until the previous commitment is revoked".to_owned()));
		}
		if self.local_changes.proposed.is_empty() && self.remote_changes.acked.is_empty() {
			return Err(ChannelError::Ignore("Nothing to sign".to_owned()));
		}
		let remote_point = self.remote_next_per_commitment_point.ok_or_else(|| {
			ChannelError::Ignore("Missing the peer's next per-commitment point".to_owned())
		})?;

		let batch_size = self.active.len();
		let mut msgs_out = Vec::with_capacity(batch_size);
		let params = self.params.clone();
		for commitment in self.active.iter_mut() {
			let spec = commitment
				.remote_commit
				.spec
				.reduce(&self.local_changes.proposed, &self.remote_changes.acked)?;
			let tx_params = commitment.transaction_parameters(&params);
			let (commit_tx, _) = build_commitment_transaction(
				false,
				commitment.remote_commit.index + 1,
				&spec,
				&remote_point,
				&tx_params,
				secp_ctx,
			);
			let (signature, htlc_signatures) =
				signer.sign_counterparty_commitment(&commit_tx, &tx_params, secp_ctx);
			msgs_out.push(msgs::CommitmentSigned {
				channel_id: params.channel_id,
				signature,
				htlc_signatures,
				batch: if batch_size > 1 {
					Some(msgs::CommitmentSignedBatch {
						batch_size: batch_size as u16,
						funding_txid: commitment.funding_outpoint.txid,
					})
				} else {
					None
				},
			});
			commitment.next_remote_commit = Some(RemoteCommit {
				index: commitment.remote_commit.index + 1,
				spec,
				txid: commit_tx.txid(),
				remote_per_commitment_point: remote_point,
			});
		}

		self.local_changes.signed.append(&mut self.local_changes.proposed);
		self.remote_changes.signed.append(&mut self.remote_changes.acked);
		Ok(msgs_out)
	}

	/// Verifies a batch of `commitment_signed` messages (one per active commitment), stores the
	/// new local commitments, and produces the `revoke_and_ack` revoking their predecessor.
	pub fn receive_commit<T: secp256k1::Signing + secp256k1::Verification>(
		&mut self, msgs_in: &[msgs::CommitmentSigned], signer: &InMemorySigner,
		secp_ctx: &Secp256k1<T>,
	) -> Result<msgs::RevokeAndACK, ChannelError> {
		if msgs_in.len() != self.active.len() {
			return Err(ChannelError::Warn(format!(
				"commitment_signed batch size {} does not match our {} active commitments",
				msgs_in.len(),
				self.active.len()
			)));
		}
		for msg in msgs_in.iter() {
			if let Some(batch) = &msg.batch {
				if batch.batch_size as usize != self.active.len() {
					return Err(ChannelError::Warn(format!(
						"commitment_signed batch size {} does not match our {} active commitments",
						batch.batch_size,
						self.active.len()
					)));
				}
			} else if self.active.len() > 1 {
				return Err(ChannelError::Warn("Missing batch info on a multi-commitment commitment_signed".to_owned()));
			}
		}

		let spec = self
			.latest_local_spec()
			.reduce(&self.local_changes.acked, &self.remote_changes.proposed)?;
		let next_index = self.local_commit_index() + 1;
		let per_commitment_point =
			signer.get_per_commitment_point(INITIAL_COMMITMENT_NUMBER - next_index, secp_ctx);

		let params = self.params.clone();
		let mut new_local_commits = Vec::with_capacity(self.active.len());
		for commitment in self.active.iter() {
			// During splicing each message is matched to its commitment by funding txid.
			let msg = if self.active.len() == 1 {
				&msgs_in[0]
			} else {
				msgs_in
					.iter()
					.find(|m| {
						m.batch.as_ref().map(|b| b.funding_txid)
							== Some(commitment.funding_outpoint.txid)
					})
					.ok_or_else(|| {
						ChannelError::Warn(format!(
							"Missing commitment_signed for funding tx {}",
							commitment.funding_outpoint.txid
						))
					})?
			};

			let tx_params = commitment.transaction_parameters(&params);
			let (commit_tx, _) = build_commitment_transaction(
				true,
				next_index,
				&spec,
				&per_commitment_point,
				&tx_params,
				secp_ctx,
			);

			let funding_redeemscript = tx_params.make_funding_redeemscript();
			let sighash = commit_tx
				.built_transaction()
				.get_sighash_all(&funding_redeemscript, tx_params.channel_value_satoshis);
			if secp_ctx
				.verify_ecdsa(&sighash, &msg.signature, &params.counterparty.pubkeys.funding_pubkey)
				.is_err()
			{
				return Err(ChannelError::Close("Invalid commitment transaction signature".to_owned()));
			}

			if msg.htlc_signatures.len() != commit_tx.nondust_htlcs().len() {
				return Err(ChannelError::Close(format!(
					"Got wrong number of HTLC signatures ({}) from remote. It must be {}",
					msg.htlc_signatures.len(),
					commit_tx.nondust_htlcs().len()
				)));
			}
			let contest_delay = params.counterparty.to_self_delay;
			for (idx, htlc_sig) in msg.htlc_signatures.iter().enumerate() {
				// The sighash digest commits to the flag the format mandates; a signature made
				// with any other flag fails verification outright.
				let countersignatory_htlc_key =
					commit_tx.trust_key_derivation().countersignatory_htlc_key;
				if commit_tx
					.verify_htlc_sig(idx, contest_delay, &countersignatory_htlc_key, htlc_sig, secp_ctx)
					.is_err()
				{
					return Err(ChannelError::Close("Invalid HTLC transaction signature".to_owned()));
				}
			}

			new_local_commits.push(LocalCommit {
				index: next_index,
				spec: spec.clone(),
				commit_tx: HolderCommitmentTransaction::new(
					commit_tx,
					msg.signature,
					msg.htlc_signatures.clone(),
					&params.holder.pubkeys.funding_pubkey,
					&params.counterparty.pubkeys.funding_pubkey,
				),
			});
		}

		for (commitment, local_commit) in self.active.iter_mut().zip(new_local_commits) {
			commitment.local_commit = local_commit;
		}
		self.remote_changes.acked.append(&mut self.remote_changes.proposed);
		self.local_changes.acked.clear();

		// Revoke the predecessor and hand over the next point.
		let per_commitment_secret =
			signer.release_commitment_secret(INITIAL_COMMITMENT_NUMBER - (next_index - 1));
		let next_point = signer
			.get_per_commitment_point(INITIAL_COMMITMENT_NUMBER - (next_index + 1), secp_ctx);
		Ok(msgs::RevokeAndACK {
			channel_id: self.params.channel_id,
			per_commitment_secret,
			next_per_commitment_point: next_point,
		})
	}

	/// Processes the peer's `revoke_and_ack`: checks and stores the revealed secret and
	/// finalizes the remote commitments we signed most recently.
	pub fn receive_revocation<T: secp256k1::Signing>(
		&mut self, msg: &msgs::RevokeAndACK, secp_ctx: &Secp256k1<T>,
	) -> Result<(), ChannelError> {
		if !self.awaiting_remote_revocation() {
			return Err(ChannelError::Close("Received unexpected revoke_and_ack".to_owned()));
		}
		let secret = SecretKey::from_slice(&msg.per_commitment_secret)
			.map_err(|_| ChannelError::Close("Peer sent an invalid per-commitment secret".to_owned()))?;
		let revoked_index = self.remote_commit_index();
		let expected_point = self.active[0].remote_commit.remote_per_commitment_point;
		if PublicKey::from_secret_key(secp_ctx, &secret) != expected_point {
			return Err(ChannelError::Close("Peer's revocation secret does not match their per-commitment point".to_owned()));
		}
		self.remote_per_commitment_secrets
			.provide_secret(INITIAL_COMMITMENT_NUMBER - revoked_index, msg.per_commitment_secret)
			.map_err(|_| {
				ChannelError::Close("Peer's revocation secret is inconsistent with earlier secrets".to_owned())
			})?;

		for commitment in self.active.iter_mut() {
			let next = commitment
				.next_remote_commit
				.take()
				.expect("all active commitments advance in lock-step");
			commitment.remote_commit = next;
		}
		self.remote_next_per_commitment_point = Some(msg.next_per_commitment_point);
		self.local_changes.acked.append(&mut self.local_changes.signed);
		self.remote_changes.signed.clear();
		Ok(())
	}

	/// Adds a new active commitment (a splice or an RBF attempt) to the set.
	pub fn add_commitment(&mut self, commitment: Commitment) {
		self.active.push(commitment);
		// Keep candidates ordered newest-first within a funding index so the most recent RBF is
		// preferred when building and signing.
		self.active.sort_by(|a, b| b.funding_tx_index.cmp(&a.funding_tx_index));
	}

	/// Called once both parties have exchanged `splice_locked` for `locked_txid`: commitments
	/// with a lower funding index (and RBF siblings) become inactive.
	pub fn lock_funding(&mut self, locked_txid: Txid) -> Result<(), ChannelError> {
		let locked_index = self
			.active
			.iter()
			.find(|c| c.funding_outpoint.txid == locked_txid)
			.map(|c| c.funding_tx_index)
			.ok_or_else(|| {
				ChannelError::Close(format!("Cannot lock unknown funding tx {}", locked_txid))
			})?;
		let mut retained = Vec::with_capacity(self.active.len());
		for commitment in self.active.drain(..) {
			if commitment.funding_outpoint.txid == locked_txid
				|| commitment.funding_tx_index > locked_index
			{
				retained.push(commitment);
			} else {
				self.inactive.push(commitment);
			}
		}
		self.active = retained;
		Ok(())
	}

	/// Marks a funding transaction as confirmed, pruning double-spent siblings at the same
	/// funding index on first confirmation.
	pub fn funding_confirmed(&mut self, txid: Txid) -> Result<(), ChannelError> {
		let confirmed_index = self
			.active
			.iter()
			.find(|c| c.funding_outpoint.txid == txid)
			.map(|c| c.funding_tx_index)
			.ok_or_else(|| {
				ChannelError::Close(format!("Unknown funding tx {} confirmed", txid))
			})?;
		self.active.retain_mut(|c| {
			if c.funding_outpoint.txid == txid {
				c.funding_status = FundingStatus::Confirmed;
				true
			} else {
				// Siblings at the same index double-spend the confirmed tx and can never confirm.
				c.funding_tx_index != confirmed_index
			}
		});
		Ok(())
	}

	/// Drops inactive commitments which can no longer be resurrected by a reorg.
	pub fn prune_inactive(&mut self, min_retained_funding_index: u64) {
		self.inactive.retain(|c| c.funding_tx_index >= min_retained_funding_index);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::msgs::OnionPacket;
	use crate::ln::types::PaymentHash;
	use crate::sign::InMemorySigner;
	use crate::util::test_utils;
	use bitcoin::secp256k1::Secp256k1;

	fn onion() -> OnionPacket {
		let secp_ctx = Secp256k1::new();
		OnionPacket {
			version: 0,
			public_key: PublicKey::from_secret_key(
				&secp_ctx,
				&SecretKey::from_slice(&[42; 32]).unwrap(),
			),
			hop_data: [0; 1300],
			hmac: [0; 32],
		}
	}

	struct TestNode {
		signer: InMemorySigner,
		set: CommitmentSet,
	}

	/// Builds a pair of commitment sets wired to each other, with a 1M sat channel funded by the
	/// first node and balances split 600k/400k.
	fn test_pair() -> (TestNode, TestNode) {
		let secp_ctx = Secp256k1::new();
		let (set_a, signer_a, set_b, signer_b) = test_utils::linked_commitment_sets(
			&secp_ctx, 1_000_000, 600_000_000, 400_000_000,
		);
		(TestNode { signer: signer_a, set: set_a }, TestNode { signer: signer_b, set: set_b })
	}

	fn capacity_conserved(commitment: &Commitment, format: CommitmentFormat) {
		// to_local + to_remote + htlcs + fee + anchors == capacity on both sides' specs
		for (spec, _local) in
			[(&commitment.local_commit.spec, true), (&commitment.remote_commit.spec, false)]
		{
			let nondust = spec.htlcs.len(); // close enough at test feerates
			let fee_msat = commit_tx_fee_sat(spec.feerate_per_kw, nondust, format) * 1000;
			let anchors_msat = if format.has_anchors() { 660 * 1000 } else { 0 };
			assert_eq!(
				spec.total_msat(),
				commitment.capacity_satoshis * 1000,
				"spec must carry full capacity (fees are deducted at build time)"
			);
			// and the built outputs can never exceed capacity
			assert!(fee_msat + anchors_msat <= commitment.capacity_satoshis * 1000);
		}
	}

	fn sign_revoke_round(from: &mut TestNode, to: &mut TestNode) {
		let secp_ctx = Secp256k1::new();
		let sigs = from.set.send_commit(&from.signer, &secp_ctx).unwrap();
		let raa = to.set.receive_commit(&sigs, &to.signer, &secp_ctx).unwrap();
		from.set.receive_revocation(&raa, &secp_ctx).unwrap();
		// ...and the other direction, so both commitments converge
		if !to.set.local_changes.proposed.is_empty() || !to.set.remote_changes.acked.is_empty() {
			let sigs = to.set.send_commit(&to.signer, &secp_ctx).unwrap();
			let raa = from.set.receive_commit(&sigs, &from.signer, &secp_ctx).unwrap();
			to.set.receive_revocation(&raa, &secp_ctx).unwrap();
		}
	}

	#[test]
	fn test_add_sign_revoke_fulfill_lifecycle() {
		let (mut alice, mut bob) = test_pair();
		assert_eq!(alice.set.local_commit_index(), 0);

		let preimage = PaymentPreimage([17; 32]);
		let payment_hash = preimage.payment_hash();
		let add = alice
			.set
			.send_add_htlc(100_000_000, payment_hash, 500, onion(), None)
			.unwrap();
		assert_eq!(add.htlc_id, 0);
		bob.set.receive_add_htlc(&add).unwrap();

		sign_revoke_round(&mut alice, &mut bob);
		assert_eq!(alice.set.local_commit_index(), 1);
		assert_eq!(bob.set.local_commit_index(), 1);
		assert_eq!(alice.set.latest_local_spec().htlcs.len(), 1);
		assert_eq!(bob.set.latest_local_spec().htlcs.len(), 1);
		capacity_conserved(&alice.set.active[0], alice.set.params.commitment_format);

		// Bob settles with the preimage
		let fulfill = bob.set.send_fulfill_htlc(0, preimage).unwrap();
		alice.set.receive_fulfill_htlc(&fulfill).unwrap();
		sign_revoke_round(&mut bob, &mut alice);

		assert!(alice.set.latest_local_spec().htlcs.is_empty());
		assert!(bob.set.latest_local_spec().htlcs.is_empty());
		assert_eq!(alice.set.latest_local_spec().to_local_msat, 500_000_000);
		assert_eq!(bob.set.latest_local_spec().to_local_msat, 500_000_000);
		capacity_conserved(&alice.set.active[0], alice.set.params.commitment_format);
	}

	#[test]
	fn test_htlc_id_must_increase() {
		let (mut alice, mut bob) = test_pair();
		let add = alice
			.set
			.send_add_htlc(100_000_000, PaymentHash([1; 32]), 500, onion(), None)
			.unwrap();
		bob.set.receive_add_htlc(&add).unwrap();
		// Replay of the same id must close
		match bob.set.receive_add_htlc(&add) {
			Err(ChannelError::Close(_)) => {},
			_ => panic!("expected close on non-monotonic htlc id"),
		}
	}

	#[test]
	fn test_htlc_below_minimum_rejected() {
		let (mut alice, _) = test_pair();
		match alice.set.send_add_htlc(1, PaymentHash([1; 32]), 500, onion(), None) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("expected ignore on sub-minimum HTLC"),
		}
	}

	#[test]
	fn test_cannot_send_below_reserve() {
		let (mut alice, _) = test_pair();
		// Alice has 600k sat; the reserve is 10k sat and she pays the commit fee on top.
		// Sending 599k sat must fail, while 580k sat clears the reserve comfortably.
		match alice.set.send_add_htlc(599_000_000, PaymentHash([1; 32]), 500, onion(), None) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("expected ignore when balance insufficient"),
		}
		assert!(alice.set.send_add_htlc(580_000_000, PaymentHash([1; 32]), 500, onion(), None).is_ok());
	}

	#[test]
	fn test_fulfill_wrong_preimage_rejected() {
		let (mut alice, mut bob) = test_pair();
		let preimage = PaymentPreimage([17; 32]);
		let add = alice
			.set
			.send_add_htlc(100_000_000, preimage.payment_hash(), 500, onion(), None)
			.unwrap();
		bob.set.receive_add_htlc(&add).unwrap();
		sign_revoke_round(&mut alice, &mut bob);

		match bob.set.send_fulfill_htlc(0, PaymentPreimage([18; 32])) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("expected rejection of a wrong preimage"),
		}
	}

	#[test]
	fn test_update_fee_opener_only() {
		let (mut alice, mut bob) = test_pair();
		assert!(alice.set.send_fee(1000).is_ok());
		match bob.set.send_fee(1000) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("non-opener must not send update_fee"),
		}
		// And receiving a fee from the non-opener side is a protocol error
		let bogus = msgs::UpdateFee { channel_id: bob.set.params.channel_id, feerate_per_kw: 1000 };
		match alice.set.receive_fee(&bogus, 253) {
			Err(ChannelError::Close(_)) => {},
			_ => panic!("opener must reject update_fee"),
		}
	}

	#[test]
	fn test_revocation_secret_must_match() {
		let (mut alice, mut bob) = test_pair();
		let secp_ctx = Secp256k1::new();
		let add = alice
			.set
			.send_add_htlc(100_000_000, PaymentHash([1; 32]), 500, onion(), None)
			.unwrap();
		bob.set.receive_add_htlc(&add).unwrap();
		let sigs = alice.set.send_commit(&alice.signer, &secp_ctx).unwrap();
		let mut raa = bob.set.receive_commit(&sigs, &bob.signer, &secp_ctx).unwrap();
		raa.per_commitment_secret = [0x55; 32];
		match alice.set.receive_revocation(&raa, &secp_ctx) {
			Err(ChannelError::Close(_)) => {},
			_ => panic!("expected close on a bogus revocation secret"),
		}
	}

	#[test]
	fn test_indices_reconverge_after_crossed_updates() {
		// Both sides propose concurrently; after both run full sign/revoke round trips the
		// commitment indices and specs converge.
		let (mut alice, mut bob) = test_pair();
		let secp_ctx = Secp256k1::new();

		let add_a = alice
			.set
			.send_add_htlc(50_000_000, PaymentHash([1; 32]), 500, onion(), None)
			.unwrap();
		let add_b = bob
			.set
			.send_add_htlc(60_000_000, PaymentHash([2; 32]), 501, onion(), None)
			.unwrap();
		bob.set.receive_add_htlc(&add_a).unwrap();
		alice.set.receive_add_htlc(&add_b).unwrap();

		let sigs_a = alice.set.send_commit(&alice.signer, &secp_ctx).unwrap();
		let sigs_b = bob.set.send_commit(&bob.signer, &secp_ctx).unwrap();
		let raa_b = bob.set.receive_commit(&sigs_a, &bob.signer, &secp_ctx).unwrap();
		let raa_a = alice.set.receive_commit(&sigs_b, &alice.signer, &secp_ctx).unwrap();
		alice.set.receive_revocation(&raa_b, &secp_ctx).unwrap();
		bob.set.receive_revocation(&raa_a, &secp_ctx).unwrap();

		// Each side's commitment now includes the other's HTLC; one more round trip each way
		// commits the remaining halves.
		let sigs_a = alice.set.send_commit(&alice.signer, &secp_ctx).unwrap();
		let raa_b = bob.set.receive_commit(&sigs_a, &bob.signer, &secp_ctx).unwrap();
		alice.set.receive_revocation(&raa_b, &secp_ctx).unwrap();
		let sigs_b = bob.set.send_commit(&bob.signer, &secp_ctx).unwrap();
		let raa_a = alice.set.receive_commit(&sigs_b, &alice.signer, &secp_ctx).unwrap();
		bob.set.receive_revocation(&raa_a, &secp_ctx).unwrap();

		assert_eq!(alice.set.latest_local_spec().htlcs.len(), 2);
		assert_eq!(bob.set.latest_local_spec().htlcs.len(), 2);
		assert_eq!(
			alice.set.latest_local_spec().to_local_msat,
			bob.set.latest_local_spec().to_remote_msat
		);
		assert_eq!(alice.set.local_commit_index(), bob.set.remote_commit_index());
	}
}
