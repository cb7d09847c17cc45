// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-channel state machine.
//!
//! A [`Channel`] routes peer messages, local commands, and chain events through an explicit
//! state graph. All state for one channel is owned by one value and is expected to be driven by
//! a single task; cross-channel concurrency happens above this module. Handlers return the
//! messages to send, and every transition which could expose funds if replayed wrong sets the
//! persistence flag before the caller is given anything to transmit.

use bitcoin::hash_types::Txid;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::transaction::Transaction;

use crate::chain::chaininterface::FEERATE_FLOOR_SATS_PER_KW;
use crate::chain::transaction::OutPoint;
use crate::ln::chan_utils::ClosingTransaction;
use crate::ln::channel_splice::{PendingSplice, SpliceStatus};
use crate::ln::commitments::{
	build_commitment_transaction, Commitment, CommitmentSet, FundingStatus, LocalCommit,
	RemoteCommit,
};
use crate::ln::interactivetxs::{
	validate_rbf_attempt, validate_will_fund, AbortReason, ConstructedTransaction,
	InteractiveTxConstructor, InteractiveTxMessageSend, NegotiationParams, SharedFundingInput,
	SharedFundingOutput,
};
use crate::ln::chan_utils::HolderCommitmentTransaction;
use crate::ln::msgs;
use crate::ln::types::ChannelId;
use crate::sign::{EntropySource, InMemorySigner};
use crate::util::logger::Logger;

use core::ops::Deref;

/// An error in handling a channel message or command, graded by its consequence.
#[derive(Clone, Debug)]
pub enum ChannelError {
	/// A local problem: report failure to the caller, change nothing, tell the peer nothing.
	Ignore(String),
	/// A remote protocol deviation which does not endanger funds: send a `warning` and schedule
	/// a disconnect, keeping the channel state as it was.
	Warn(String),
	/// A protocol violation which makes continuing unsafe: the channel must be force-closed.
	Close(String),
}

impl ChannelError {
	/// The wire message (if any) reporting this error to the peer.
	pub fn into_wire_message(self, channel_id: ChannelId) -> Option<msgs::WarningMessage> {
		match self {
			ChannelError::Ignore(_) => None,
			ChannelError::Warn(data) => Some(msgs::WarningMessage { channel_id, data }),
			ChannelError::Close(data) => Some(msgs::WarningMessage { channel_id, data }),
		}
	}
}

/// The fee negotiation progress of a mutual close.
#[derive(Clone, Debug, Default)]
pub struct ClosingNegotiation {
	/// The last fee we proposed, if any.
	pub last_sent_fee_satoshis: Option<u64>,
	/// The last fee the peer proposed, if any.
	pub last_received_fee_satoshis: Option<u64>,
}

/// The top-level state of a channel. Each state holds exactly the data relevant to it.
pub enum ChannelState {
	/// We sent or received `open_channel` and are exchanging setup messages.
	Opening {
		/// The temporary channel id used until the funding outpoint exists.
		temporary_channel_id: ChannelId,
	},
	/// The funding transaction is signed and (being) broadcast; waiting for confirmations.
	AwaitingFundingConfirmation {
		/// The depth the acceptor demanded.
		minimum_depth: u32,
	},
	/// The funding transaction is confirmed; waiting for both `channel_ready` messages.
	AwaitingChannelReady,
	/// The channel is usable for payments.
	Normal {
		/// The quiescence hand-shake state.
		quiescence: QuiescenceState,
		/// The splice (or splice-RBF) negotiation in flight, if any. An RBF attempt is a
		/// [`PendingSplice`] whose funding index equals an existing active commitment's.
		splice: SpliceStatus,
	},
	/// `shutdown` has been exchanged; in-flight HTLCs are being settled, no new ones accepted.
	Shutdown {
		/// The script we will close to.
		local_script: ScriptBuf,
		/// The script the peer will close to.
		remote_script: ScriptBuf,
	},
	/// All HTLCs are resolved and `closing_signed` fees are being negotiated.
	Negotiating {
		/// The script we will close to.
		local_script: ScriptBuf,
		/// The script the peer will close to.
		remote_script: ScriptBuf,
		/// The fee negotiation progress.
		negotiation: ClosingNegotiation,
	},
	/// A mutual close transaction is published and awaiting confirmation.
	Closing {
		/// The txid of the agreed closing transaction.
		closing_txid: Txid,
	},
	/// We have broadcast our commitment; the on-chain reactor owns resolution from here.
	ForceClosing,
	/// Fully resolved on chain. Terminal.
	Closed,
	/// The peer is disconnected; `resume` is the state to return to after reestablish.
	Offline {
		/// The state we will resume once reestablished.
		resume: Box<ChannelState>,
	},
}

/// Progress of the `stfu` quiescence handshake which precedes a splice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuiescenceState {
	/// Traffic flows normally.
	Live,
	/// We sent `stfu` and await the peer's.
	StfuSent {
		/// Whether we were the initiator (relevant when both send simultaneously).
		local_initiated: bool,
	},
	/// Both sides are quiescent: no update traffic (additions, settlements, fee changes, or
	/// ordinary signing rounds) may be sent or accepted until the splice resolves.
	Quiescent {
		/// Whether we initiated quiescence (the initiator drives the splice).
		local_initiated: bool,
	},
}

/// Everything the peer must be sent after a reestablish, in order.
#[derive(Default)]
pub struct Retransmissions {
	/// Our channel_reestablish has already been sent; these follow it.
	pub commitment_signed: Option<Vec<msgs::CommitmentSigned>>,
	/// A re-send of our last revocation.
	pub revoke_and_ack: Option<msgs::RevokeAndACK>,
	/// A re-send of our funding signatures for an in-flight splice.
	pub tx_signatures: Option<msgs::TxSignatures>,
	/// A re-send of our `splice_locked`.
	pub splice_locked: Option<msgs::SpliceLocked>,
	/// An abort for a splice the peer references but we do not know.
	pub tx_abort: Option<msgs::TxAbort>,
}

/// A channel, owned by exactly one task which serializes all its transitions.
pub struct Channel<L: Deref>
where
	L::Target: Logger,
{
	/// The signed bilateral state.
	pub commitments: CommitmentSet,
	signer: InMemorySigner,
	secp_ctx: Secp256k1<All>,
	logger: L,
	state: ChannelState,
	connected: bool,
	/// Set whenever the channel state must hit the database before any further message is
	/// released to the peer.
	needs_persist: bool,
	/// Set when a remote deviation warrants disconnecting after the pending warning is sent.
	scheduled_disconnect: bool,
	/// The exact commitment_signed batch we last sent, retained verbatim until the peer's
	/// revoke_and_ack so a reestablish can retransmit identical bytes.
	sent_commitment_signed: Option<Vec<msgs::CommitmentSigned>>,
	/// The last revoke_and_ack we sent, retained until the peer acknowledges it by signing.
	sent_revoke_and_ack: Option<msgs::RevokeAndACK>,
	/// A splice_locked we sent which the peer has not yet matched.
	sent_splice_locked: Option<msgs::SpliceLocked>,
	/// The remote commitment of a splice being signed, stashed between our `commitment_signed`
	/// send and the peer's.
	pending_splice_remote_commit: Option<RemoteCommit>,
}

impl<L: Deref> Channel<L>
where
	L::Target: Logger,
{
	/// Assembles a channel in `Normal` state from already-established commitments. The opening
	/// handshake lives in [`PendingChannel`]; reload from disk also ends up here.
	pub fn from_commitments(commitments: CommitmentSet, signer: InMemorySigner, logger: L) -> Self {
		Channel {
			commitments,
			signer,
			secp_ctx: Secp256k1::new(),
			logger,
			state: ChannelState::Normal {
				quiescence: QuiescenceState::Live,
				splice: SpliceStatus::None,
			},
			connected: true,
			needs_persist: true,
			scheduled_disconnect: false,
			sent_commitment_signed: None,
			sent_revoke_and_ack: None,
			sent_splice_locked: None,
			pending_splice_remote_commit: None,
		}
	}

	/// The channel's id.
	pub fn channel_id(&self) -> ChannelId {
		self.commitments.params.channel_id
	}

	/// Whether the channel has a transition which must be persisted.
	pub fn needs_persist(&self) -> bool {
		self.needs_persist
	}

	/// Marks in-memory state as durably stored.
	pub fn persistence_completed(&mut self) {
		self.needs_persist = false;
	}

	/// Whether a remote deviation has scheduled a disconnect.
	pub fn disconnect_scheduled(&self) -> bool {
		self.scheduled_disconnect
	}

	fn quiescence(&self) -> &QuiescenceState {
		match &self.state {
			ChannelState::Normal { quiescence, .. } => quiescence,
			_ => &QuiescenceState::Live,
		}
	}

	fn normal_state_mut(
		&mut self,
	) -> Result<(&mut QuiescenceState, &mut SpliceStatus), ChannelError> {
		match &mut self.state {
			ChannelState::Normal { quiescence, splice } => Ok((quiescence, splice)),
			_ => Err(ChannelError::Ignore("Channel is not in the normal state".to_owned())),
		}
	}

	fn require_usable(&self) -> Result<(), ChannelError> {
		if !self.connected {
			return Err(ChannelError::Ignore(
				"Cannot update the channel while disconnected".to_owned(),
			));
		}
		match self.state {
			ChannelState::Normal { .. } => Ok(()),
			ChannelState::Shutdown { .. } => {
				Err(ChannelError::Ignore("Channel is shutting down".to_owned()))
			},
			_ => Err(ChannelError::Ignore("Channel is not usable".to_owned())),
		}
	}

	fn require_not_quiescent(&self) -> Result<(), ChannelError> {
		match self.quiescence() {
			QuiescenceState::Live => Ok(()),
			_ => Err(ChannelError::Ignore(
				"Cannot update the channel while it is quiescing".to_owned(),
			)),
		}
	}

	/// Rejects a remote update which arrived while the channel is quiescent: warn and schedule
	/// a disconnect, keeping the channel state as it was.
	fn reject_quiescence_violation(&mut self, message: &str) -> Result<(), ChannelError> {
		if let QuiescenceState::Quiescent { .. } = self.quiescence() {
			self.scheduled_disconnect = true;
			return Err(ChannelError::Warn(format!(
				"{} received while the channel is quiescent",
				message
			)));
		}
		Ok(())
	}

	// ===== HTLC updates ====================================================================

	/// Proposes a new outgoing HTLC.
	pub fn send_add_htlc(
		&mut self, amount_msat: u64, payment_hash: crate::ln::types::PaymentHash,
		cltv_expiry: u32, onion_routing_packet: msgs::OnionPacket,
		blinding_point: Option<PublicKey>,
	) -> Result<msgs::UpdateAddHTLC, ChannelError> {
		self.require_usable()?;
		match self.quiescence() {
			QuiescenceState::Live => {},
			_ => {
				return Err(ChannelError::Ignore(
					"Cannot add an HTLC while the channel is quiescing".to_owned(),
				))
			},
		}
		self.commitments.send_add_htlc(
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
			blinding_point,
		)
	}

	/// Handles an incoming `update_add_htlc`.
	pub fn handle_update_add_htlc(
		&mut self, msg: &msgs::UpdateAddHTLC,
	) -> Result<(), ChannelError> {
		match self.quiescence() {
			QuiescenceState::Live => {},
			_ => {
				// Reception of an add during quiescence is a protocol deviation but not an
				// attack on funds: warn and schedule a disconnect.
				self.scheduled_disconnect = true;
				return Err(ChannelError::Warn(
					"update_add_htlc received while the channel is quiescent".to_owned(),
				));
			},
		}
		match self.state {
			ChannelState::Shutdown { .. } => {
				return Err(ChannelError::Close(
					"update_add_htlc received after shutdown".to_owned(),
				))
			},
			_ => {},
		}
		self.commitments.receive_add_htlc(msg)
	}

	/// Settles an incoming HTLC with its preimage.
	pub fn send_fulfill_htlc(
		&mut self, htlc_id: u64, payment_preimage: crate::ln::types::PaymentPreimage,
	) -> Result<msgs::UpdateFulfillHTLC, ChannelError> {
		self.require_not_quiescent()?;
		self.commitments.send_fulfill_htlc(htlc_id, payment_preimage)
	}

	/// Handles an incoming `update_fulfill_htlc`.
	pub fn handle_update_fulfill_htlc(
		&mut self, msg: &msgs::UpdateFulfillHTLC,
	) -> Result<(), ChannelError> {
		self.reject_quiescence_violation("update_fulfill_htlc")?;
		self.commitments.receive_fulfill_htlc(msg)
	}

	/// Fails an incoming HTLC.
	pub fn send_fail_htlc(
		&mut self, htlc_id: u64, reason: msgs::OnionErrorPacket,
	) -> Result<msgs::UpdateFailHTLC, ChannelError> {
		self.require_not_quiescent()?;
		self.commitments.send_fail_htlc(htlc_id, reason)
	}

	/// Handles an incoming `update_fail_htlc`.
	pub fn handle_update_fail_htlc(
		&mut self, msg: &msgs::UpdateFailHTLC,
	) -> Result<(), ChannelError> {
		self.reject_quiescence_violation("update_fail_htlc")?;
		self.commitments.receive_fail_htlc(msg)
	}

	/// Handles an incoming `update_fail_malformed_htlc`.
	pub fn handle_update_fail_malformed_htlc(
		&mut self, msg: &msgs::UpdateFailMalformedHTLC,
	) -> Result<(), ChannelError> {
		self.reject_quiescence_violation("update_fail_malformed_htlc")?;
		self.commitments.receive_fail_malformed_htlc(msg)
	}

	/// Proposes a commitment feerate update (opener only).
	pub fn send_update_fee(&mut self, feerate_per_kw: u32) -> Result<msgs::UpdateFee, ChannelError> {
		self.require_usable()?;
		self.require_not_quiescent()?;
		self.commitments.send_fee(feerate_per_kw)
	}

	/// Handles an incoming `update_fee`.
	pub fn handle_update_fee(&mut self, msg: &msgs::UpdateFee) -> Result<(), ChannelError> {
		self.reject_quiescence_violation("update_fee")?;
		self.commitments.receive_fee(msg, FEERATE_FLOOR_SATS_PER_KW)
	}

	// ===== Commitment signing ==============================================================

	/// Signs the peer's next commitment(s). The returned messages must be sent after every
	/// pending update message which they commit to.
	pub fn send_commitment(&mut self) -> Result<Vec<msgs::CommitmentSigned>, ChannelError> {
		self.require_not_quiescent()?;
		if self.pending_splice_remote_commit.is_some() {
			return Err(ChannelError::Ignore(
				"Cannot sign while a splice commitment exchange is incomplete".to_owned(),
			));
		}
		let msgs = self.commitments.send_commit(&self.signer, &self.secp_ctx)?;
		self.sent_commitment_signed = Some(msgs.clone());
		self.needs_persist = true;
		Ok(msgs)
	}

	/// Handles a batch of incoming `commitment_signed` messages. The revocation it returns is
	/// emitted exactly once per received (batch of) `commitment_signed`, in order.
	///
	/// A splice's own `commitment_signed` goes through
	/// [`Channel::handle_splice_commitment_signed`] instead; an ordinary signing round while
	/// quiescent is a protocol deviation.
	pub fn handle_commitment_signed(
		&mut self, msgs_in: &[msgs::CommitmentSigned],
	) -> Result<msgs::RevokeAndACK, ChannelError> {
		self.reject_quiescence_violation("commitment_signed")?;
		if self.pending_splice_remote_commit.is_some() {
			self.scheduled_disconnect = true;
			return Err(ChannelError::Warn(
				"commitment_signed received while a splice commitment exchange is incomplete"
					.to_owned(),
			));
		}
		let raa = self.commitments.receive_commit(msgs_in, &self.signer, &self.secp_ctx)?;
		// Receiving a valid signature means the peer can broadcast this state: persist before
		// replying.
		self.needs_persist = true;
		self.sent_revoke_and_ack = Some(raa.clone());
		log_debug!(
			self.logger,
			"Advanced local commitment for channel {} to index {}",
			self.channel_id(),
			self.commitments.local_commit_index()
		);
		Ok(raa)
	}

	/// Handles an incoming `revoke_and_ack`.
	pub fn handle_revoke_and_ack(&mut self, msg: &msgs::RevokeAndACK) -> Result<(), ChannelError> {
		self.commitments.receive_revocation(msg, &self.secp_ctx)?;
		// We must never lose a revealed revocation secret: persist before anything else.
		self.needs_persist = true;
		self.sent_commitment_signed = None;
		log_debug!(
			self.logger,
			"Peer revoked commitment; remote index now {} on channel {}",
			self.commitments.remote_commit_index(),
			self.channel_id()
		);
		Ok(())
	}

	// ===== Quiescence ======================================================================

	/// Starts the quiescence handshake required before a splice.
	pub fn begin_quiescence(&mut self) -> Result<msgs::Stfu, ChannelError> {
		self.require_usable()?;
		if !self.commitments.local_changes.proposed.is_empty()
			|| self.commitments.awaiting_remote_revocation()
		{
			return Err(ChannelError::Ignore(
				"Cannot quiesce with unsigned or unrevoked updates in flight".to_owned(),
			));
		}
		let channel_id = self.channel_id();
		let (quiescence, _) = self.normal_state_mut()?;
		match quiescence {
			QuiescenceState::Live => {
				*quiescence = QuiescenceState::StfuSent { local_initiated: true };
				Ok(msgs::Stfu { channel_id, initiator: 1 })
			},
			_ => Err(ChannelError::Ignore("Quiescence already in progress".to_owned())),
		}
	}

	/// Handles an incoming `stfu`, replying with ours when we had not initiated.
	pub fn handle_stfu(&mut self, msg: &msgs::Stfu) -> Result<Option<msgs::Stfu>, ChannelError> {
		let channel_id = self.channel_id();
		let we_are_opener = self.commitments.params.is_outbound_from_holder;
		let (quiescence, _) = self.normal_state_mut()?;
		match quiescence {
			QuiescenceState::Live => {
				if msg.initiator != 1 {
					return Err(ChannelError::Warn(
						"stfu reply received without a pending stfu".to_owned(),
					));
				}
				*quiescence = QuiescenceState::Quiescent { local_initiated: false };
				Ok(Some(msgs::Stfu { channel_id, initiator: 0 }))
			},
			QuiescenceState::StfuSent { local_initiated } => {
				// Simultaneous initiation resolves in favor of the channel opener.
				let local_initiated =
					*local_initiated && (msg.initiator == 0 || we_are_opener);
				*quiescence = QuiescenceState::Quiescent { local_initiated };
				Ok(None)
			},
			QuiescenceState::Quiescent { .. } => {
				Err(ChannelError::Warn("stfu received while already quiescent".to_owned()))
			},
		}
	}

	// ===== Splicing ========================================================================

	/// Initiates a splice once the channel is quiescent, declaring our contribution.
	pub fn initiate_splice(
		&mut self, contribution_satoshis: i64, funding_feerate_per_kw: u32, locktime: u32,
		request_funding: Option<msgs::RequestFunding>,
	) -> Result<msgs::SpliceInit, ChannelError> {
		let channel_id = self.channel_id();
		let funding_pubkey = self.commitments.params.holder.pubkeys.funding_pubkey;
		let funding_tx_index = self.commitments.active[0].funding_tx_index + 1;
		let (quiescence, splice) = self.normal_state_mut()?;
		match quiescence {
			QuiescenceState::Quiescent { local_initiated: true } => {},
			_ => {
				return Err(ChannelError::Ignore(
					"A splice requires an initiated, quiescent channel".to_owned(),
				))
			},
		}
		if splice.is_active() {
			return Err(ChannelError::Ignore("A splice is already in progress".to_owned()));
		}
		*splice = SpliceStatus::Requested(PendingSplice {
			we_initiated: true,
			our_contribution_satoshis: contribution_satoshis,
			their_contribution_satoshis: 0,
			funding_feerate_per_kw,
			locktime,
			funding_tx_index,
			liquidity_fee_msat: None,
			request_funding: request_funding.clone(),
		});
		Ok(msgs::SpliceInit {
			channel_id,
			funding_contribution_satoshis: contribution_satoshis,
			funding_feerate_perkw: funding_feerate_per_kw,
			locktime,
			funding_pubkey,
			require_confirmed_inputs: None,
			request_funding,
		})
	}

	/// Handles an incoming `splice_init`, creating the acceptor-side construction session.
	pub fn handle_splice_init<ES: EntropySource>(
		&mut self, msg: &msgs::SpliceInit, entropy_source: &ES,
		our_inputs: Vec<crate::ln::interactivetxs::FundingTxInput>, our_outputs: Vec<bitcoin::TxOut>,
		our_contribution_satoshis: i64,
	) -> Result<msgs::SpliceAck, ChannelError> {
		match self.quiescence() {
			QuiescenceState::Quiescent { local_initiated: false } => {},
			_ => {
				return Err(ChannelError::Warn(
					"splice_init on a channel that is not quiescent".to_owned(),
				))
			},
		}
		let base = &self.commitments.active[0];
		let pending = PendingSplice {
			we_initiated: false,
			our_contribution_satoshis,
			their_contribution_satoshis: msg.funding_contribution_satoshis,
			funding_feerate_per_kw: msg.funding_feerate_perkw,
			locktime: msg.locktime,
			funding_tx_index: base.funding_tx_index + 1,
			liquidity_fee_msat: None,
			request_funding: msg.request_funding.clone(),
		};
		let params = self.splice_negotiation_params(&pending, false)?;
		let (constructor, first) =
			InteractiveTxConstructor::new(params, entropy_source, our_inputs, our_outputs)
				.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
		debug_assert!(first.is_none());
		let funding_pubkey = self.commitments.params.holder.pubkeys.funding_pubkey;
		let channel_id = self.channel_id();
		let (_, splice) = self.normal_state_mut()?;
		*splice = SpliceStatus::InProgress { pending, constructor };
		Ok(msgs::SpliceAck {
			channel_id,
			funding_contribution_satoshis: our_contribution_satoshis,
			funding_pubkey,
			require_confirmed_inputs: None,
			will_fund: None,
		})
	}

	/// Handles the peer's `splice_ack`, starting the initiator-side construction session.
	/// `counterparty_node_id` is the peer's node identity key, needed to check a liquidity
	/// purchase witness.
	pub fn handle_splice_ack<ES: EntropySource>(
		&mut self, msg: &msgs::SpliceAck, entropy_source: &ES,
		counterparty_node_id: &PublicKey,
		our_inputs: Vec<crate::ln::interactivetxs::FundingTxInput>, our_outputs: Vec<bitcoin::TxOut>,
	) -> Result<InteractiveTxMessageSend, ChannelError> {
		let (_, splice) = self.normal_state_mut()?;
		let mut pending = match core::mem::replace(splice, SpliceStatus::None) {
			SpliceStatus::Requested(pending) => pending,
			other => {
				*splice = other;
				return Err(ChannelError::Warn("splice_ack without a pending splice".to_owned()));
			},
		};
		pending.their_contribution_satoshis = msg.funding_contribution_satoshis;
		if let (Some(request), Some(will_fund)) = (&pending.request_funding, &msg.will_fund) {
			let fee_msat =
				validate_will_fund(request, will_fund, counterparty_node_id, &self.secp_ctx)
					.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
			pending.liquidity_fee_msat = Some(fee_msat);
		} else if pending.request_funding.is_some() {
			// The acceptor declined to fund; the splice proceeds without the purchase.
			pending.liquidity_fee_msat = None;
		}
		let params = self.splice_negotiation_params(&pending, true)?;
		let (constructor, first) =
			InteractiveTxConstructor::new(params, entropy_source, our_inputs, our_outputs)
				.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
		let first = first.expect("the initiator always has the shared contributions to send");
		let (_, splice) = self.normal_state_mut()?;
		*splice = SpliceStatus::InProgress { pending, constructor };
		Ok(first)
	}

	/// The commitment a splice (or RBF) at the given funding index builds on.
	fn splice_parent(&self, funding_tx_index: u64) -> Result<&Commitment, ChannelError> {
		self.commitments
			.active
			.iter()
			.find(|c| c.funding_tx_index + 1 == funding_tx_index)
			.ok_or_else(|| {
				ChannelError::Close("Splice references a funding index we do not have".to_owned())
			})
	}

	fn splice_negotiation_params(
		&self, pending: &PendingSplice, we_initiated: bool,
	) -> Result<NegotiationParams, ChannelError> {
		let base = self.splice_parent(pending.funding_tx_index)?;
		let post_capacity = pending.post_capacity_satoshis(base.capacity_satoshis);
		let funding_script = crate::ln::chan_utils::make_funding_redeemscript(
			&self.commitments.params.holder.pubkeys.funding_pubkey,
			&self.commitments.params.counterparty.pubkeys.funding_pubkey,
		)
		.to_p2wsh();
		Ok(NegotiationParams {
			channel_id: self.channel_id(),
			holder_is_initiator: we_initiated,
			feerate_sat_per_kw: pending.funding_feerate_per_kw,
			feerate_floor_sat_per_kw: FEERATE_FLOOR_SATS_PER_KW,
			require_confirmed_inputs: false,
			locktime: pending.locktime,
			shared_funding_input: Some(SharedFundingInput {
				outpoint: base.funding_outpoint.into_bitcoin_outpoint(),
				value_satoshis: base.capacity_satoshis,
			}),
			shared_funding_output: SharedFundingOutput {
				script_pubkey: funding_script,
				value_satoshis: post_capacity,
			},
			holder_contribution_satoshis: pending.our_contribution_satoshis,
			counterparty_contribution_satoshis: pending.their_contribution_satoshis,
		})
	}

	fn with_splice_constructor<F>(&mut self, handler: F) -> Result<SpliceStep, ChannelError>
	where
		F: FnOnce(&mut InteractiveTxConstructor) -> Result<
			(Option<InteractiveTxMessageSend>, Option<ConstructedTransaction>),
			AbortReason,
		>,
	{
		let channel_id = self.channel_id();
		let (quiescence, splice) = self.normal_state_mut()?;
		match splice {
			SpliceStatus::InProgress { constructor, .. } => match handler(constructor) {
				Ok((message, None)) => Ok(SpliceStep::Message(message)),
				Ok((message, Some(constructed))) => Ok(SpliceStep::Concluded(message, constructed)),
				Err(reason) => {
					*splice = SpliceStatus::None;
					*quiescence = QuiescenceState::Live;
					Ok(SpliceStep::Aborted(reason.into_tx_abort(channel_id)))
				},
			},
			_ => Err(ChannelError::Warn(
				"interactive-tx message without a splice in progress".to_owned(),
			)),
		}
	}

	/// Handles one incoming interactive-construction message for the splice in flight.
	///
	/// On conclusion, the new commitment is created on every path in lock-step and our
	/// `commitment_signed` batch for it is produced.
	pub fn handle_interactive_tx_message(
		&mut self, msg: &InteractiveTxMessageIn,
	) -> Result<SpliceProgress, ChannelError> {
		let step = match msg {
			InteractiveTxMessageIn::TxAddInput(m) => {
				self.with_splice_constructor(|c| c.handle_tx_add_input(m, true).map(|m| (Some(m), None)))?
			},
			InteractiveTxMessageIn::TxAddOutput(m) => {
				self.with_splice_constructor(|c| c.handle_tx_add_output(m).map(|m| (Some(m), None)))?
			},
			InteractiveTxMessageIn::TxRemoveInput(m) => {
				self.with_splice_constructor(|c| c.handle_tx_remove_input(m).map(|m| (Some(m), None)))?
			},
			InteractiveTxMessageIn::TxRemoveOutput(m) => {
				self.with_splice_constructor(|c| c.handle_tx_remove_output(m).map(|m| (Some(m), None)))?
			},
			InteractiveTxMessageIn::TxComplete(m) => {
				self.with_splice_constructor(|c| c.handle_tx_complete(m))?
			},
			InteractiveTxMessageIn::TxAbort(m) => {
				let (quiescence, splice) = self.normal_state_mut()?;
				if let SpliceStatus::InProgress { constructor, .. } = splice {
					constructor.handle_tx_abort(m);
				}
				*splice = SpliceStatus::None;
				*quiescence = QuiescenceState::Live;
				self.pending_splice_remote_commit = None;
				return Ok(SpliceProgress::Aborted);
			},
		};
		match step {
			SpliceStep::Message(message) => Ok(SpliceProgress::Continue(message)),
			SpliceStep::Aborted(abort) => Ok(SpliceProgress::Abort(abort)),
			SpliceStep::Concluded(message, constructed) => {
				let commit_sigs = self.conclude_splice_construction(constructed)?;
				Ok(SpliceProgress::Concluded { last_message: message, commit_sigs })
			},
		}
	}

	/// Once construction concludes, create the new active commitment and sign the peer's view
	/// of it (plus every other active commitment - a full batch).
	fn conclude_splice_construction(
		&mut self, constructed: ConstructedTransaction,
	) -> Result<Vec<msgs::CommitmentSigned>, ChannelError> {
		let (pending, session) = {
			let (_, splice) = self.normal_state_mut()?;
			match core::mem::replace(splice, SpliceStatus::None) {
				SpliceStatus::InProgress { pending, constructor } => {
					if !pending.matches_constructed(&constructed) {
						return Err(ChannelError::Close(
							"Constructed splice does not match the declared contributions".to_owned(),
						));
					}
					let session = constructor
						.into_signing_session()
						.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
					(pending, session)
				},
				other => {
					*splice = other;
					return Err(ChannelError::Warn("No splice construction in flight".to_owned()));
				},
			}
		};

		let base = self.splice_parent(pending.funding_tx_index)?;
		let (to_local_msat, to_remote_msat) = pending.post_balances_msat(
			base.local_commit.spec.to_local_msat,
			base.local_commit.spec.to_remote_msat,
		);
		let mut spec = base.local_commit.spec.clone();
		spec.to_local_msat = to_local_msat;
		spec.to_remote_msat = to_remote_msat;

		let funding_outpoint = OutPoint {
			txid: constructed.txid(),
			index: constructed.shared_output_index as u16,
		};
		let capacity = constructed.shared_output_value_satoshis;

		// Build and sign the peer's commitment on the new funding output at the current remote
		// index.
		let remote_index = base.remote_commit.index;
		let remote_point = base.remote_commit.remote_per_commitment_point;
		let mut remote_spec = base.remote_commit.spec.clone();
		let (remote_to_local, remote_to_remote) = pending
			.post_balances_msat(remote_spec.to_local_msat, remote_spec.to_remote_msat);
		remote_spec.to_local_msat = remote_to_local;
		remote_spec.to_remote_msat = remote_to_remote;

		let new_commitment = Commitment {
			funding_tx_index: pending.funding_tx_index,
			funding_outpoint,
			capacity_satoshis: capacity,
			funding_status: FundingStatus::DualFundedUnconfirmed {
				liquidity_fee_msat: pending.liquidity_fee_msat,
			},
			// The local commit is provisional until the peer's commitment_signed for this
			// funding arrives; we reuse the current signatures only as a placeholder and they
			// are replaced in handle_splice_commitment_signed before anything can be broadcast.
			local_commit: LocalCommit {
				index: base.local_commit.index,
				spec: spec.clone(),
				commit_tx: base.local_commit.commit_tx.clone(),
			},
			remote_commit: RemoteCommit {
				index: remote_index,
				spec: remote_spec.clone(),
				txid: base.remote_commit.txid,
				remote_per_commitment_point: remote_point,
			},
			next_remote_commit: None,
		};

		let tx_params = new_commitment.transaction_parameters(&self.commitments.params);
		let (remote_commit_tx, _) = build_commitment_transaction(
			false,
			remote_index,
			&remote_spec,
			&remote_point,
			&tx_params,
			&self.secp_ctx,
		);
		let (signature, htlc_signatures) =
			self.signer.sign_counterparty_commitment(&remote_commit_tx, &tx_params, &self.secp_ctx);

		self.pending_splice_remote_commit = Some(RemoteCommit {
			index: remote_index,
			spec: remote_spec,
			txid: remote_commit_tx.txid(),
			remote_per_commitment_point: remote_point,
		});

		self.commitments.add_commitment(new_commitment);
		let (_, splice) = self.normal_state_mut()?;
		*splice = SpliceStatus::WaitingForSigs { pending, session };
		self.needs_persist = true;

		let batch_size = self.commitments.active.len() as u16;
		let mut sigs = vec![msgs::CommitmentSigned {
			channel_id: self.channel_id(),
			signature,
			htlc_signatures,
			batch: Some(msgs::CommitmentSignedBatch {
				batch_size,
				funding_txid: funding_outpoint.txid,
			}),
		}];
		// Existing commitments are unchanged by the splice itself; their signatures in the
		// batch re-commit to the same state.
		for commitment in
			self.commitments.active.iter().filter(|c| c.funding_outpoint != funding_outpoint)
		{
			let tx_params = commitment.transaction_parameters(&self.commitments.params);
			let (commit_tx, _) = build_commitment_transaction(
				false,
				commitment.remote_commit.index,
				&commitment.remote_commit.spec,
				&commitment.remote_commit.remote_per_commitment_point,
				&tx_params,
				&self.secp_ctx,
			);
			let (signature, htlc_signatures) =
				self.signer.sign_counterparty_commitment(&commit_tx, &tx_params, &self.secp_ctx);
			sigs.push(msgs::CommitmentSigned {
				channel_id: self.channel_id(),
				signature,
				htlc_signatures,
				batch: Some(msgs::CommitmentSignedBatch {
					batch_size,
					funding_txid: commitment.funding_outpoint.txid,
				}),
			});
		}
		Ok(sigs)
	}

	/// Handles the peer's `commitment_signed` for a just-constructed splice transaction,
	/// verifying their signature over our commitment on the new funding output.
	pub fn handle_splice_commitment_signed(
		&mut self, msg: &msgs::CommitmentSigned,
	) -> Result<(), ChannelError> {
		let pending_remote = self
			.pending_splice_remote_commit
			.take()
			.ok_or_else(|| ChannelError::Warn("Unexpected splice commitment_signed".to_owned()))?;
		let new_funding_txid = match &msg.batch {
			Some(batch) => batch.funding_txid,
			None => {
				return Err(ChannelError::Warn(
					"Splice commitment_signed missing batch info".to_owned(),
				))
			},
		};
		let params = self.commitments.params.clone();
		let commitment = self
			.commitments
			.active
			.iter_mut()
			.find(|c| c.funding_outpoint.txid == new_funding_txid)
			.ok_or_else(|| {
				ChannelError::Warn("commitment_signed for an unknown splice funding".to_owned())
			})?;

		let tx_params = commitment.transaction_parameters(&params);
		let local_index = commitment.local_commit.index;
		let per_commitment_point = self.signer.get_per_commitment_point(
			crate::ln::commitments::INITIAL_COMMITMENT_NUMBER - local_index,
			&self.secp_ctx,
		);
		let (commit_tx, _) = build_commitment_transaction(
			true,
			local_index,
			&commitment.local_commit.spec,
			&per_commitment_point,
			&tx_params,
			&self.secp_ctx,
		);
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		let sighash = commit_tx
			.built_transaction()
			.get_sighash_all(&funding_redeemscript, tx_params.channel_value_satoshis);
		if self
			.secp_ctx
			.verify_ecdsa(&sighash, &msg.signature, &params.counterparty.pubkeys.funding_pubkey)
			.is_err()
		{
			return Err(ChannelError::Close(
				"Invalid commitment signature on splice funding".to_owned(),
			));
		}
		if msg.htlc_signatures.len() != commit_tx.nondust_htlcs().len() {
			return Err(ChannelError::Close(
				"Wrong number of HTLC signatures on splice commitment".to_owned(),
			));
		}
		let contest_delay = params.counterparty.to_self_delay;
		for (idx, htlc_sig) in msg.htlc_signatures.iter().enumerate() {
			let countersignatory_htlc_key =
				commit_tx.trust_key_derivation().countersignatory_htlc_key;
			if commit_tx
				.verify_htlc_sig(idx, contest_delay, &countersignatory_htlc_key, htlc_sig, &self.secp_ctx)
				.is_err()
			{
				return Err(ChannelError::Close(
					"Invalid HTLC signature on splice commitment".to_owned(),
				));
			}
		}

		commitment.local_commit = LocalCommit {
			index: local_index,
			spec: commitment.local_commit.spec.clone(),
			commit_tx: HolderCommitmentTransaction::new(
				commit_tx,
				msg.signature,
				msg.htlc_signatures.clone(),
				&params.holder.pubkeys.funding_pubkey,
				&params.counterparty.pubkeys.funding_pubkey,
			),
		};
		// Quiescence holds for the whole splice exchange, so the remote commitment cannot have
		// advanced since the snapshot was taken; if it somehow did, overwriting it would
		// silently roll back settled HTLCs, which is never acceptable.
		if commitment.remote_commit.index != pending_remote.index {
			return Err(ChannelError::Close(
				"Commitment advanced during the splice signature exchange".to_owned(),
			));
		}
		commitment.remote_commit = pending_remote;
		self.needs_persist = true;
		Ok(())
	}

	/// Initiates an RBF of the latest unconfirmed splice attempt at a higher feerate. Like the
	/// splice itself, an RBF re-runs the construction and commitment-signature exchange and so
	/// requires a quiescent channel.
	pub fn initiate_rbf(
		&mut self, feerate_sat_per_kw: u32, locktime: u32,
	) -> Result<msgs::TxInitRbf, ChannelError> {
		let channel_id = self.channel_id();
		let (quiescence, splice) = self.normal_state_mut()?;
		match quiescence {
			QuiescenceState::Quiescent { .. } => {},
			_ => {
				return Err(ChannelError::Ignore(
					"An RBF requires a quiescent channel".to_owned(),
				))
			},
		}
		let previous = match splice {
			SpliceStatus::WaitingForSigs { pending, .. } => pending.clone(),
			_ => {
				return Err(ChannelError::Ignore(
					"No replaceable splice attempt in flight".to_owned(),
				))
			},
		};
		validate_rbf_attempt(
			previous.funding_feerate_per_kw,
			feerate_sat_per_kw,
			&FundingStatus::DualFundedUnconfirmed {
				liquidity_fee_msat: previous.liquidity_fee_msat,
			},
			previous.request_funding.as_ref(),
		)
		.map_err(|reason| ChannelError::Ignore(reason.to_string()))?;
		let pending = PendingSplice {
			we_initiated: true,
			funding_feerate_per_kw: feerate_sat_per_kw,
			locktime,
			..previous
		};
		let contribution = pending.our_contribution_satoshis;
		*splice = SpliceStatus::Requested(pending);
		Ok(msgs::TxInitRbf {
			channel_id,
			locktime,
			feerate_sat_per_1000_weight: feerate_sat_per_kw,
			funding_output_contribution: Some(contribution),
		})
	}

	/// Handles the peer's `tx_ack_rbf`, starting the initiator-side RBF construction session.
	pub fn handle_tx_ack_rbf<ES: EntropySource>(
		&mut self, msg: &msgs::TxAckRbf, entropy_source: &ES,
		our_inputs: Vec<crate::ln::interactivetxs::FundingTxInput>,
		our_outputs: Vec<bitcoin::TxOut>,
	) -> Result<InteractiveTxMessageSend, ChannelError> {
		let (_, splice) = self.normal_state_mut()?;
		let mut pending = match core::mem::replace(splice, SpliceStatus::None) {
			SpliceStatus::Requested(pending) => pending,
			other => {
				*splice = other;
				return Err(ChannelError::Warn("tx_ack_rbf without a pending RBF".to_owned()));
			},
		};
		if let Some(contribution) = msg.funding_output_contribution {
			pending.their_contribution_satoshis = contribution;
		}
		let params = self.splice_negotiation_params(&pending, true)?;
		let (constructor, first) =
			InteractiveTxConstructor::new(params, entropy_source, our_inputs, our_outputs)
				.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
		let first = first.expect("the initiator always has the shared contributions to send");
		let (_, splice) = self.normal_state_mut()?;
		*splice = SpliceStatus::InProgress { pending, constructor };
		Ok(first)
	}

	/// Records our wallet's witnesses for the splice transaction and returns our
	/// `tx_signatures` if it is our turn to send first (or the peer's already arrived).
	pub fn provide_splice_witnesses(
		&mut self, witnesses: Vec<bitcoin::Witness>,
		shared_input_signature: Option<bitcoin::secp256k1::ecdsa::Signature>,
	) -> Result<Option<msgs::TxSignatures>, ChannelError> {
		let channel_id = self.channel_id();
		let (quiescence, splice) = self.normal_state_mut()?;
		match splice {
			SpliceStatus::WaitingForSigs { session, .. } => {
				session.provide_holder_witnesses(channel_id, witnesses, shared_input_signature);
				if session.has_all_signatures() {
					// The splice has resolved; update traffic may resume.
					*quiescence = QuiescenceState::Live;
				}
				if session.holder_sends_tx_signatures_first
					|| session.counterparty_tx_signatures.is_some()
				{
					Ok(session.holder_tx_signatures.clone())
				} else {
					Ok(None)
				}
			},
			_ => Err(ChannelError::Ignore("No splice awaiting signatures".to_owned())),
		}
	}

	/// Handles the peer's `tx_signatures`, returning ours (if not yet sent) and the fully
	/// signed splice transaction once both sets are present.
	pub fn handle_tx_signatures(
		&mut self, msg: &msgs::TxSignatures,
	) -> Result<(Option<msgs::TxSignatures>, Option<Transaction>), ChannelError> {
		let (quiescence, splice) = self.normal_state_mut()?;
		match splice {
			SpliceStatus::WaitingForSigs { session, .. } => {
				if !session.received_tx_signatures(msg.clone()) {
					return Err(ChannelError::Warn(
						"tx_signatures for an unknown transaction".to_owned(),
					));
				}
				let ours = if session.holder_sends_tx_signatures_first {
					// We already sent ours.
					None
				} else {
					session.holder_tx_signatures.clone()
				};
				if session.has_all_signatures() {
					// The splice has resolved; update traffic may resume.
					*quiescence = QuiescenceState::Live;
				}
				let finalized = session.finalize_transaction();
				Ok((ours, finalized))
			},
			_ => Err(ChannelError::Warn("tx_signatures without a pending splice".to_owned())),
		}
	}

	/// Handles an incoming `tx_init_rbf` for the latest unconfirmed splice attempt, creating a
	/// fresh construction session at the same funding index with a higher feerate.
	pub fn handle_tx_init_rbf<ES: EntropySource>(
		&mut self, msg: &msgs::TxInitRbf, entropy_source: &ES,
		our_inputs: Vec<crate::ln::interactivetxs::FundingTxInput>,
		our_outputs: Vec<bitcoin::TxOut>,
	) -> Result<msgs::TxAckRbf, ChannelError> {
		let channel_id = self.channel_id();
		let (previous_pending, previous_status, previous_feerate) = {
			let (quiescence, splice) = self.normal_state_mut()?;
			match quiescence {
				QuiescenceState::Quiescent { .. } => {},
				_ => {
					return Err(ChannelError::Warn(
						"tx_init_rbf on a channel that is not quiescent".to_owned(),
					))
				},
			}
			match splice {
				SpliceStatus::WaitingForSigs { pending, .. } => {
					let latest = pending.clone();
					(latest.clone(), FundingStatus::DualFundedUnconfirmed {
						liquidity_fee_msat: latest.liquidity_fee_msat,
					}, latest.funding_feerate_per_kw)
				},
				_ => {
					return Err(ChannelError::Warn(
						"tx_init_rbf without a replaceable splice attempt".to_owned(),
					))
				},
			}
		};
		if let Err(reason) = validate_rbf_attempt(
			previous_feerate,
			msg.feerate_sat_per_1000_weight,
			&previous_status,
			previous_pending.request_funding.as_ref(),
		) {
			return Err(ChannelError::Warn(reason.to_string()));
		}

		let pending = PendingSplice {
			we_initiated: false,
			our_contribution_satoshis: previous_pending.our_contribution_satoshis,
			their_contribution_satoshis: msg
				.funding_output_contribution
				.unwrap_or(previous_pending.their_contribution_satoshis),
			funding_feerate_per_kw: msg.feerate_sat_per_1000_weight,
			locktime: msg.locktime,
			funding_tx_index: previous_pending.funding_tx_index,
			liquidity_fee_msat: previous_pending.liquidity_fee_msat,
			request_funding: previous_pending.request_funding.clone(),
		};
		let our_contribution = pending.our_contribution_satoshis;
		let params = self.splice_negotiation_params(&pending, false)?;
		let (constructor, _) =
			InteractiveTxConstructor::new(params, entropy_source, our_inputs, our_outputs)
				.map_err(|reason| ChannelError::Warn(reason.to_string()))?;
		let (_, splice) = self.normal_state_mut()?;
		*splice = SpliceStatus::InProgress { pending, constructor };
		Ok(msgs::TxAckRbf {
			channel_id,
			funding_output_contribution: Some(our_contribution),
		})
	}

	/// Handles `splice_locked`: once both sides have locked the same funding, older commitments
	/// become inactive.
	pub fn handle_splice_locked(
		&mut self, msg: &msgs::SpliceLocked,
	) -> Result<Option<msgs::SpliceLocked>, ChannelError> {
		let our_locked = self.sent_splice_locked.clone();
		self.commitments.lock_funding(msg.splice_txid)?;
		self.needs_persist = true;
		match our_locked {
			Some(ours) if ours.splice_txid == msg.splice_txid => {
				self.sent_splice_locked = None;
				let (_, splice) = self.normal_state_mut()?;
				*splice = SpliceStatus::None;
				Ok(None)
			},
			_ => {
				let ours = msgs::SpliceLocked {
					channel_id: self.channel_id(),
					splice_txid: msg.splice_txid,
				};
				self.sent_splice_locked = Some(ours.clone());
				// The peer locked first; matching it resolves the splice on our side too.
				let (_, splice) = self.normal_state_mut()?;
				*splice = SpliceStatus::None;
				Ok(Some(ours))
			},
		}
	}

	/// Chain event: a funding transaction (original or splice) reached the required depth.
	pub fn funding_tx_confirmed(
		&mut self, txid: Txid,
	) -> Result<Option<msgs::SpliceLocked>, ChannelError> {
		self.commitments.funding_confirmed(txid)?;
		self.needs_persist = true;
		if self.commitments.active[0].funding_tx_index > 0 {
			let locked = msgs::SpliceLocked { channel_id: self.channel_id(), splice_txid: txid };
			self.sent_splice_locked = Some(locked.clone());
			Ok(Some(locked))
		} else {
			Ok(None)
		}
	}

	/// Chain event: the initial funding transaction reached the required depth. Produces our
	/// `channel_ready`.
	pub fn initial_funding_confirmed(&mut self) -> Result<msgs::ChannelReady, ChannelError> {
		match self.state {
			ChannelState::AwaitingFundingConfirmation { .. } => {},
			_ => {
				return Err(ChannelError::Ignore(
					"Not awaiting the initial funding confirmation".to_owned(),
				))
			},
		}
		self.commitments.active[0].funding_status = FundingStatus::Confirmed;
		self.state = if self.commitments.remote_next_per_commitment_point.is_some() {
			// The peer's channel_ready already arrived.
			ChannelState::Normal {
				quiescence: QuiescenceState::Live,
				splice: SpliceStatus::None,
			}
		} else {
			ChannelState::AwaitingChannelReady
		};
		self.needs_persist = true;
		let next_point = self.signer.get_per_commitment_point(
			crate::ln::commitments::INITIAL_COMMITMENT_NUMBER - 1,
			&self.secp_ctx,
		);
		Ok(msgs::ChannelReady {
			channel_id: self.channel_id(),
			next_per_commitment_point: next_point,
		})
	}

	/// Handles the peer's `channel_ready`, which carries the per-commitment point for their
	/// second commitment.
	pub fn handle_channel_ready(&mut self, msg: &msgs::ChannelReady) -> Result<(), ChannelError> {
		match self.state {
			ChannelState::AwaitingFundingConfirmation { .. } => {
				// Zero-conf peers may declare readiness before we see a confirmation.
				self.commitments.remote_next_per_commitment_point =
					Some(msg.next_per_commitment_point);
			},
			ChannelState::AwaitingChannelReady => {
				self.commitments.remote_next_per_commitment_point =
					Some(msg.next_per_commitment_point);
				self.state = ChannelState::Normal {
					quiescence: QuiescenceState::Live,
					splice: SpliceStatus::None,
				};
			},
			_ => return Err(ChannelError::Warn("Unexpected channel_ready".to_owned())),
		}
		self.needs_persist = true;
		Ok(())
	}

	// ===== Shutdown and mutual close ========================================================

	/// Starts a cooperative close.
	pub fn begin_shutdown(&mut self, script: ScriptBuf) -> Result<msgs::Shutdown, ChannelError> {
		match self.state {
			ChannelState::Normal { ref splice, .. } if !splice.is_active() => {},
			_ => {
				return Err(ChannelError::Ignore(
					"Cannot begin shutdown in the current state".to_owned(),
				))
			},
		}
		self.state = ChannelState::Shutdown {
			local_script: script.clone(),
			remote_script: ScriptBuf::new(),
		};
		self.needs_persist = true;
		Ok(msgs::Shutdown { channel_id: self.channel_id(), scriptpubkey: script })
	}

	/// Handles an incoming `shutdown`, replying with ours if we had not sent one.
	pub fn handle_shutdown(
		&mut self, msg: &msgs::Shutdown, our_script: ScriptBuf,
	) -> Result<Option<msgs::Shutdown>, ChannelError> {
		match &mut self.state {
			ChannelState::Normal { splice, .. } => {
				if splice.is_active() {
					return Err(ChannelError::Warn("shutdown during a splice".to_owned()));
				}
				self.state = ChannelState::Shutdown {
					local_script: our_script.clone(),
					remote_script: msg.scriptpubkey.clone(),
				};
				self.needs_persist = true;
				Ok(Some(msgs::Shutdown {
					channel_id: self.commitments.params.channel_id,
					scriptpubkey: our_script,
				}))
			},
			ChannelState::Shutdown { remote_script, .. } => {
				*remote_script = msg.scriptpubkey.clone();
				self.needs_persist = true;
				Ok(None)
			},
			_ => Err(ChannelError::Warn("shutdown in an unexpected state".to_owned())),
		}
	}

	/// Once all HTLCs are settled, proposes a closing fee (moving to `Negotiating`).
	pub fn propose_closing_signed(
		&mut self, fee_satoshis: u64,
	) -> Result<msgs::ClosingSigned, ChannelError> {
		let (local_script, remote_script) = match &self.state {
			ChannelState::Shutdown { local_script, remote_script }
			| ChannelState::Negotiating { local_script, remote_script, .. } => {
				(local_script.clone(), remote_script.clone())
			},
			_ => return Err(ChannelError::Ignore("Not shutting down".to_owned())),
		};
		if !self.commitments.latest_local_spec().htlcs.is_empty() {
			return Err(ChannelError::Ignore("HTLCs still pending".to_owned()));
		}
		let closing_tx = self.build_closing_tx(fee_satoshis, &local_script, &remote_script)?;
		let tx_params =
			self.commitments.active[0].transaction_parameters(&self.commitments.params);
		let signature = self.signer.sign_closing_transaction(&closing_tx, &tx_params, &self.secp_ctx);
		let negotiation = match &mut self.state {
			ChannelState::Negotiating { negotiation, .. } => negotiation,
			state => {
				*state = ChannelState::Negotiating {
					local_script,
					remote_script,
					negotiation: ClosingNegotiation::default(),
				};
				match state {
					ChannelState::Negotiating { negotiation, .. } => negotiation,
					_ => unreachable!(),
				}
			},
		};
		negotiation.last_sent_fee_satoshis = Some(fee_satoshis);
		Ok(msgs::ClosingSigned {
			channel_id: self.commitments.params.channel_id,
			fee_satoshis,
			signature,
			fee_range: None,
		})
	}

	/// Handles an incoming `closing_signed`. Each round must move strictly between the last two
	/// proposals; on convergence the fully-signed closing transaction is returned.
	///
	/// `our_preferred_fee_satoshis` seeds the negotiation when we have not proposed yet.
	pub fn handle_closing_signed(
		&mut self, msg: &msgs::ClosingSigned, our_preferred_fee_satoshis: u64,
	) -> Result<(Option<msgs::ClosingSigned>, Option<Transaction>), ChannelError> {
		let (local_script, remote_script, mut negotiation) = match &self.state {
			ChannelState::Negotiating { local_script, remote_script, negotiation } => {
				(local_script.clone(), remote_script.clone(), negotiation.clone())
			},
			ChannelState::Shutdown { local_script, remote_script } => (
				local_script.clone(),
				remote_script.clone(),
				ClosingNegotiation::default(),
			),
			_ => return Err(ChannelError::Warn("closing_signed in an unexpected state".to_owned())),
		};

		// Fee negotiation must converge: a proposal must land strictly between the last two.
		if let (Some(last_sent), Some(last_received)) =
			(negotiation.last_sent_fee_satoshis, negotiation.last_received_fee_satoshis)
		{
			let (lo, hi) = if last_sent < last_received {
				(last_sent, last_received)
			} else {
				(last_received, last_sent)
			};
			if msg.fee_satoshis <= lo || msg.fee_satoshis >= hi {
				return Err(ChannelError::Warn(format!(
					"closing fee {} does not move between the last proposals ({}, {})",
					msg.fee_satoshis, lo, hi
				)));
			}
		}
		negotiation.last_received_fee_satoshis = Some(msg.fee_satoshis);

		let closing_tx = self.build_closing_tx(msg.fee_satoshis, &local_script, &remote_script)?;
		let tx_params =
			self.commitments.active[0].transaction_parameters(&self.commitments.params);
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		let sighash =
			closing_tx.get_sighash_all(&funding_redeemscript, tx_params.channel_value_satoshis);
		if self
			.secp_ctx
			.verify_ecdsa(
				&sighash,
				&msg.signature,
				&self.commitments.params.counterparty.pubkeys.funding_pubkey,
			)
			.is_err()
		{
			return Err(ChannelError::Close("Invalid closing transaction signature".to_owned()));
		}

		if negotiation.last_sent_fee_satoshis == Some(msg.fee_satoshis) {
			return self.accept_closing_fee(msg, &local_script, &remote_script);
		}

		// Not converged: counter with the midpoint, which always lands strictly between (and
		// halves the gap, so the negotiation terminates).
		let our_last =
			negotiation.last_sent_fee_satoshis.unwrap_or(our_preferred_fee_satoshis);
		let counter_fee = (our_last + msg.fee_satoshis) / 2;
		if counter_fee == msg.fee_satoshis {
			// The gap has closed; accept the peer's fee outright.
			return self.accept_closing_fee(msg, &local_script, &remote_script);
		}
		negotiation.last_sent_fee_satoshis = Some(counter_fee);
		self.state = ChannelState::Negotiating {
			local_script: local_script.clone(),
			remote_script: remote_script.clone(),
			negotiation,
		};
		let counter_tx = self.build_closing_tx(counter_fee, &local_script, &remote_script)?;
		let signature =
			self.signer.sign_closing_transaction(&counter_tx, &tx_params, &self.secp_ctx);
		Ok((
			Some(msgs::ClosingSigned {
				channel_id: self.commitments.params.channel_id,
				fee_satoshis: counter_fee,
				signature,
				fee_range: None,
			}),
			None,
		))
	}

	/// Countersigns the peer's closing proposal and assembles the broadcastable transaction.
	/// The peer's signature has already been verified against this fee.
	fn accept_closing_fee(
		&mut self, msg: &msgs::ClosingSigned, local_script: &ScriptBuf,
		remote_script: &ScriptBuf,
	) -> Result<(Option<msgs::ClosingSigned>, Option<Transaction>), ChannelError> {
		let closing_tx = self.build_closing_tx(msg.fee_satoshis, local_script, remote_script)?;
		let tx_params =
			self.commitments.active[0].transaction_parameters(&self.commitments.params);
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		let our_sig =
			self.signer.sign_closing_transaction(&closing_tx, &tx_params, &self.secp_ctx);
		let holder_key = &self.commitments.params.holder.pubkeys.funding_pubkey;
		let counterparty_key = &self.commitments.params.counterparty.pubkeys.funding_pubkey;
		let mut tx = closing_tx.built_transaction().clone();
		let mut witness = bitcoin::Witness::new();
		witness.push(Vec::new());
		let mut our_sig_bytes = our_sig.serialize_der().to_vec();
		our_sig_bytes.push(bitcoin::sighash::EcdsaSighashType::All as u8);
		let mut their_sig_bytes = msg.signature.serialize_der().to_vec();
		their_sig_bytes.push(bitcoin::sighash::EcdsaSighashType::All as u8);
		if holder_key.serialize()[..] < counterparty_key.serialize()[..] {
			witness.push(our_sig_bytes);
			witness.push(their_sig_bytes);
		} else {
			witness.push(their_sig_bytes);
			witness.push(our_sig_bytes);
		}
		witness.push(funding_redeemscript.as_bytes());
		tx.input[0].witness = witness;
		self.state = ChannelState::Closing { closing_txid: tx.compute_txid() };
		self.needs_persist = true;
		log_info!(
			self.logger,
			"Mutual close agreed on channel {} with fee {} sat",
			self.channel_id(),
			msg.fee_satoshis
		);
		Ok((None, Some(tx)))
	}

	fn build_closing_tx(
		&self, fee_satoshis: u64, local_script: &ScriptBuf, remote_script: &ScriptBuf,
	) -> Result<ClosingTransaction, ChannelError> {
		let spec = self.commitments.latest_local_spec();
		let mut to_local_sat = spec.to_local_msat / 1000;
		let mut to_remote_sat = spec.to_remote_msat / 1000;
		// The opener pays the closing fee.
		if self.commitments.params.is_outbound_from_holder {
			to_local_sat = to_local_sat.saturating_sub(fee_satoshis);
		} else {
			to_remote_sat = to_remote_sat.saturating_sub(fee_satoshis);
		}
		Ok(ClosingTransaction::new(
			to_local_sat,
			to_remote_sat,
			local_script.clone(),
			remote_script.clone(),
			self.commitments.active[0].funding_outpoint.into_bitcoin_outpoint(),
			self.commitments.params.holder.dust_limit_satoshis,
		))
	}

	// ===== Force close =====================================================================

	/// Force-closes: signs and returns our latest commitment transaction for broadcast. Not
	/// cancellable.
	pub fn force_close(&mut self) -> Transaction {
		let commitment = &self.commitments.active[0];
		let tx_params = commitment.transaction_parameters(&self.commitments.params);
		let holder_commitment = &commitment.local_commit.commit_tx;
		let our_sig =
			self.signer.sign_holder_commitment(holder_commitment, &tx_params, &self.secp_ctx);
		let tx = holder_commitment.add_holder_sig(&tx_params.make_funding_redeemscript(), our_sig);
		self.state = ChannelState::ForceClosing;
		self.needs_persist = true;
		log_info!(self.logger, "Force-closing channel {}", self.channel_id());
		tx
	}

	// ===== Reconnection ====================================================================

	/// Signals loss of the transport. Any interactive session which has not reached the
	/// signature-exchange stage is cancelled (and quiescence with it); one already waiting for
	/// signatures survives, along with its quiescence, and resumes deterministically.
	pub fn peer_disconnected(&mut self) {
		self.connected = false;
		if let ChannelState::Normal { quiescence, splice } = &mut self.state {
			match splice {
				SpliceStatus::Requested(_) | SpliceStatus::InProgress { .. } => {
					*splice = SpliceStatus::None;
					*quiescence = QuiescenceState::Live;
					self.pending_splice_remote_commit = None;
				},
				SpliceStatus::WaitingForSigs { session, .. } => {
					if session.has_all_signatures() {
						*quiescence = QuiescenceState::Live;
					}
				},
				SpliceStatus::None => {
					// Quiescence does not outlive the connection which negotiated it.
					*quiescence = QuiescenceState::Live;
				},
			}
		}
		let state = core::mem::replace(&mut self.state, ChannelState::Closed);
		self.state = match state {
			ChannelState::Offline { resume } => ChannelState::Offline { resume },
			other => ChannelState::Offline { resume: Box::new(other) },
		};
	}

	/// Our `channel_reestablish` for a fresh connection.
	pub fn get_channel_reestablish(&self) -> msgs::ChannelReestablish {
		let local_index = self.commitments.local_commit_index();
		let remote_index = self.commitments.remote_commit_index();
		let last_secret = if local_index == 0 {
			[0; 32]
		} else {
			self.signer.release_commitment_secret(
				crate::ln::commitments::INITIAL_COMMITMENT_NUMBER - (local_index - 1),
			)
		};
		let next_funding_txid = match &self.state {
			ChannelState::Offline { resume } => match resume.as_ref() {
				ChannelState::Normal { splice, .. } => splice.pending_funding_txid(),
				_ => None,
			},
			ChannelState::Normal { splice, .. } => splice.pending_funding_txid(),
			_ => None,
		};
		msgs::ChannelReestablish {
			channel_id: self.commitments.params.channel_id,
			next_local_commitment_number: local_index + 1,
			next_remote_commitment_number: remote_index,
			your_last_per_commitment_secret: last_secret,
			my_current_per_commitment_point: self.signer.get_per_commitment_point(
				crate::ln::commitments::INITIAL_COMMITMENT_NUMBER - local_index,
				&self.secp_ctx,
			),
			next_funding_txid,
		}
	}

	/// Handles the peer's `channel_reestablish`, producing everything which must be
	/// retransmitted. No new HTLC may be sent until these are drained to the transport.
	pub fn handle_channel_reestablish(
		&mut self, msg: &msgs::ChannelReestablish,
	) -> Result<Retransmissions, ChannelError> {
		let state = core::mem::replace(&mut self.state, ChannelState::Closed);
		self.state = match state {
			ChannelState::Offline { resume } => *resume,
			other => other,
		};
		let mut ret = Retransmissions::default();

		// Did our last commitment_signed reach them? They tell us the next commitment number
		// they expect; if it equals the one we already signed, the signature was lost.
		if self.commitments.awaiting_remote_revocation() {
			let signed_index = self.commitments.active[0]
				.next_remote_commit
				.as_ref()
				.expect("awaiting_remote_revocation")
				.index;
			if msg.next_local_commitment_number == signed_index {
				ret.commitment_signed = self.sent_commitment_signed.clone();
			} else if msg.next_local_commitment_number != signed_index + 1 {
				return Err(ChannelError::Close(
					"Peer's reestablish disagrees with our signed commitment index".to_owned(),
				));
			}
		}

		// Did our last revoke_and_ack reach them? They tell us the next revocation they expect.
		let local_index = self.commitments.local_commit_index();
		if msg.next_remote_commitment_number + 1 == local_index {
			ret.revoke_and_ack = self.sent_revoke_and_ack.clone();
		} else if msg.next_remote_commitment_number != local_index {
			return Err(ChannelError::Close(
				"Peer's reestablish disagrees with our revocation state".to_owned(),
			));
		}

		// Splice resumption per the retransmission table.
		let our_session_txid = match &self.state {
			ChannelState::Normal { splice, .. } => splice.pending_funding_txid(),
			_ => None,
		};
		if let Some(peer_txid) = msg.next_funding_txid {
			if our_session_txid == Some(peer_txid) {
				if let ChannelState::Normal { splice, .. } = &self.state {
					if let SpliceStatus::WaitingForSigs { session, .. } = splice {
						// We only re-send signatures we already released.
						ret.tx_signatures = session.holder_tx_signatures.clone();
					}
				}
				ret.splice_locked = self.sent_splice_locked.clone();
			} else {
				// They think a splice is in progress that we do not know: abort it.
				ret.tx_abort = Some(msgs::TxAbort {
					channel_id: self.commitments.params.channel_id,
					data: b"unknown funding transaction".to_vec(),
				});
			}
		} else if self.sent_splice_locked.is_some() {
			// They have not acknowledged our splice_locked.
			ret.splice_locked = self.sent_splice_locked.clone();
		}

		self.connected = true;
		self.needs_persist = true;
		Ok(ret)
	}
}

/// Drives the v1 opening handshake (`open_channel` through `funding_signed`), after which a
/// [`Channel`] exists awaiting funding confirmation.
pub struct PendingChannel {
	signer: InMemorySigner,
	secp_ctx: Secp256k1<All>,
	is_opener: bool,
	our_party: crate::ln::commitments::PartyParams,
	their_party: Option<crate::ln::commitments::PartyParams>,
	their_first_point: Option<PublicKey>,
	funding_satoshis: u64,
	push_msat: u64,
	feerate_per_kw: u32,
	temporary_channel_id: ChannelId,
	minimum_depth: u32,
	funding_outpoint: Option<OutPoint>,
}

impl PendingChannel {
	/// Starts an outbound open, producing the `open_channel` message.
	pub fn new_outbound(
		signer: InMemorySigner, our_party: crate::ln::commitments::PartyParams,
		funding_satoshis: u64, push_msat: u64, feerate_per_kw: u32, chain_hash: bitcoin::BlockHash,
		temporary_id_entropy: [u8; 32],
	) -> (Self, msgs::OpenChannel) {
		let secp_ctx = Secp256k1::new();
		let temporary_channel_id = ChannelId::temporary_from_entropy(temporary_id_entropy);
		let first_per_commitment_point = signer.get_per_commitment_point(
			crate::ln::commitments::INITIAL_COMMITMENT_NUMBER,
			&secp_ctx,
		);
		let msg = msgs::OpenChannel {
			chain_hash,
			temporary_channel_id,
			funding_satoshis,
			push_msat,
			dust_limit_satoshis: our_party.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: our_party.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: our_party.channel_reserve_satoshis,
			htlc_minimum_msat: our_party.htlc_minimum_msat,
			feerate_per_kw,
			to_self_delay: our_party.to_self_delay,
			max_accepted_htlcs: our_party.max_accepted_htlcs,
			funding_pubkey: our_party.pubkeys.funding_pubkey,
			revocation_basepoint: our_party.pubkeys.revocation_basepoint.to_public_key(),
			payment_basepoint: our_party.pubkeys.payment_basepoint.to_public_key(),
			delayed_payment_basepoint: our_party.pubkeys.delayed_payment_basepoint.to_public_key(),
			htlc_basepoint: our_party.pubkeys.htlc_basepoint.to_public_key(),
			first_per_commitment_point,
			channel_flags: 0,
		};
		let pending = PendingChannel {
			signer,
			secp_ctx,
			is_opener: true,
			our_party,
			their_party: None,
			their_first_point: None,
			funding_satoshis,
			push_msat,
			feerate_per_kw,
			temporary_channel_id,
			minimum_depth: 0,
			funding_outpoint: None,
		};
		(pending, msg)
	}

	/// Accepts an inbound `open_channel`, producing the `accept_channel` message.
	pub fn new_inbound(
		msg: &msgs::OpenChannel, signer: InMemorySigner,
		our_party: crate::ln::commitments::PartyParams, minimum_depth: u32,
	) -> Result<(Self, msgs::AcceptChannel), ChannelError> {
		if msg.push_msat > msg.funding_satoshis * 1000 {
			return Err(ChannelError::Close("Peer pushed more than the channel value".to_owned()));
		}
		if msg.dust_limit_satoshis > msg.channel_reserve_satoshis {
			return Err(ChannelError::Close(
				"Peer's dust limit exceeds their channel reserve".to_owned(),
			));
		}
		let secp_ctx = Secp256k1::new();
		let first_per_commitment_point = signer.get_per_commitment_point(
			crate::ln::commitments::INITIAL_COMMITMENT_NUMBER,
			&secp_ctx,
		);
		let accept = msgs::AcceptChannel {
			temporary_channel_id: msg.temporary_channel_id,
			dust_limit_satoshis: our_party.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: our_party.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: our_party.channel_reserve_satoshis,
			htlc_minimum_msat: our_party.htlc_minimum_msat,
			minimum_depth,
			to_self_delay: our_party.to_self_delay,
			max_accepted_htlcs: our_party.max_accepted_htlcs,
			funding_pubkey: our_party.pubkeys.funding_pubkey,
			revocation_basepoint: our_party.pubkeys.revocation_basepoint.to_public_key(),
			payment_basepoint: our_party.pubkeys.payment_basepoint.to_public_key(),
			delayed_payment_basepoint: our_party.pubkeys.delayed_payment_basepoint.to_public_key(),
			htlc_basepoint: our_party.pubkeys.htlc_basepoint.to_public_key(),
			first_per_commitment_point,
		};
		let pending = PendingChannel {
			signer,
			secp_ctx,
			is_opener: false,
			our_party,
			their_party: Some(party_params_from_open(msg)),
			their_first_point: Some(msg.first_per_commitment_point),
			funding_satoshis: msg.funding_satoshis,
			push_msat: msg.push_msat,
			feerate_per_kw: msg.feerate_per_kw,
			temporary_channel_id: msg.temporary_channel_id,
			minimum_depth,
			funding_outpoint: None,
		};
		Ok((pending, accept))
	}

	/// Handles the peer's `accept_channel`.
	pub fn handle_accept_channel(&mut self, msg: &msgs::AcceptChannel) -> Result<(), ChannelError> {
		if !self.is_opener || self.their_party.is_some() {
			return Err(ChannelError::Close("Unexpected accept_channel".to_owned()));
		}
		self.their_party = Some(party_params_from_accept(msg));
		self.their_first_point = Some(msg.first_per_commitment_point);
		self.minimum_depth = msg.minimum_depth;
		Ok(())
	}

	fn channel_params(&self, funding_outpoint: OutPoint) -> ChannelParamsPair {
		let their_party = self.their_party.clone().expect("handshake order enforced by callers");
		let params = crate::ln::commitments::ChannelParams {
			channel_id: ChannelId::v1_from_funding_outpoint(funding_outpoint),
			holder: self.our_party.clone(),
			counterparty: their_party,
			is_outbound_from_holder: self.is_opener,
			commitment_format: crate::ln::chan_utils::CommitmentFormat::DefaultSegwit,
		};
		let (to_local_msat, to_remote_msat) = if self.is_opener {
			(self.funding_satoshis * 1000 - self.push_msat, self.push_msat)
		} else {
			(self.push_msat, self.funding_satoshis * 1000 - self.push_msat)
		};
		ChannelParamsPair { params, to_local_msat, to_remote_msat }
	}

	/// The wallet has produced the funding output: sign the acceptor's first commitment.
	pub fn funding_created(
		&mut self, funding_outpoint: OutPoint,
	) -> Result<msgs::FundingCreated, ChannelError> {
		if !self.is_opener || self.their_party.is_none() {
			return Err(ChannelError::Ignore("Handshake not ready for funding".to_owned()));
		}
		self.funding_outpoint = Some(funding_outpoint);
		let pair = self.channel_params(funding_outpoint);
		let (remote_commit_tx, _) = self.build_first_commitment(&pair, false);
		let tx_params = self.tx_params(&pair, funding_outpoint);
		let (signature, _) =
			self.signer.sign_counterparty_commitment(&remote_commit_tx, &tx_params, &self.secp_ctx);
		Ok(msgs::FundingCreated {
			temporary_channel_id: self.temporary_channel_id,
			funding_txid: funding_outpoint.txid,
			funding_output_index: funding_outpoint.index,
			signature,
		})
	}

	fn tx_params(
		&self, pair: &ChannelParamsPair, funding_outpoint: OutPoint,
	) -> crate::ln::chan_utils::ChannelTransactionParameters {
		crate::ln::chan_utils::ChannelTransactionParameters {
			holder_pubkeys: pair.params.holder.pubkeys.clone(),
			holder_selected_contest_delay: pair.params.holder.to_self_delay,
			holder_dust_limit_satoshis: pair.params.holder.dust_limit_satoshis,
			counterparty_pubkeys: pair.params.counterparty.pubkeys.clone(),
			counterparty_selected_contest_delay: pair.params.counterparty.to_self_delay,
			counterparty_dust_limit_satoshis: pair.params.counterparty.dust_limit_satoshis,
			is_outbound_from_holder: pair.params.is_outbound_from_holder,
			funding_outpoint,
			channel_value_satoshis: self.funding_satoshis,
			commitment_format: pair.params.commitment_format,
		}
	}

	fn build_first_commitment(
		&self, pair: &ChannelParamsPair, local: bool,
	) -> (crate::ln::chan_utils::CommitmentTransaction, crate::ln::commitments::CommitmentSpec) {
		let funding_outpoint = self.funding_outpoint.expect("set before building");
		let tx_params = self.tx_params(pair, funding_outpoint);
		let spec = crate::ln::commitments::CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: self.feerate_per_kw,
			to_local_msat: pair.to_local_msat,
			to_remote_msat: pair.to_remote_msat,
		};
		let point = if local {
			self.signer.get_per_commitment_point(
				crate::ln::commitments::INITIAL_COMMITMENT_NUMBER,
				&self.secp_ctx,
			)
		} else {
			self.their_first_point.expect("handshake order enforced by callers")
		};
		let (tx, _) =
			build_commitment_transaction(local, 0, &spec, &point, &tx_params, &self.secp_ctx);
		(tx, spec)
	}

	fn into_channel<L: Deref>(
		self, counterparty_sig: bitcoin::secp256k1::ecdsa::Signature, logger: L,
	) -> Result<Channel<L>, ChannelError>
	where
		L::Target: Logger,
	{
		let funding_outpoint = self.funding_outpoint.expect("set before conversion");
		let pair = self.channel_params(funding_outpoint);
		let (local_tx, spec) = self.build_first_commitment(&pair, true);
		let tx_params = self.tx_params(&pair, funding_outpoint);
		let funding_redeemscript = tx_params.make_funding_redeemscript();
		let sighash = local_tx
			.built_transaction()
			.get_sighash_all(&funding_redeemscript, self.funding_satoshis);
		if self
			.secp_ctx
			.verify_ecdsa(
				&sighash,
				&counterparty_sig,
				&pair.params.counterparty.pubkeys.funding_pubkey,
			)
			.is_err()
		{
			return Err(ChannelError::Close(
				"Invalid signature on the initial commitment".to_owned(),
			));
		}
		let (remote_tx, _) = self.build_first_commitment(&pair, false);

		let commitment = Commitment {
			funding_tx_index: 0,
			funding_outpoint,
			capacity_satoshis: self.funding_satoshis,
			funding_status: FundingStatus::SingleFundedUnconfirmed,
			local_commit: LocalCommit {
				index: 0,
				spec: spec.clone(),
				commit_tx: crate::ln::chan_utils::HolderCommitmentTransaction::new(
					local_tx,
					counterparty_sig,
					Vec::new(),
					&pair.params.holder.pubkeys.funding_pubkey,
					&pair.params.counterparty.pubkeys.funding_pubkey,
				),
			},
			remote_commit: RemoteCommit {
				index: 0,
				spec,
				txid: remote_tx.txid(),
				remote_per_commitment_point: self.their_first_point.expect("handshake order"),
			},
			next_remote_commit: None,
		};
		let commitments = CommitmentSet {
			params: pair.params,
			active: vec![commitment],
			inactive: Vec::new(),
			local_changes: Default::default(),
			remote_changes: Default::default(),
			next_local_htlc_id: 0,
			next_remote_htlc_id: 0,
			remote_next_per_commitment_point: None,
			remote_per_commitment_secrets:
				crate::ln::chan_utils::CounterpartyCommitmentSecrets::new(),
		};
		let mut channel = Channel::from_commitments(commitments, self.signer, logger);
		channel.state =
			ChannelState::AwaitingFundingConfirmation { minimum_depth: self.minimum_depth };
		Ok(channel)
	}

	/// Handles the opener's `funding_created` (acceptor side), yielding the funded channel and
	/// our `funding_signed`.
	pub fn handle_funding_created<L: Deref>(
		mut self, msg: &msgs::FundingCreated, logger: L,
	) -> Result<(Channel<L>, msgs::FundingSigned), ChannelError>
	where
		L::Target: Logger,
	{
		if self.is_opener {
			return Err(ChannelError::Close("Unexpected funding_created".to_owned()));
		}
		let funding_outpoint =
			OutPoint { txid: msg.funding_txid, index: msg.funding_output_index };
		self.funding_outpoint = Some(funding_outpoint);
		let pair = self.channel_params(funding_outpoint);
		let (remote_tx, _) = self.build_first_commitment(&pair, false);
		let tx_params = self.tx_params(&pair, funding_outpoint);
		let (signature, _) =
			self.signer.sign_counterparty_commitment(&remote_tx, &tx_params, &self.secp_ctx);
		let channel_id = ChannelId::v1_from_funding_outpoint(funding_outpoint);
		let channel = self.into_channel(msg.signature, logger)?;
		Ok((channel, msgs::FundingSigned { channel_id, signature }))
	}

	/// Handles the acceptor's `funding_signed` (opener side), yielding the funded channel.
	pub fn handle_funding_signed<L: Deref>(
		self, msg: &msgs::FundingSigned, logger: L,
	) -> Result<Channel<L>, ChannelError>
	where
		L::Target: Logger,
	{
		if !self.is_opener {
			return Err(ChannelError::Close("Unexpected funding_signed".to_owned()));
		}
		self.into_channel(msg.signature, logger)
	}
}

struct ChannelParamsPair {
	params: crate::ln::commitments::ChannelParams,
	to_local_msat: u64,
	to_remote_msat: u64,
}

fn party_params_from_open(msg: &msgs::OpenChannel) -> crate::ln::commitments::PartyParams {
	crate::ln::commitments::PartyParams {
		dust_limit_satoshis: msg.dust_limit_satoshis,
		max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
		channel_reserve_satoshis: msg.channel_reserve_satoshis,
		htlc_minimum_msat: msg.htlc_minimum_msat,
		to_self_delay: msg.to_self_delay,
		max_accepted_htlcs: msg.max_accepted_htlcs,
		pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint.into(),
			payment_basepoint: msg.payment_basepoint.into(),
			delayed_payment_basepoint: msg.delayed_payment_basepoint.into(),
			htlc_basepoint: msg.htlc_basepoint.into(),
		},
	}
}

fn party_params_from_accept(msg: &msgs::AcceptChannel) -> crate::ln::commitments::PartyParams {
	crate::ln::commitments::PartyParams {
		dust_limit_satoshis: msg.dust_limit_satoshis,
		max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
		channel_reserve_satoshis: msg.channel_reserve_satoshis,
		htlc_minimum_msat: msg.htlc_minimum_msat,
		to_self_delay: msg.to_self_delay,
		max_accepted_htlcs: msg.max_accepted_htlcs,
		pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint.into(),
			payment_basepoint: msg.payment_basepoint.into(),
			delayed_payment_basepoint: msg.delayed_payment_basepoint.into(),
			htlc_basepoint: msg.htlc_basepoint.into(),
		},
	}
}

const SERIALIZATION_VERSION: u8 = 1;

impl<L: Deref> crate::util::ser::Writeable for Channel<L>
where
	L::Target: Logger,
{
	fn write<W: crate::util::ser::Writer>(&self, w: &mut W) -> Result<(), std::io::Error> {
		use crate::util::ser::Writeable;
		// One record per channel, led by a version byte. In-flight interactive sessions are
		// deliberately not persisted: their MuSig nonces must never touch stable storage, and a
		// session which has not reached the signature exchange is cancelled by a restart anyway.
		SERIALIZATION_VERSION.write(w)?;
		self.commitments.write(w)?;
		let state_byte: u8 = match &self.state {
			ChannelState::Opening { .. } => 0,
			ChannelState::AwaitingFundingConfirmation { .. } => 1,
			ChannelState::AwaitingChannelReady => 2,
			ChannelState::Normal { .. } => 3,
			ChannelState::Shutdown { .. } => 4,
			ChannelState::Negotiating { .. } => 5,
			ChannelState::Closing { .. } => 6,
			ChannelState::ForceClosing => 7,
			ChannelState::Closed => 8,
			ChannelState::Offline { .. } => 3, // resumes into reestablish on reload
		};
		state_byte.write(w)?;
		match &self.state {
			ChannelState::Shutdown { local_script, remote_script }
			| ChannelState::Negotiating { local_script, remote_script, .. } => {
				local_script.write(w)?;
				remote_script.write(w)?;
			},
			ChannelState::Closing { closing_txid } => {
				closing_txid.write(w)?;
			},
			_ => {},
		}
		self.sent_splice_locked.as_ref().map(|msg| msg.splice_txid).write(w)?;
		Ok(())
	}
}

impl<L: Deref> Channel<L>
where
	L::Target: Logger,
{
	/// Reads a channel back from its persistent record.
	pub fn read<R: std::io::Read>(
		r: &mut R, signer: InMemorySigner, logger: L,
	) -> Result<Self, msgs::DecodeError> {
		use crate::util::ser::Readable;
		let version: u8 = Readable::read(r)?;
		if version != SERIALIZATION_VERSION {
			return Err(msgs::DecodeError::UnknownVersion);
		}
		let commitments: CommitmentSet = Readable::read(r)?;
		let state_byte: u8 = Readable::read(r)?;
		let state = match state_byte {
			0 | 1 => ChannelState::AwaitingFundingConfirmation { minimum_depth: 0 },
			2 => ChannelState::AwaitingChannelReady,
			3 => ChannelState::Normal {
				quiescence: QuiescenceState::Live,
				splice: SpliceStatus::None,
			},
			4 => ChannelState::Shutdown {
				local_script: Readable::read(r)?,
				remote_script: Readable::read(r)?,
			},
			5 => ChannelState::Negotiating {
				local_script: Readable::read(r)?,
				remote_script: Readable::read(r)?,
				negotiation: ClosingNegotiation::default(),
			},
			6 => ChannelState::Closing { closing_txid: Readable::read(r)? },
			7 => ChannelState::ForceClosing,
			8 => ChannelState::Closed,
			_ => return Err(msgs::DecodeError::UnknownVersion),
		};
		let sent_splice_locked_txid: Option<Txid> = Readable::read(r)?;
		let channel_id = commitments.params.channel_id;
		let mut channel = Channel::from_commitments(commitments, signer, logger);
		channel.state = state;
		channel.connected = false;
		channel.sent_splice_locked = sent_splice_locked_txid
			.map(|splice_txid| msgs::SpliceLocked { channel_id, splice_txid });
		Ok(channel)
	}
}

/// The incoming interactive-construction messages a channel can route.
pub enum InteractiveTxMessageIn {
	/// A `tx_add_input`.
	TxAddInput(msgs::TxAddInput),
	/// A `tx_add_output`.
	TxAddOutput(msgs::TxAddOutput),
	/// A `tx_remove_input`.
	TxRemoveInput(msgs::TxRemoveInput),
	/// A `tx_remove_output`.
	TxRemoveOutput(msgs::TxRemoveOutput),
	/// A `tx_complete`.
	TxComplete(msgs::TxComplete),
	/// A `tx_abort`.
	TxAbort(msgs::TxAbort),
}

enum SpliceStep {
	Message(Option<InteractiveTxMessageSend>),
	Concluded(Option<InteractiveTxMessageSend>, ConstructedTransaction),
	Aborted(msgs::TxAbort),
}

/// The result of routing one interactive-tx message through the channel.
pub enum SpliceProgress {
	/// The negotiation continues; send this (if any).
	Continue(Option<InteractiveTxMessageSend>),
	/// The negotiation concluded: send the final message (if any) followed by the
	/// `commitment_signed` batch.
	Concluded {
		/// Our final interactive-tx message, usually a `tx_complete`.
		last_message: Option<InteractiveTxMessageSend>,
		/// One `commitment_signed` per active commitment.
		commit_sigs: Vec<msgs::CommitmentSigned>,
	},
	/// We aborted; send this `tx_abort`.
	Abort(msgs::TxAbort),
	/// The peer aborted; nothing to send.
	Aborted,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::msgs::OnionPacket;
	use crate::ln::types::{PaymentHash, PaymentPreimage};
	use crate::util::ser::Writeable;
	use crate::util::test_utils::{self, TestEntropySource, TestLogger};
	use bitcoin::secp256k1::{Secp256k1, SecretKey};
	use std::sync::Arc;

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

	fn channel_pair() -> (Channel<Arc<TestLogger>>, Channel<Arc<TestLogger>>) {
		let secp_ctx = Secp256k1::new();
		let (set_a, signer_a, set_b, signer_b) =
			test_utils::linked_commitment_sets(&secp_ctx, 1_500_000, 800_000_000, 700_000_000);
		let logger = Arc::new(TestLogger::new());
		(
			Channel::from_commitments(set_a, signer_a, Arc::clone(&logger)),
			Channel::from_commitments(set_b, signer_b, logger),
		)
	}

	fn quiesce(alice: &mut Channel<Arc<TestLogger>>, bob: &mut Channel<Arc<TestLogger>>) {
		let stfu = alice.begin_quiescence().unwrap();
		let reply = bob.handle_stfu(&stfu).unwrap().unwrap();
		assert!(alice.handle_stfu(&reply).unwrap().is_none());
	}

	/// Runs a full splice negotiation between the two channels, returning the commitment_signed
	/// batches each side produced at conclusion.
	/// Drives a splice through quiescence, `splice_init`/`splice_ack` and the interactive
	/// construction, stopping just before the commitment-signature exchange. Returns both
	/// sides' `commitment_signed` batches, still undelivered.
	fn negotiate_splice(
		alice: &mut Channel<Arc<TestLogger>>, bob: &mut Channel<Arc<TestLogger>>,
		contribution_satoshis: i64, feerate: u32,
	) -> (Vec<msgs::CommitmentSigned>, Vec<msgs::CommitmentSigned>) {
		let entropy_a = TestEntropySource::new(100);
		let entropy_b = TestEntropySource::new(200);
		quiesce(alice, bob);
		let init = alice.initiate_splice(contribution_satoshis, feerate, 0, None).unwrap();
		// Alice funds her contribution (plus fees) with a wallet input.
		let input_value = if contribution_satoshis > 0 {
			contribution_satoshis as u64 + 50_000
		} else {
			50_000
		};
		let ack = bob.handle_splice_init(&init, &entropy_b, vec![], vec![], 0).unwrap();
		let secp_ctx = Secp256k1::new();
		let bob_node_id = PublicKey::from_secret_key(
			&secp_ctx,
			&SecretKey::from_slice(&[99; 32]).unwrap(),
		);
		let first = alice
			.handle_splice_ack(
				&ack,
				&entropy_a,
				&bob_node_id,
				vec![test_utils::wallet_input(input_value, 77)],
				vec![],
			)
			.unwrap();

		// Ping-pong the interactive messages until both sides conclude.
		let mut to_bob = Some(wrap_msg(first));
		let mut to_alice: Option<InteractiveTxMessageIn> = None;
		let mut alice_sigs = None;
		let mut bob_sigs = None;
		for _ in 0..32 {
			if let Some(msg) = to_bob.take() {
				match bob.handle_interactive_tx_message(&msg).unwrap() {
					SpliceProgress::Continue(Some(next)) => to_alice = Some(wrap_msg(next)),
					SpliceProgress::Continue(None) => {},
					SpliceProgress::Concluded { last_message, commit_sigs } => {
						bob_sigs = Some(commit_sigs);
						to_alice = last_message.map(wrap_msg);
					},
					_ => panic!("splice aborted"),
				}
			} else if let Some(msg) = to_alice.take() {
				match alice.handle_interactive_tx_message(&msg).unwrap() {
					SpliceProgress::Continue(Some(next)) => to_bob = Some(wrap_msg(next)),
					SpliceProgress::Continue(None) => {},
					SpliceProgress::Concluded { last_message, commit_sigs } => {
						alice_sigs = Some(commit_sigs);
						to_bob = last_message.map(wrap_msg);
					},
					_ => panic!("splice aborted"),
				}
			} else {
				break;
			}
		}
		(alice_sigs.expect("alice concluded"), bob_sigs.expect("bob concluded"))
	}

	fn run_splice(
		alice: &mut Channel<Arc<TestLogger>>, bob: &mut Channel<Arc<TestLogger>>,
		contribution_satoshis: i64, feerate: u32,
	) {
		let (alice_sigs, bob_sigs) = negotiate_splice(alice, bob, contribution_satoshis, feerate);

		// Exchange the commitment signatures for the new funding. The channel stays quiescent
		// until the splice resolves, so no updates can interleave with this exchange.
		alice.handle_splice_commitment_signed(&bob_sigs[0]).unwrap();
		bob.handle_splice_commitment_signed(&alice_sigs[0]).unwrap();

		// Then tx_signatures: Bob contributed no inputs and signs first.
		let bob_tx_sigs = bob
			.provide_splice_witnesses(vec![], None)
			.unwrap()
			.expect("the acceptor signs first");
		assert!(alice
			.provide_splice_witnesses(vec![dummy_witness()], None)
			.unwrap()
			.is_none());
		let (alice_tx_sigs, tx) = alice.handle_tx_signatures(&bob_tx_sigs).unwrap();
		assert!(tx.is_some());
		let (none, tx) = bob.handle_tx_signatures(&alice_tx_sigs.unwrap()).unwrap();
		assert!(none.is_none());
		assert!(tx.is_some());
	}

	fn dummy_witness() -> bitcoin::Witness {
		bitcoin::Witness::from_slice(&[&[0x0au8; 72][..], &[0x02u8; 33][..]])
	}

	fn wrap_msg(msg: InteractiveTxMessageSend) -> InteractiveTxMessageIn {
		match msg {
			InteractiveTxMessageSend::TxAddInput(m) => InteractiveTxMessageIn::TxAddInput(m),
			InteractiveTxMessageSend::TxAddOutput(m) => InteractiveTxMessageIn::TxAddOutput(m),
			InteractiveTxMessageSend::TxComplete(m) => InteractiveTxMessageIn::TxComplete(m),
		}
	}

	#[test]
	fn test_reestablish_retransmits_identical_commit_sig() {
		let (mut alice, mut bob) = channel_pair();
		let add = alice
			.send_add_htlc(100_000_000, PaymentHash([1; 32]), 500, onion(), None)
			.unwrap();
		bob.handle_update_add_htlc(&add).unwrap();

		// Alice signs, but the message is lost before Bob sees it.
		let sigs = alice.send_commitment().unwrap();

		alice.peer_disconnected();
		bob.peer_disconnected();

		let bob_reestablish = bob.get_channel_reestablish();
		// Bob never saw the commit_sig so he still expects the same next commitment number.
		let retrans = alice.handle_channel_reestablish(&bob_reestablish).unwrap();
		let retransmitted = retrans.commitment_signed.expect("must retransmit commit_sig");
		assert_eq!(retransmitted.len(), sigs.len());
		assert_eq!(retransmitted[0].encode(), sigs[0].encode());

		// And Bob, having processed nothing, has nothing for Alice.
		let alice_reestablish = alice.get_channel_reestablish();
		let retrans = bob.handle_channel_reestablish(&alice_reestablish).unwrap();
		assert!(retrans.commitment_signed.is_none());
		assert!(retrans.revoke_and_ack.is_none());

		// Delivery after reestablish completes the round trip normally.
		let raa = bob.handle_commitment_signed(&retransmitted).unwrap();
		alice.handle_revoke_and_ack(&raa).unwrap();
	}

	#[test]
	fn test_add_rejected_during_quiescence() {
		let (mut alice, mut bob) = channel_pair();
		quiesce(&mut alice, &mut bob);

		// Sending is refused locally...
		match alice.send_add_htlc(1_000_000, PaymentHash([1; 32]), 500, onion(), None) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("expected local refusal"),
		}
		// ...and receiving one is a warning plus a scheduled disconnect.
		let add = msgs::UpdateAddHTLC {
			channel_id: bob.channel_id(),
			htlc_id: 0,
			amount_msat: 1_000_000,
			payment_hash: PaymentHash([1; 32]),
			cltv_expiry: 500,
			onion_routing_packet: onion(),
			blinding_point: None,
		};
		match bob.handle_update_add_htlc(&add) {
			Err(ChannelError::Warn(_)) => {},
			_ => panic!("expected warning"),
		}
		assert!(bob.disconnect_scheduled());
	}

	#[test]
	fn test_splice_in_resolves_to_expected_balances() {
		// Capacity 1.5M sat, splice-in of 500k by us. Afterwards the capacity is
		// 2M with to_local 1.3M sat and to_remote 0.7M sat (in msat).
		let (mut alice, mut bob) = channel_pair();
		run_splice(&mut alice, &mut bob, 500_000, 1000);

		assert_eq!(alice.commitments.active.len(), 2);
		let new_commitment = &alice.commitments.active[0];
		assert_eq!(new_commitment.funding_tx_index, 1);
		assert_eq!(new_commitment.capacity_satoshis, 2_000_000);
		assert_eq!(new_commitment.local_commit.spec.to_local_msat, 1_300_000_000);
		assert_eq!(new_commitment.local_commit.spec.to_remote_msat, 700_000_000);
		// Balance conservation: the spec carries the full (new) capacity on every active
		// commitment, before build-time fee deduction.
		for commitment in alice.commitments.active.iter() {
			assert_eq!(
				commitment.local_commit.spec.total_msat(),
				commitment.capacity_satoshis * 1000
			);
		}

		// Bob sees the mirror image.
		let bob_new = &bob.commitments.active[0];
		assert_eq!(bob_new.capacity_satoshis, 2_000_000);
		assert_eq!(bob_new.local_commit.spec.to_local_msat, 700_000_000);
		assert_eq!(bob_new.local_commit.spec.to_remote_msat, 1_300_000_000);

		// Locking the new funding on both sides retires the old commitment.
		let locked = alice.funding_tx_confirmed(new_commitment.funding_outpoint.txid).unwrap();
		let locked = locked.expect("a splice confirmation produces splice_locked");
		let bob_locked = bob.handle_splice_locked(&locked).unwrap().unwrap();
		assert!(alice.handle_splice_locked(&bob_locked).unwrap().is_none());
		assert_eq!(alice.commitments.active.len(), 1);
		assert_eq!(alice.commitments.inactive.len(), 1);
	}

	#[test]
	fn test_updates_apply_to_all_active_commitments() {
		let (mut alice, mut bob) = channel_pair();
		run_splice(&mut alice, &mut bob, 500_000, 1000);
		assert_eq!(alice.commitments.active.len(), 2);

		// An HTLC added while the splice is pending must land on both active commitments.
		let preimage = PaymentPreimage([9; 32]);
		let add = alice
			.send_add_htlc(50_000_000, preimage.payment_hash(), 500, onion(), None)
			.unwrap();
		bob.handle_update_add_htlc(&add).unwrap();
		let sigs = alice.send_commitment().unwrap();
		assert_eq!(sigs.len(), 2);
		assert_eq!(sigs[0].batch.as_ref().unwrap().batch_size, 2);
		let raa = bob.handle_commitment_signed(&sigs).unwrap();
		alice.handle_revoke_and_ack(&raa).unwrap();
		let sigs = bob.send_commitment().unwrap();
		let raa = alice.handle_commitment_signed(&sigs).unwrap();
		bob.handle_revoke_and_ack(&raa).unwrap();

		for commitment in alice.commitments.active.iter() {
			assert_eq!(commitment.local_commit.spec.htlcs.len(), 1);
			assert_eq!(commitment.remote_commit.spec.htlcs.len(), 1);
		}
	}

	#[test]
	fn test_settlements_blocked_during_splice_signature_exchange() {
		let (mut alice, mut bob) = channel_pair();
		// Commit an HTLC first so a settlement would otherwise be possible.
		let preimage = PaymentPreimage([21; 32]);
		let add = alice
			.send_add_htlc(40_000_000, preimage.payment_hash(), 500, onion(), None)
			.unwrap();
		bob.handle_update_add_htlc(&add).unwrap();
		let sigs = alice.send_commitment().unwrap();
		let raa = bob.handle_commitment_signed(&sigs).unwrap();
		alice.handle_revoke_and_ack(&raa).unwrap();
		let sigs = bob.send_commitment().unwrap();
		let raa = alice.handle_commitment_signed(&sigs).unwrap();
		bob.handle_revoke_and_ack(&raa).unwrap();

		let (alice_sigs, bob_sigs) = negotiate_splice(&mut alice, &mut bob, 500_000, 1000);

		// The splice commitment exchange is still in flight: settling the HTLC, signing, or
		// receiving an ordinary signing round must all be refused, so the snapshot taken at
		// negotiation time cannot go stale underneath it.
		match bob.send_fulfill_htlc(0, preimage) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("settlements must wait for the splice to resolve"),
		}
		match bob.send_commitment() {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("signing must wait for the splice to resolve"),
		}
		match alice.handle_commitment_signed(&bob_sigs) {
			Err(ChannelError::Warn(_)) => {},
			_ => panic!("an ordinary signing round while quiescent is a protocol deviation"),
		}
		assert!(alice.disconnect_scheduled());

		// Routing the same signatures through the splice path completes the exchange...
		alice.handle_splice_commitment_signed(&bob_sigs[0]).unwrap();
		bob.handle_splice_commitment_signed(&alice_sigs[0]).unwrap();
		let bob_tx_sigs = bob.provide_splice_witnesses(vec![], None).unwrap().unwrap();
		assert!(alice
			.provide_splice_witnesses(vec![dummy_witness()], None)
			.unwrap()
			.is_none());
		let (alice_tx_sigs, _) = alice.handle_tx_signatures(&bob_tx_sigs).unwrap();
		bob.handle_tx_signatures(&alice_tx_sigs.unwrap()).unwrap();

		// ...after which the settlement applies to every active commitment in lock-step.
		let fulfill = bob.send_fulfill_htlc(0, preimage).unwrap();
		alice.handle_update_fulfill_htlc(&fulfill).unwrap();
		let sigs = bob.send_commitment().unwrap();
		let raa = alice.handle_commitment_signed(&sigs).unwrap();
		bob.handle_revoke_and_ack(&raa).unwrap();
		for commitment in alice.commitments.active.iter() {
			assert!(commitment.local_commit.spec.htlcs.is_empty());
		}
	}

	#[test]
	fn test_batch_size_mismatch_is_protocol_error() {
		let (mut alice, mut bob) = channel_pair();
		run_splice(&mut alice, &mut bob, 500_000, 1000);

		let add = alice
			.send_add_htlc(50_000_000, PaymentHash([3; 32]), 500, onion(), None)
			.unwrap();
		bob.handle_update_add_htlc(&add).unwrap();
		let sigs = alice.send_commitment().unwrap();
		assert_eq!(sigs.len(), 2);
		// Deliver only half the batch.
		match bob.handle_commitment_signed(&sigs[0..1]) {
			Err(ChannelError::Warn(_)) => {},
			_ => panic!("expected a warning for a short batch"),
		}
	}

	#[test]
	fn test_shutdown_and_closing_negotiation() {
		let (mut alice, mut bob) = channel_pair();
		let script_a = ScriptBuf::from(vec![0x00, 0x14, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
		let script_b = ScriptBuf::from(vec![0x00, 0x14, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);

		let shutdown_a = alice.begin_shutdown(script_a.clone()).unwrap();
		let shutdown_b = bob.handle_shutdown(&shutdown_a, script_b.clone()).unwrap().unwrap();
		assert!(alice.handle_shutdown(&shutdown_b, script_a).unwrap().is_none());

		// Alice opens at 2000 sat while Bob would prefer 1000; bisection must converge.
		let mut to_bob = Some(alice.propose_closing_signed(2_000).unwrap());
		let mut to_alice: Option<msgs::ClosingSigned> = None;
		let mut closing_tx = None;
		for _ in 0..32 {
			if let Some(msg) = to_bob.take() {
				let (reply, tx) = bob.handle_closing_signed(&msg, 1_000).unwrap();
				if let Some(tx) = tx {
					closing_tx = Some(tx);
					break;
				}
				to_alice = reply;
			} else if let Some(msg) = to_alice.take() {
				let (reply, tx) = alice.handle_closing_signed(&msg, 2_000).unwrap();
				if let Some(tx) = tx {
					closing_tx = Some(tx);
					break;
				}
				to_bob = reply;
			} else {
				break;
			}
		}
		let closing_tx = closing_tx.expect("fee negotiation must converge");
		assert_eq!(closing_tx.input.len(), 1);
		assert!(!closing_tx.input[0].witness.is_empty());
		// Both final outputs are above dust and pay the negotiated scripts.
		assert_eq!(closing_tx.output.len(), 2);
	}

	#[test]
	fn test_rbf_attempts_preserve_balances() {
		// Splice at feerate F, then RBF at 1.5F and again at 2F. Every attempt's
		// commitment must carry identical to_local and to_remote.
		let (mut alice, mut bob) = channel_pair();
		run_splice(&mut alice, &mut bob, 500_000, 1000);
		// The splice resolved and lifted quiescence; each RBF re-runs the negotiation and
		// needs the channel quiet again.
		quiesce(&mut alice, &mut bob);

		let entropy_a = TestEntropySource::new(31);
		let entropy_b = TestEntropySource::new(32);
		for feerate in [1500u32, 2000] {
			let init_rbf = alice.initiate_rbf(feerate, 0).unwrap();
			let ack = bob
				.handle_tx_init_rbf(&init_rbf, &entropy_b, vec![], vec![])
				.unwrap();
			let first = alice
				.handle_tx_ack_rbf(
					&ack,
					&entropy_a,
					vec![test_utils::wallet_input(560_000, (feerate / 100) as u8)],
					vec![],
				)
				.unwrap();

			let mut to_bob = Some(wrap_msg(first));
			let mut to_alice: Option<InteractiveTxMessageIn> = None;
			let mut alice_sigs = None;
			let mut bob_sigs = None;
			for _ in 0..32 {
				if let Some(msg) = to_bob.take() {
					match bob.handle_interactive_tx_message(&msg).unwrap() {
						SpliceProgress::Continue(next) => to_alice = next.map(wrap_msg),
						SpliceProgress::Concluded { last_message, commit_sigs } => {
							bob_sigs = Some(commit_sigs);
							to_alice = last_message.map(wrap_msg);
						},
						_ => panic!("rbf aborted"),
					}
				} else if let Some(msg) = to_alice.take() {
					match alice.handle_interactive_tx_message(&msg).unwrap() {
						SpliceProgress::Continue(next) => to_bob = next.map(wrap_msg),
						SpliceProgress::Concluded { last_message, commit_sigs } => {
							alice_sigs = Some(commit_sigs);
							to_bob = last_message.map(wrap_msg);
						},
						_ => panic!("rbf aborted"),
					}
				} else {
					break;
				}
			}
			alice.handle_splice_commitment_signed(&bob_sigs.unwrap()[0]).unwrap();
			bob.handle_splice_commitment_signed(&alice_sigs.unwrap()[0]).unwrap();
		}

		// Original + three pairwise double-spending attempts at funding index 1.
		assert_eq!(alice.commitments.active.len(), 4);
		let attempts: Vec<_> = alice
			.commitments
			.active
			.iter()
			.filter(|c| c.funding_tx_index == 1)
			.collect();
		assert_eq!(attempts.len(), 3);
		for attempt in attempts.iter() {
			assert_eq!(attempt.capacity_satoshis, 2_000_000);
			assert_eq!(attempt.local_commit.spec.to_local_msat, 1_300_000_000);
			assert_eq!(attempt.local_commit.spec.to_remote_msat, 700_000_000);
		}

		// Only one attempt can confirm; the others are pruned on first confirmation.
		let winner = attempts[1].funding_outpoint.txid;
		alice.funding_tx_confirmed(winner).unwrap();
		assert_eq!(alice.commitments.active.len(), 2);
		assert!(alice
			.commitments
			.active
			.iter()
			.any(|c| c.funding_outpoint.txid == winner && c.is_confirmed()));
	}

	#[test]
	fn test_v1_open_handshake_to_usable_channel() {
		use bitcoin::hashes::Hash;
		let secp_ctx = Secp256k1::new();
		let signer_a = test_utils::test_signer(10);
		let signer_b = test_utils::test_signer(110);
		let party_a = test_utils::linked_commitment_sets(&secp_ctx, 1_000_000, 600_000_000, 400_000_000).0.params.holder.clone();
		let party_b = test_utils::linked_commitment_sets(&secp_ctx, 1_000_000, 600_000_000, 400_000_000).2.params.holder.clone();
		let logger = Arc::new(TestLogger::new());

		let (mut opener, open_msg) = PendingChannel::new_outbound(
			signer_a,
			party_a,
			1_000_000,
			400_000_000,
			1000,
			bitcoin::BlockHash::all_zeros(),
			[0x55; 32],
		);
		let (acceptor, accept_msg) =
			PendingChannel::new_inbound(&open_msg, signer_b, party_b, 3).unwrap();
		opener.handle_accept_channel(&accept_msg).unwrap();

		let funding_outpoint = crate::chain::transaction::OutPoint {
			txid: bitcoin::Txid::from_byte_array([0xfd; 32]),
			index: 0,
		};
		let fc = opener.funding_created(funding_outpoint).unwrap();
		let (mut chan_b, fs) =
			acceptor.handle_funding_created(&fc, Arc::clone(&logger)).unwrap();
		let mut chan_a = opener.handle_funding_signed(&fs, Arc::clone(&logger)).unwrap();

		// Funding confirms on both sides; channel_ready crosses.
		let ready_a = chan_a.initial_funding_confirmed().unwrap();
		let ready_b = chan_b.initial_funding_confirmed().unwrap();
		chan_a.handle_channel_ready(&ready_b).unwrap();
		chan_b.handle_channel_ready(&ready_a).unwrap();

		// The channel is now usable end to end: add an HTLC and run a full signing round.
		let preimage = PaymentPreimage([3; 32]);
		let add = chan_a
			.send_add_htlc(25_000_000, preimage.payment_hash(), 500, onion(), None)
			.unwrap();
		chan_b.handle_update_add_htlc(&add).unwrap();
		let sigs = chan_a.send_commitment().unwrap();
		let raa = chan_b.handle_commitment_signed(&sigs).unwrap();
		chan_a.handle_revoke_and_ack(&raa).unwrap();
		assert_eq!(chan_b.commitments.local_commit_index(), 1);
	}

	#[test]
	fn test_force_close_produces_signed_commitment() {
		let (mut alice, _bob) = channel_pair();
		let tx = alice.force_close();
		assert_eq!(tx.input.len(), 1);
		assert!(!tx.input[0].witness.is_empty());
		assert_eq!(
			tx.input[0].previous_output,
			alice.commitments.active[0].funding_outpoint.into_bitcoin_outpoint()
		);
	}

	#[test]
	fn test_channel_record_roundtrip() {
		let (mut alice, mut bob) = channel_pair();
		// Put some real state in: a committed HTLC and a revealed secret on each side.
		let preimage = PaymentPreimage([5; 32]);
		let add = alice
			.send_add_htlc(10_000_000, preimage.payment_hash(), 500, onion(), None)
			.unwrap();
		bob.handle_update_add_htlc(&add).unwrap();
		let sigs = alice.send_commitment().unwrap();
		let raa = bob.handle_commitment_signed(&sigs).unwrap();
		alice.handle_revoke_and_ack(&raa).unwrap();

		let record = alice.encode();
		let signer = test_utils::test_signer(10);
		let logger = Arc::new(TestLogger::new());
		let mut reloaded =
			Channel::read(&mut std::io::Cursor::new(&record), signer, logger).unwrap();
		assert_eq!(reloaded.commitments, alice.commitments);
		// A reloaded channel starts disconnected: it must reestablish before use.
		match reloaded.send_add_htlc(1_000_000, PaymentHash([9; 32]), 500, onion(), None) {
			Err(ChannelError::Ignore(_)) => {},
			_ => panic!("reloaded channels require reestablish first"),
		}
	}
}
