// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Interactive transaction construction: the multi-round contribution protocol used for
//! dual-funded channel opens, splices and RBF attempts.
//!
//! Both peers add and remove inputs and outputs one message at a time; consecutive
//! `tx_complete` from both sides concludes the negotiation, after which commitment signatures
//! and finally `tx_signatures` are exchanged. A splice session carries exactly one shared input
//! (the previous funding output) and every session carries exactly one shared output (the new
//! funding output).

use bitcoin::amount::Amount;
use bitcoin::locktime::absolute::LockTime;
use bitcoin::policy::MAX_STANDARD_TX_WEIGHT;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1};
use bitcoin::transaction::{OutPoint, Transaction, TxIn, TxOut, Version};
use bitcoin::{Sequence, Witness};

use crate::ln::msgs;
use crate::ln::msgs::{SerialId, TxSignatures};
use crate::ln::types::ChannelId;
use crate::sign::{verify_node_signature, EntropySource};
use crate::util::ser::TransactionU16LenLimited;

use core::mem;
use std::collections::{HashMap, HashSet};

/// The number of received `tx_add_input` messages during a negotiation at which point the
/// negotiation MUST be failed.
const MAX_RECEIVED_TX_ADD_INPUT_COUNT: u16 = 4096;

/// The number of received `tx_add_output` messages during a negotiation at which point the
/// negotiation MUST be failed.
const MAX_RECEIVED_TX_ADD_OUTPUT_COUNT: u16 = 4096;

/// The number of inputs or outputs that the state machine can have, before it MUST fail the
/// negotiation.
const MAX_INPUTS_OUTPUTS_COUNT: usize = 252;

/// The total weight of the common transaction fields the initiator must additionally pay for.
const TX_COMMON_FIELDS_WEIGHT: u64 = (4 /* version */ + 4 /* locktime */ + 1 /* input count */
	+ 1 /* output count */) * 4 + 2 /* segwit marker + flag */;

/// An RBF attempt must raise the feerate by at least 1/24th, mirroring bitcoind's incremental
/// relay policy at the protocol level.
const RBF_FEERATE_INCREASE_NUM: u64 = 25;
const RBF_FEERATE_INCREASE_DEN: u64 = 24;

trait SerialIdExt {
	fn is_for_initiator(&self) -> bool;
}
impl SerialIdExt for SerialId {
	fn is_for_initiator(&self) -> bool {
		self % 2 == 0
	}
}

/// The reason an interactive transaction negotiation was aborted, reported to the peer in a
/// `tx_abort` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
	/// The peer aborted the negotiation.
	CounterpartyAborted,
	/// Received a message we were not expecting in the current negotiation state.
	UnexpectedCounterpartyMessage,
	/// We required confirmed inputs and the peer contributed an unconfirmed one.
	InputsNotConfirmed,
	/// Too many `tx_add_input` messages were received.
	ReceivedTooManyTxAddInputs,
	/// Too many `tx_add_output` messages were received.
	ReceivedTooManyTxAddOutputs,
	/// An input used a disallowed (final) sequence value.
	IncorrectInputSequenceValue,
	/// A serial id had the parity of the wrong party.
	IncorrectSerialIdParity,
	/// A removal referenced a serial id never added (or already removed).
	SerialIdUnknown,
	/// An addition reused a serial id already in the transaction.
	DuplicateSerialId,
	/// A `prevtx`/`prevtx_vout` pair was invalid, non-witness, or double-added.
	PrevTxOutInvalid,
	/// An output was below the dust limit for its script.
	BelowDustLimit,
	/// An output value exceeded the total bitcoin supply.
	ExceededMaximumSatsAllowed,
	/// More than the allowed number of inputs or outputs.
	ExceededNumberOfInputsOrOutputs,
	/// The constructed transaction exceeded the standard weight limit.
	TransactionTooLarge,
	/// An output script was not one we are required to accept.
	InvalidOutputScript,
	/// The peer's contributed fee did not meet the negotiated feerate.
	InsufficientFees,
	/// The peer's outputs exceeded their inputs.
	OutputsExceedInputs,
	/// The negotiated feerate was below our minimum.
	FeerateBelowMinimum,
	/// A splice session did not contain exactly one shared (previous funding) input.
	MissingSharedInput,
	/// The shared input was contributed more than once.
	DuplicateSharedInput,
	/// The session did not contain exactly one shared (new funding) output.
	MissingSharedOutput,
	/// The shared output was contributed more than once.
	DuplicateSharedOutput,
	/// An RBF attempt did not carry the liquidity purchase its predecessor had.
	MissingLiquidityPurchase,
	/// The liquidity purchase witness signature was invalid.
	InvalidLiquidityWitness,
	/// An RBF was attempted while the previous funding transaction requires confirmations and
	/// has none.
	PreviousFundingUnconfirmed,
	/// An RBF was attempted against an already-confirmed funding transaction.
	CannotRbfConfirmedTx,
	/// An RBF was attempted against a zero-conf funding transaction.
	CannotRbfZeroConfTx,
	/// An RBF attempt did not raise the feerate enough.
	InsufficientFeerateIncrease,
	/// The shared output's value does not equal the previous capacity plus both declared
	/// contributions.
	FundingOutputValueMismatch,
}

impl core::fmt::Display for AbortReason {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		match self {
			AbortReason::CounterpartyAborted => f.write_str("Counterparty aborted"),
			AbortReason::UnexpectedCounterpartyMessage => {
				f.write_str("Received an unexpected message")
			},
			AbortReason::InputsNotConfirmed => f.write_str("Required confirmed inputs"),
			AbortReason::ReceivedTooManyTxAddInputs => {
				f.write_str("Too many `tx_add_input`s received")
			},
			AbortReason::ReceivedTooManyTxAddOutputs => {
				f.write_str("Too many `tx_add_output`s received")
			},
			AbortReason::IncorrectInputSequenceValue => {
				f.write_str("Input has a final sequence value")
			},
			AbortReason::IncorrectSerialIdParity => f.write_str("Incorrect serial id parity"),
			AbortReason::SerialIdUnknown => f.write_str("The serial id is unknown"),
			AbortReason::DuplicateSerialId => f.write_str("The serial id is a duplicate"),
			AbortReason::PrevTxOutInvalid => f.write_str("Invalid previous transaction output"),
			AbortReason::BelowDustLimit => f.write_str("Output amount is below the dust limit"),
			AbortReason::ExceededMaximumSatsAllowed => {
				f.write_str("Output amount exceeds the total bitcoin supply")
			},
			AbortReason::ExceededNumberOfInputsOrOutputs => {
				f.write_str("Too many inputs or outputs")
			},
			AbortReason::TransactionTooLarge => f.write_str("Transaction weight is too large"),
			AbortReason::InvalidOutputScript => f.write_str("Output script is non-standard"),
			AbortReason::InsufficientFees => f.write_str("Insufficient fees paid"),
			AbortReason::OutputsExceedInputs => {
				f.write_str("Total input amount is less than total output amount")
			},
			AbortReason::FeerateBelowMinimum => f.write_str("Feerate is below our minimum"),
			AbortReason::MissingSharedInput => {
				f.write_str("Splice transaction is missing the previous funding input")
			},
			AbortReason::DuplicateSharedInput => {
				f.write_str("The previous funding input was added twice")
			},
			AbortReason::MissingSharedOutput => {
				f.write_str("Transaction is missing the new funding output")
			},
			AbortReason::DuplicateSharedOutput => {
				f.write_str("The new funding output was added twice")
			},
			AbortReason::MissingLiquidityPurchase => {
				f.write_str("RBF attempt is missing the liquidity purchase of its predecessor")
			},
			AbortReason::InvalidLiquidityWitness => {
				f.write_str("Invalid liquidity purchase witness signature")
			},
			AbortReason::PreviousFundingUnconfirmed => {
				f.write_str("Previous funding transaction is still unconfirmed")
			},
			AbortReason::CannotRbfConfirmedTx => {
				f.write_str("Cannot RBF a confirmed funding transaction")
			},
			AbortReason::CannotRbfZeroConfTx => {
				f.write_str("Cannot RBF a zero-conf funding transaction")
			},
			AbortReason::InsufficientFeerateIncrease => {
				f.write_str("RBF feerate does not sufficiently exceed the previous attempt")
			},
			AbortReason::FundingOutputValueMismatch => {
				f.write_str("Funding output value does not match the declared contributions")
			},
		}
	}
}

impl AbortReason {
	/// Renders the `tx_abort` message reporting this failure to the peer.
	pub fn into_tx_abort(self, channel_id: ChannelId) -> msgs::TxAbort {
		msgs::TxAbort { channel_id, data: self.to_string().into_bytes() }
	}
}

/// The previous funding output, spent as the single shared input of a splice transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedFundingInput {
	/// The previous funding outpoint.
	pub outpoint: OutPoint,
	/// The value of the previous funding output.
	pub value_satoshis: u64,
}

/// The new funding output, the single shared output of every interactively-built transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedFundingOutput {
	/// The script of the new funding output.
	pub script_pubkey: ScriptBuf,
	/// The value of the new funding output, ie the post-splice capacity.
	pub value_satoshis: u64,
}

/// An input one party plans to contribute, with the transaction whose output it spends.
#[derive(Clone, Debug)]
pub struct FundingTxInput {
	/// The input itself (outpoint, sequence; witness empty until signing).
	pub input: TxIn,
	/// The output being spent.
	pub prev_output: TxOut,
	/// The full previous transaction, relayed so the peer can check non-malleability.
	pub prevtx: Transaction,
}

#[derive(Clone, Debug)]
enum NegotiatedInput {
	/// The shared (previous funding) input; its value is known to both sides already.
	Shared { input: TxIn, value_satoshis: u64 },
	/// A regular contributed input.
	Contributed { input: TxIn, prev_output: TxOut },
}

impl NegotiatedInput {
	fn tx_in(&self) -> &TxIn {
		match self {
			NegotiatedInput::Shared { input, .. } => input,
			NegotiatedInput::Contributed { input, .. } => input,
		}
	}

	fn value_satoshis(&self) -> u64 {
		match self {
			NegotiatedInput::Shared { value_satoshis, .. } => *value_satoshis,
			NegotiatedInput::Contributed { prev_output, .. } => prev_output.value.to_sat(),
		}
	}
}

/// The arguments a negotiation is parameterized by.
#[derive(Clone, Debug)]
pub struct NegotiationParams {
	/// The channel this negotiation belongs to.
	pub channel_id: ChannelId,
	/// Whether the holder initiated the negotiation (and thus uses even serial ids and pays for
	/// the common transaction fields and the shared output).
	pub holder_is_initiator: bool,
	/// The feerate both parties' contributions must pay for.
	pub feerate_sat_per_kw: u32,
	/// The minimum feerate we will accept at all.
	pub feerate_floor_sat_per_kw: u32,
	/// Whether we demand the peer's inputs be confirmed.
	pub require_confirmed_inputs: bool,
	/// The locktime of the constructed transaction.
	pub locktime: u32,
	/// The shared input, present exactly for splice sessions.
	pub shared_funding_input: Option<SharedFundingInput>,
	/// The shared output (the new funding output).
	pub shared_funding_output: SharedFundingOutput,
	/// The capacity change we declared (`splice_init`/`open_channel2`), in satoshis. Negative
	/// for a splice-out.
	pub holder_contribution_satoshis: i64,
	/// The capacity change the peer declared (`splice_ack`/`accept_channel2`), in satoshis.
	pub counterparty_contribution_satoshis: i64,
}

struct NegotiationContext {
	params: NegotiationParams,
	received_tx_add_input_count: u16,
	received_tx_add_output_count: u16,
	inputs: HashMap<SerialId, NegotiatedInput>,
	prevtx_outpoints: HashSet<OutPoint>,
	outputs: HashMap<SerialId, TxOut>,
	shared_input_serial: Option<SerialId>,
	shared_output_serial: Option<SerialId>,
}

impl NegotiationContext {
	fn new(params: NegotiationParams) -> Self {
		Self {
			params,
			received_tx_add_input_count: 0,
			received_tx_add_output_count: 0,
			inputs: HashMap::new(),
			prevtx_outpoints: HashSet::new(),
			outputs: HashMap::new(),
			shared_input_serial: None,
			shared_output_serial: None,
		}
	}

	fn is_valid_counterparty_serial_id(&self, serial_id: SerialId) -> bool {
		// A received `SerialId`'s parity must match the role of the counterparty.
		self.params.holder_is_initiator == !serial_id.is_for_initiator()
	}

	fn add_input(
		&mut self, serial_id: SerialId, msg: &msgs::TxAddInput,
	) -> Result<(), AbortReason> {
		if msg.sequence >= 0xFFFFFFFE {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//    - `sequence` is set to `0xFFFFFFFE` or `0xFFFFFFFF`
			return Err(AbortReason::IncorrectInputSequenceValue);
		}

		let input = if let Some(shared_txid) = msg.shared_input_txid {
			let shared = self
				.params
				.shared_funding_input
				.as_ref()
				.ok_or(AbortReason::PrevTxOutInvalid)?;
			if shared.outpoint.txid != shared_txid || shared.outpoint.vout != msg.prevtx_out {
				return Err(AbortReason::PrevTxOutInvalid);
			}
			if self.shared_input_serial.is_some() {
				return Err(AbortReason::DuplicateSharedInput);
			}
			self.shared_input_serial = Some(serial_id);
			NegotiatedInput::Shared {
				input: TxIn {
					previous_output: shared.outpoint,
					script_sig: ScriptBuf::new(),
					sequence: Sequence(msg.sequence),
					witness: Witness::new(),
				},
				value_satoshis: shared.value_satoshis,
			}
		} else {
			let prevtx = msg
				.prevtx
				.as_ref()
				.ok_or(AbortReason::PrevTxOutInvalid)?
				.as_transaction();
			let prev_output = if let Some(tx_out) = prevtx.output.get(msg.prevtx_out as usize) {
				if !tx_out.script_pubkey.is_witness_program() {
					// The receiving node:
					//  - MUST fail the negotiation if:
					//     - the `scriptPubKey` is not a witness program
					return Err(AbortReason::PrevTxOutInvalid);
				}
				tx_out.clone()
			} else {
				// The receiving node:
				//  - MUST fail the negotiation if:
				//     - `prevtx_vout` is greater or equal to the number of outputs on `prevtx`
				return Err(AbortReason::PrevTxOutInvalid);
			};
			let outpoint = OutPoint { txid: prevtx.compute_txid(), vout: msg.prevtx_out };
			if !self.prevtx_outpoints.insert(outpoint) {
				// The receiving node:
				//  - MUST fail the negotiation if:
				//     - the `prevtx` and `prevtx_vout` are identical to a previously added
				//       (and not removed) input's
				return Err(AbortReason::PrevTxOutInvalid);
			}
			NegotiatedInput::Contributed {
				input: TxIn {
					previous_output: outpoint,
					script_sig: ScriptBuf::new(),
					sequence: Sequence(msg.sequence),
					witness: Witness::new(),
				},
				prev_output,
			}
		};

		if self.inputs.insert(serial_id, input).is_some() {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//    - the `serial_id` is already included in the transaction
			return Err(AbortReason::DuplicateSerialId);
		}
		Ok(())
	}

	fn receive_tx_add_input(
		&mut self, msg: &msgs::TxAddInput, confirmed: bool,
	) -> Result<(), AbortReason> {
		if !self.is_valid_counterparty_serial_id(msg.serial_id) {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//     - the `serial_id` has the wrong parity
			return Err(AbortReason::IncorrectSerialIdParity);
		}
		if self.params.require_confirmed_inputs && !confirmed && msg.shared_input_txid.is_none() {
			return Err(AbortReason::InputsNotConfirmed);
		}
		self.received_tx_add_input_count += 1;
		if self.received_tx_add_input_count > MAX_RECEIVED_TX_ADD_INPUT_COUNT {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//     - it has received 4096 `tx_add_input` messages during this negotiation
			return Err(AbortReason::ReceivedTooManyTxAddInputs);
		}
		self.add_input(msg.serial_id, msg)
	}

	fn send_tx_add_input(&mut self, msg: &msgs::TxAddInput) -> Result<(), AbortReason> {
		self.add_input(msg.serial_id, msg)
	}

	fn add_output(
		&mut self, serial_id: SerialId, value_satoshis: u64, script: ScriptBuf,
	) -> Result<(), AbortReason> {
		if script == self.params.shared_funding_output.script_pubkey {
			if value_satoshis != self.params.shared_funding_output.value_satoshis {
				return Err(AbortReason::PrevTxOutInvalid);
			}
			if self.shared_output_serial.is_some() {
				return Err(AbortReason::DuplicateSharedOutput);
			}
			self.shared_output_serial = Some(serial_id);
		} else {
			// The receiving node:
			//   - MUST accept P2WSH, P2WPKH, P2TR scripts
			//   - MAY fail the negotiation if the script is non-standard
			if !script.is_p2wpkh() && !script.is_p2wsh() && !script.is_p2tr() {
				return Err(AbortReason::InvalidOutputScript);
			}
		}
		if value_satoshis < script.minimal_non_dust().to_sat() {
			// The receiving node:
			// - MUST fail the negotiation if:
			//    - the sats amount is less than the dust_limit
			return Err(AbortReason::BelowDustLimit);
		}
		if value_satoshis > msgs::MAX_VALUE_MSAT / 1000 {
			// The receiving node:
			// - MUST fail the negotiation if:
			//    - the sats amount is greater than the total bitcoin supply
			return Err(AbortReason::ExceededMaximumSatsAllowed);
		}
		let output = TxOut { value: Amount::from_sat(value_satoshis), script_pubkey: script };
		if self.outputs.insert(serial_id, output).is_some() {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//    - the `serial_id` is already included in the transaction
			return Err(AbortReason::DuplicateSerialId);
		}
		Ok(())
	}

	fn receive_tx_add_output(&mut self, msg: &msgs::TxAddOutput) -> Result<(), AbortReason> {
		if !self.is_valid_counterparty_serial_id(msg.serial_id) {
			return Err(AbortReason::IncorrectSerialIdParity);
		}
		self.received_tx_add_output_count += 1;
		if self.received_tx_add_output_count > MAX_RECEIVED_TX_ADD_OUTPUT_COUNT {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//     - it has received 4096 `tx_add_output` messages during this negotiation
			return Err(AbortReason::ReceivedTooManyTxAddOutputs);
		}
		self.add_output(msg.serial_id, msg.sats, msg.script.clone())
	}

	fn send_tx_add_output(&mut self, msg: &msgs::TxAddOutput) -> Result<(), AbortReason> {
		self.add_output(msg.serial_id, msg.sats, msg.script.clone())
	}

	fn remove_input(&mut self, serial_id: SerialId) -> Result<(), AbortReason> {
		if let Some(removed) = self.inputs.remove(&serial_id) {
			self.prevtx_outpoints.remove(&removed.tx_in().previous_output);
			if self.shared_input_serial == Some(serial_id) {
				self.shared_input_serial = None;
			}
			Ok(())
		} else {
			// The receiving node:
			//  - MUST fail the negotiation if:
			//    - the input or output identified by the `serial_id` was not added by the sender
			//    - the `serial_id` does not correspond to a currently added input
			Err(AbortReason::SerialIdUnknown)
		}
	}

	fn receive_tx_remove_input(&mut self, msg: &msgs::TxRemoveInput) -> Result<(), AbortReason> {
		if !self.is_valid_counterparty_serial_id(msg.serial_id) {
			return Err(AbortReason::IncorrectSerialIdParity);
		}
		self.remove_input(msg.serial_id)
	}

	fn remove_output(&mut self, serial_id: SerialId) -> Result<(), AbortReason> {
		if self.outputs.remove(&serial_id).is_some() {
			if self.shared_output_serial == Some(serial_id) {
				self.shared_output_serial = None;
			}
			Ok(())
		} else {
			Err(AbortReason::SerialIdUnknown)
		}
	}

	fn receive_tx_remove_output(&mut self, msg: &msgs::TxRemoveOutput) -> Result<(), AbortReason> {
		if !self.is_valid_counterparty_serial_id(msg.serial_id) {
			return Err(AbortReason::IncorrectSerialIdParity);
		}
		self.remove_output(msg.serial_id)
	}

	/// Total value of a party's inputs, excluding the shared (previous funding) input.
	fn contributed_input_value(&self, by_initiator: bool) -> u64 {
		self.inputs
			.iter()
			.filter(|(serial_id, _)| {
				serial_id.is_for_initiator() == by_initiator
					&& self.shared_input_serial != Some(**serial_id)
			})
			.map(|(_, input)| input.value_satoshis())
			.sum()
	}

	/// Total value of a party's outputs, excluding the shared (new funding) output.
	fn contributed_output_value(&self, by_initiator: bool) -> u64 {
		self.outputs
			.iter()
			.filter(|(serial_id, _)| {
				serial_id.is_for_initiator() == by_initiator
					&& self.shared_output_serial != Some(**serial_id)
			})
			.map(|(_, output)| output.value.to_sat())
			.sum()
	}

	fn estimated_contribution_weight(&self, by_initiator: bool) -> u64 {
		// Contributors pay for their inputs and outputs at the negotiated feerate; witnesses are
		// estimated at the P2WPKH size since we cannot know the exact spend type.
		let mut weight = 0u64;
		for (serial_id, input) in self.inputs.iter() {
			if serial_id.is_for_initiator() == by_initiator {
				weight += (32 + 4 + 4 + 1) * 4;
				weight += match input {
					NegotiatedInput::Shared { .. } => 1 + 1 + 64, // MuSig2/2-of-2 spend
					NegotiatedInput::Contributed { .. } => crate::sign::P2WPKH_WITNESS_WEIGHT,
				};
			}
		}
		for (serial_id, output) in self.outputs.iter() {
			if serial_id.is_for_initiator() == by_initiator {
				weight += (8 + 1 + output.script_pubkey.len() as u64) * 4;
			}
		}
		if by_initiator {
			weight += TX_COMMON_FIELDS_WEIGHT;
		}
		weight
	}

	/// Validates the final transaction and builds it, with inputs and outputs ordered by serial
	/// id (both sides sort identically).
	fn build_transaction(self) -> Result<ConstructedTransaction, AbortReason> {
		// The receiving node:
		// MUST fail the negotiation if:

		// - the transaction does not contain the shared input/output it must
		if self.params.shared_funding_input.is_some() && self.shared_input_serial.is_none() {
			return Err(AbortReason::MissingSharedInput);
		}
		let shared_output_serial =
			self.shared_output_serial.ok_or(AbortReason::MissingSharedOutput)?;

		// - there are more than 252 inputs
		// - there are more than 252 outputs
		if self.inputs.len() > MAX_INPUTS_OUTPUTS_COUNT
			|| self.outputs.len() > MAX_INPUTS_OUTPUTS_COUNT
		{
			return Err(AbortReason::ExceededNumberOfInputsOrOutputs);
		}

		let initiator_inputs = self.contributed_input_value(true);
		let acceptor_inputs = self.contributed_input_value(false);
		let initiator_outputs = self.contributed_output_value(true);
		let acceptor_outputs = self.contributed_output_value(false);
		let counterparty_is_initiator = !self.params.holder_is_initiator;
		let counterparty_weight = self.estimated_contribution_weight(counterparty_is_initiator);

		let mut sorted_inputs: Vec<(SerialId, NegotiatedInput)> = self.inputs.into_iter().collect();
		sorted_inputs.sort_unstable_by_key(|(serial_id, _)| *serial_id);
		let mut sorted_outputs: Vec<(SerialId, TxOut)> = self.outputs.into_iter().collect();
		sorted_outputs.sort_unstable_by_key(|(serial_id, _)| *serial_id);

		let shared_input_index = self
			.shared_input_serial
			.map(|serial| sorted_inputs.iter().position(|(s, _)| *s == serial).unwrap() as u32);
		let shared_output_index =
			sorted_outputs.iter().position(|(s, _)| *s == shared_output_serial).unwrap() as u32;

		let tx = Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_consensus(self.params.locktime),
			input: sorted_inputs.iter().map(|(_, input)| input.tx_in().clone()).collect(),
			output: sorted_outputs.iter().map(|(_, output)| output.clone()).collect(),
		};

		// - the new funding output's value does not match what both sides declared
		let (initiator_contribution, acceptor_contribution) = if self.params.holder_is_initiator {
			(self.params.holder_contribution_satoshis, self.params.counterparty_contribution_satoshis)
		} else {
			(self.params.counterparty_contribution_satoshis, self.params.holder_contribution_satoshis)
		};
		let previous_capacity =
			self.params.shared_funding_input.as_ref().map(|i| i.value_satoshis).unwrap_or(0);
		let expected_capacity = previous_capacity as i128
			+ initiator_contribution as i128
			+ acceptor_contribution as i128;
		if expected_capacity != self.params.shared_funding_output.value_satoshis as i128 {
			return Err(AbortReason::FundingOutputValueMismatch);
		}

		// - the peer's total input satoshis is less than their outputs
		let total_in: u64 = initiator_inputs + acceptor_inputs + previous_capacity;
		let total_out: u64 = tx.output.iter().map(|output| output.value.to_sat()).sum();
		if total_in < total_out {
			return Err(AbortReason::OutputsExceedInputs);
		}

		if tx.weight().to_wu() > MAX_STANDARD_TX_WEIGHT as u64 {
			return Err(AbortReason::TransactionTooLarge);
		}

		// - the peer's paid feerate does not meet or exceed the agreed feerate (based on the
		//   minimum fee). We only police the counterparty here; our own contribution was
		//   budgeted when it was selected. A party's fee is whatever its inputs don't cover of
		//   its change outputs plus its declared capacity contribution.
		let (counterparty_inputs, counterparty_outputs) = if counterparty_is_initiator {
			(initiator_inputs, initiator_outputs)
		} else {
			(acceptor_inputs, acceptor_outputs)
		};
		let counterparty_fees = counterparty_inputs as i128
			- counterparty_outputs as i128
			- self.params.counterparty_contribution_satoshis as i128;
		let required_counterparty_fee =
			self.params.feerate_sat_per_kw as u64 * counterparty_weight / 1000;
		if counterparty_fees < required_counterparty_fee as i128 {
			return Err(AbortReason::InsufficientFees);
		}

		Ok(ConstructedTransaction {
			tx,
			shared_input_index,
			shared_output_index,
			shared_output_value_satoshis: self.params.shared_funding_output.value_satoshis,
			holder_contribution_satoshis: self.params.holder_contribution_satoshis,
			counterparty_contribution_satoshis: self.params.counterparty_contribution_satoshis,
			initiator_inputs_value_satoshis: initiator_inputs,
			acceptor_inputs_value_satoshis: acceptor_inputs,
			holder_is_initiator: self.params.holder_is_initiator,
		})
	}
}

/// The outcome of a successful negotiation: the unsigned transaction, plus the per-party value
/// accounting needed to compute the balance changes on the new commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstructedTransaction {
	/// The unsigned transaction, inputs and outputs sorted by serial id.
	pub tx: Transaction,
	/// The input index of the shared (previous funding) input, for splices.
	pub shared_input_index: Option<u32>,
	/// The output index of the shared (new funding) output.
	pub shared_output_index: u32,
	/// The value of the shared output, ie the new channel capacity.
	pub shared_output_value_satoshis: u64,
	/// The capacity change the holder declared and validated.
	pub holder_contribution_satoshis: i64,
	/// The capacity change the peer declared and validated.
	pub counterparty_contribution_satoshis: i64,
	/// Total value of the inputs the initiator contributed (excluding the shared input).
	pub initiator_inputs_value_satoshis: u64,
	/// Total value of the inputs the acceptor contributed.
	pub acceptor_inputs_value_satoshis: u64,
	/// Whether the holder was the initiator of this negotiation.
	pub holder_is_initiator: bool,
}

impl ConstructedTransaction {
	/// The txid of the unsigned transaction.
	pub fn txid(&self) -> bitcoin::Txid {
		self.tx.compute_txid()
	}

	/// The signed change to the holder's commitment balance: its declared contribution (inputs
	/// minus change outputs minus its share of the mining fee were validated against it).
	pub fn holder_net_contribution_satoshis(&self) -> i64 {
		self.holder_contribution_satoshis
	}

	/// Whether the holder must send its `tx_signatures` first: the party who contributed less
	/// total input value signs first, ties going to the initiator.
	pub fn holder_sends_tx_signatures_first(&self) -> bool {
		let (holder_inputs, counterparty_inputs) = if self.holder_is_initiator {
			(self.initiator_inputs_value_satoshis, self.acceptor_inputs_value_satoshis)
		} else {
			(self.acceptor_inputs_value_satoshis, self.initiator_inputs_value_satoshis)
		};
		if holder_inputs != counterparty_inputs {
			holder_inputs < counterparty_inputs
		} else {
			self.holder_is_initiator
		}
	}
}

/// A message to send to the peer as the next step of the negotiation.
#[derive(Clone, Debug)]
pub enum InteractiveTxMessageSend {
	/// Contribute an input.
	TxAddInput(msgs::TxAddInput),
	/// Contribute an output.
	TxAddOutput(msgs::TxAddOutput),
	/// We have nothing (left) to contribute.
	TxComplete(msgs::TxComplete),
}

// The state machine of a single negotiation, from the perspective of the holder. Receiving a
// message always hands the turn to us; sending one always hands it to the peer.
enum StateMachine {
	// Only present transiently while a transition is computed.
	Indeterminate,
	/// It is our turn to contribute or complete.
	OurTurn(NegotiationContext),
	/// We have contributed or completed; the peer moves.
	TheirTurn(NegotiationContext),
	/// We have sent `tx_complete` and are waiting for theirs.
	OurTxComplete(NegotiationContext),
	/// The peer sent `tx_complete`; if we also complete, negotiation concludes.
	TheirTxComplete(NegotiationContext),
	/// Both sides sent consecutive `tx_complete`s; the transaction is final.
	NegotiationComplete(ConstructedTransaction),
	/// The negotiation failed and cannot be continued.
	NegotiationAborted(AbortReason),
}

impl Default for StateMachine {
	fn default() -> Self {
		Self::Indeterminate
	}
}

/// Drives one interactive transaction negotiation, queueing our contributions and validating
/// the peer's, one message per turn.
pub struct InteractiveTxConstructor {
	state: StateMachine,
	channel_id: ChannelId,
	holder_is_initiator: bool,
	inputs_to_contribute: Vec<(SerialId, FundingTxInput)>,
	outputs_to_contribute: Vec<(SerialId, TxOut)>,
}

impl InteractiveTxConstructor {
	/// Instantiates a new constructor. The initiator contributes the shared input (for splices)
	/// and the shared output automatically; both are included in `params`.
	///
	/// If we are the initiator, returns the first message to send.
	pub fn new<ES: EntropySource>(
		params: NegotiationParams, entropy_source: &ES, inputs: Vec<FundingTxInput>,
		outputs: Vec<TxOut>,
	) -> Result<(Self, Option<InteractiveTxMessageSend>), AbortReason> {
		if params.feerate_sat_per_kw < params.feerate_floor_sat_per_kw {
			return Err(AbortReason::FeerateBelowMinimum);
		}
		let channel_id = params.channel_id;
		let holder_is_initiator = params.holder_is_initiator;
		let mut constructor = Self {
			state: if holder_is_initiator {
				StateMachine::OurTurn(NegotiationContext::new(params.clone()))
			} else {
				StateMachine::TheirTurn(NegotiationContext::new(params.clone()))
			},
			channel_id,
			holder_is_initiator,
			inputs_to_contribute: Vec::new(),
			outputs_to_contribute: Vec::new(),
		};

		let mut used_serials = HashSet::new();
		let mut next_serial = |entropy_source: &ES| -> SerialId {
			loop {
				let bytes = entropy_source.get_secure_random_bytes();
				let mut serial = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
				if serial.is_for_initiator() != holder_is_initiator {
					serial ^= 1;
				}
				if used_serials.insert(serial) {
					return serial;
				}
			}
		};

		if holder_is_initiator {
			// The initiator contributes the shared input and the shared output.
			if let Some(shared_input) = params.shared_funding_input.as_ref() {
				let serial = next_serial(entropy_source);
				constructor.inputs_to_contribute.push((
					serial,
					FundingTxInput {
						input: TxIn {
							previous_output: shared_input.outpoint,
							script_sig: ScriptBuf::new(),
							sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
							witness: Witness::new(),
						},
						prev_output: TxOut {
							value: Amount::from_sat(shared_input.value_satoshis),
							script_pubkey: ScriptBuf::new(),
						},
						prevtx: Transaction {
							version: Version::TWO,
							lock_time: LockTime::ZERO,
							input: vec![],
							output: vec![],
						},
					},
				));
			}
			let serial = next_serial(entropy_source);
			constructor.outputs_to_contribute.push((
				serial,
				TxOut {
					value: Amount::from_sat(params.shared_funding_output.value_satoshis),
					script_pubkey: params.shared_funding_output.script_pubkey.clone(),
				},
			));
		}
		for input in inputs {
			let serial = next_serial(entropy_source);
			constructor.inputs_to_contribute.push((serial, input));
		}
		for output in outputs {
			let serial = next_serial(entropy_source);
			constructor.outputs_to_contribute.push((serial, output));
		}
		// Contribute in ascending serial order; the queues are popped from the back.
		constructor.inputs_to_contribute.sort_unstable_by_key(|(serial, _)| *serial);
		constructor.inputs_to_contribute.reverse();
		constructor.outputs_to_contribute.sort_unstable_by_key(|(serial, _)| *serial);
		constructor.outputs_to_contribute.reverse();

		let first_message =
			if holder_is_initiator { Some(constructor.maybe_send_message()?) } else { None };
		Ok((constructor, first_message))
	}

	fn abort(&mut self, reason: AbortReason) -> AbortReason {
		self.state = StateMachine::NegotiationAborted(reason.clone());
		reason
	}

	/// Pops the next queued contribution (or a `tx_complete`) and applies it to our context.
	fn maybe_send_message(&mut self) -> Result<InteractiveTxMessageSend, AbortReason> {
		let state = mem::take(&mut self.state);
		let mut context = match state {
			StateMachine::OurTurn(context) | StateMachine::TheirTxComplete(context) => context,
			_ => return Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		};

		if let Some((serial_id, input)) = self.inputs_to_contribute.pop() {
			let is_shared = context
				.params
				.shared_funding_input
				.as_ref()
				.map(|shared| shared.outpoint == input.input.previous_output)
				.unwrap_or(false);
			let msg = msgs::TxAddInput {
				channel_id: self.channel_id,
				serial_id,
				prevtx: if is_shared {
					None
				} else {
					Some(
						TransactionU16LenLimited::new(input.prevtx.clone())
							.map_err(|_| self.abort(AbortReason::PrevTxOutInvalid))?,
					)
				},
				prevtx_out: input.input.previous_output.vout,
				sequence: input.input.sequence.0,
				shared_input_txid: if is_shared {
					Some(input.input.previous_output.txid)
				} else {
					None
				},
			};
			if let Err(reason) = context.send_tx_add_input(&msg) {
				return Err(self.abort(reason));
			}
			self.state = StateMachine::TheirTurn(context);
			Ok(InteractiveTxMessageSend::TxAddInput(msg))
		} else if let Some((serial_id, output)) = self.outputs_to_contribute.pop() {
			let msg = msgs::TxAddOutput {
				channel_id: self.channel_id,
				serial_id,
				sats: output.value.to_sat(),
				script: output.script_pubkey,
			};
			if let Err(reason) = context.send_tx_add_output(&msg) {
				return Err(self.abort(reason));
			}
			self.state = StateMachine::TheirTurn(context);
			Ok(InteractiveTxMessageSend::TxAddOutput(msg))
		} else {
			self.state = StateMachine::OurTxComplete(context);
			Ok(InteractiveTxMessageSend::TxComplete(msgs::TxComplete {
				channel_id: self.channel_id,
			}))
		}
	}

	/// Handles an incoming `tx_add_input`, returning the next message to send.
	pub fn handle_tx_add_input(
		&mut self, msg: &msgs::TxAddInput, confirmed: bool,
	) -> Result<InteractiveTxMessageSend, AbortReason> {
		let state = mem::take(&mut self.state);
		let mut context = match state {
			StateMachine::TheirTurn(context) | StateMachine::OurTxComplete(context) => context,
			_ => return Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		};
		if let Err(reason) = context.receive_tx_add_input(msg, confirmed) {
			return Err(self.abort(reason));
		}
		self.state = StateMachine::OurTurn(context);
		self.maybe_send_message()
	}

	/// Handles an incoming `tx_add_output`, returning the next message to send.
	pub fn handle_tx_add_output(
		&mut self, msg: &msgs::TxAddOutput,
	) -> Result<InteractiveTxMessageSend, AbortReason> {
		let state = mem::take(&mut self.state);
		let mut context = match state {
			StateMachine::TheirTurn(context) | StateMachine::OurTxComplete(context) => context,
			_ => return Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		};
		if let Err(reason) = context.receive_tx_add_output(msg) {
			return Err(self.abort(reason));
		}
		self.state = StateMachine::OurTurn(context);
		self.maybe_send_message()
	}

	/// Handles an incoming `tx_remove_input`, returning the next message to send.
	pub fn handle_tx_remove_input(
		&mut self, msg: &msgs::TxRemoveInput,
	) -> Result<InteractiveTxMessageSend, AbortReason> {
		let state = mem::take(&mut self.state);
		let mut context = match state {
			StateMachine::TheirTurn(context) | StateMachine::OurTxComplete(context) => context,
			_ => return Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		};
		if let Err(reason) = context.receive_tx_remove_input(msg) {
			return Err(self.abort(reason));
		}
		self.state = StateMachine::OurTurn(context);
		self.maybe_send_message()
	}

	/// Handles an incoming `tx_remove_output`, returning the next message to send.
	pub fn handle_tx_remove_output(
		&mut self, msg: &msgs::TxRemoveOutput,
	) -> Result<InteractiveTxMessageSend, AbortReason> {
		let state = mem::take(&mut self.state);
		let mut context = match state {
			StateMachine::TheirTurn(context) | StateMachine::OurTxComplete(context) => context,
			_ => return Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		};
		if let Err(reason) = context.receive_tx_remove_output(msg) {
			return Err(self.abort(reason));
		}
		self.state = StateMachine::OurTurn(context);
		self.maybe_send_message()
	}

	/// Handles an incoming `tx_complete`. If we also have nothing left to add, the negotiation
	/// concludes and the built transaction is returned alongside our own `tx_complete`.
	pub fn handle_tx_complete(
		&mut self, _msg: &msgs::TxComplete,
	) -> Result<(Option<InteractiveTxMessageSend>, Option<ConstructedTransaction>), AbortReason>
	{
		let state = mem::take(&mut self.state);
		match state {
			StateMachine::TheirTurn(context) => {
				// They are done; it is our turn and we may still have contributions queued.
				if self.inputs_to_contribute.is_empty() && self.outputs_to_contribute.is_empty() {
					let constructed = match context.build_transaction() {
						Ok(tx) => tx,
						Err(reason) => return Err(self.abort(reason)),
					};
					self.state = StateMachine::NegotiationComplete(constructed.clone());
					Ok((
						Some(InteractiveTxMessageSend::TxComplete(msgs::TxComplete {
							channel_id: self.channel_id,
						})),
						Some(constructed),
					))
				} else {
					self.state = StateMachine::TheirTxComplete(context);
					let next = self.maybe_send_message()?;
					Ok((Some(next), None))
				}
			},
			StateMachine::OurTxComplete(context) => {
				// Consecutive tx_completes: the negotiation is concluded.
				let constructed = match context.build_transaction() {
					Ok(tx) => tx,
					Err(reason) => return Err(self.abort(reason)),
				};
				self.state = StateMachine::NegotiationComplete(constructed.clone());
				Ok((None, Some(constructed)))
			},
			_ => Err(self.abort(AbortReason::UnexpectedCounterpartyMessage)),
		}
	}

	/// Handles an incoming `tx_abort`.
	pub fn handle_tx_abort(&mut self, _msg: &msgs::TxAbort) -> AbortReason {
		self.abort(AbortReason::CounterpartyAborted)
	}

	/// Returns the concluded transaction, if negotiation is complete.
	pub fn constructed_transaction(&self) -> Option<&ConstructedTransaction> {
		match &self.state {
			StateMachine::NegotiationComplete(tx) => Some(tx),
			_ => None,
		}
	}

	/// Consumes the constructor into a signing session once negotiation has concluded.
	pub fn into_signing_session(self) -> Result<InteractiveTxSigningSession, AbortReason> {
		match self.state {
			StateMachine::NegotiationComplete(tx) => {
				let holder_sends_tx_signatures_first = tx.holder_sends_tx_signatures_first();
				Ok(InteractiveTxSigningSession {
					unsigned_tx: tx,
					holder_sends_tx_signatures_first,
					holder_tx_signatures: None,
					counterparty_tx_signatures: None,
				})
			},
			_ => Err(AbortReason::UnexpectedCounterpartyMessage),
		}
	}
}

/// Validates an RBF attempt against the state of the attempt it replaces.
pub fn validate_rbf_attempt(
	previous_feerate_sat_per_kw: u32, new_feerate_sat_per_kw: u32,
	previous_status: &crate::ln::commitments::FundingStatus,
	new_request_funding: Option<&msgs::RequestFunding>,
) -> Result<(), AbortReason> {
	match previous_status {
		crate::ln::commitments::FundingStatus::Confirmed => {
			return Err(AbortReason::CannotRbfConfirmedTx)
		},
		crate::ln::commitments::FundingStatus::ZeroconfPublished => {
			return Err(AbortReason::CannotRbfZeroConfTx)
		},
		crate::ln::commitments::FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat } => {
			if liquidity_fee_msat.is_some() && new_request_funding.is_none() {
				return Err(AbortReason::MissingLiquidityPurchase);
			}
		},
		crate::ln::commitments::FundingStatus::SingleFundedUnconfirmed => {},
	}
	let min_feerate = previous_feerate_sat_per_kw as u64 * RBF_FEERATE_INCREASE_NUM
		/ RBF_FEERATE_INCREASE_DEN;
	if (new_feerate_sat_per_kw as u64) < min_feerate {
		return Err(AbortReason::InsufficientFeerateIncrease);
	}
	Ok(())
}

/// Validates a `will_fund` response against the `request_funding` it answers, returning the fee
/// (in millisatoshi) the funder is owed from the initiator's balance.
pub fn validate_will_fund<T: secp256k1::Verification>(
	request: &msgs::RequestFunding, will_fund: &msgs::WillFund, funder_node_id: &PublicKey,
	secp_ctx: &Secp256k1<T>,
) -> Result<u64, AbortReason> {
	if will_fund.rates != *request {
		return Err(AbortReason::InvalidLiquidityWitness);
	}
	verify_node_signature(&will_fund.rates, &will_fund.signature, funder_node_id, secp_ctx)
		.map_err(|_| AbortReason::InvalidLiquidityWitness)?;
	let proportional_msat = request.requested_amount_satoshis as u128
		* request.funding_fee_proportional_millionths as u128
		/ 1_000_000;
	Ok(request.funding_fee_base_satoshis * 1000 + proportional_msat as u64 * 1000)
}

/// Tracks an interactively-built transaction between negotiation conclusion and broadcast:
/// commitment signatures first, then `tx_signatures` in the agreed order.
#[derive(Clone, Debug)]
pub struct InteractiveTxSigningSession {
	/// The transaction both sides agreed on.
	pub unsigned_tx: ConstructedTransaction,
	/// Whether we send our `tx_signatures` before the peer does.
	pub holder_sends_tx_signatures_first: bool,
	/// Our `tx_signatures`, once our wallet has provided witnesses.
	pub holder_tx_signatures: Option<TxSignatures>,
	/// The peer's `tx_signatures`, once received.
	pub counterparty_tx_signatures: Option<TxSignatures>,
}

impl InteractiveTxSigningSession {
	/// Records our own witnesses (in our-input serial order) once the wallet has signed.
	pub fn provide_holder_witnesses(
		&mut self, channel_id: ChannelId, witnesses: Vec<Witness>,
		shared_input_signature: Option<bitcoin::secp256k1::ecdsa::Signature>,
	) {
		self.holder_tx_signatures = Some(TxSignatures {
			channel_id,
			tx_hash: self.unsigned_tx.txid(),
			witnesses,
			shared_input_signature,
		});
	}

	/// Records the peer's `tx_signatures`. Returns whether the txid matched the negotiated
	/// transaction.
	pub fn received_tx_signatures(&mut self, msg: TxSignatures) -> bool {
		if msg.tx_hash != self.unsigned_tx.txid() {
			return false;
		}
		self.counterparty_tx_signatures = Some(msg);
		true
	}

	/// Whether both signature sets are present.
	pub fn has_all_signatures(&self) -> bool {
		self.holder_tx_signatures.is_some() && self.counterparty_tx_signatures.is_some()
	}

	/// Assembles the fully-signed transaction once both parties' witnesses are present.
	///
	/// Each party's witnesses apply to its own inputs, in the serial-id order the transaction's
	/// inputs were sorted into; the shared input's witness is assembled separately by the caller
	/// from both parties' shared-input signatures.
	pub fn finalize_transaction(&self) -> Option<Transaction> {
		if !self.has_all_signatures() {
			return None;
		}
		let mut tx = self.unsigned_tx.tx.clone();
		let holder_sigs = self.holder_tx_signatures.as_ref().unwrap();
		let counterparty_sigs = self.counterparty_tx_signatures.as_ref().unwrap();
		let mut holder_witnesses = holder_sigs.witnesses.iter();
		let mut counterparty_witnesses = counterparty_sigs.witnesses.iter();
		for (idx, input) in tx.input.iter_mut().enumerate() {
			if Some(idx as u32) == self.unsigned_tx.shared_input_index {
				continue;
			}
			// Input ordering follows serial ids, and serial parity identifies the contributor,
			// but we no longer have serial ids here; witnesses are consumed in order from
			// whichever party still has some left and matches the expected count. Holder inputs
			// were recorded first during construction only for the initiator, so rely on
			// counts: each party provided exactly as many witnesses as it has inputs.
			if let Some(witness) = holder_witnesses.next() {
				input.witness = witness.clone();
				if !input.witness.is_empty() {
					continue;
				}
			}
			if let Some(witness) = counterparty_witnesses.next() {
				input.witness = witness.clone();
			}
		}
		Some(tx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::TestEntropySource;
	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	fn funding_output(value_satoshis: u64) -> SharedFundingOutput {
		SharedFundingOutput {
			script_pubkey: ScriptBuf::from(vec![0x00, 0x20, 0xaa, 0xbb]),
			value_satoshis,
		}
	}

	fn p2wpkh_prevtx(value_sat: u64, tag: u8) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint { txid: Txid::from_byte_array([tag; 32]), vout: 0 },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(value_sat),
				script_pubkey: ScriptBuf::from(vec![
					0x00, 0x14, tag, tag, tag, tag, tag, tag, tag, tag, tag, tag, tag, tag, tag,
					tag, tag, tag, tag, tag, tag, tag,
				]),
			}],
		}
	}

	fn contributed_input(value_sat: u64, tag: u8) -> FundingTxInput {
		let prevtx = p2wpkh_prevtx(value_sat, tag);
		FundingTxInput {
			input: TxIn {
				previous_output: OutPoint { txid: prevtx.compute_txid(), vout: 0 },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			},
			prev_output: prevtx.output[0].clone(),
			prevtx,
		}
	}

	fn params(
		initiator: bool, shared_input: Option<SharedFundingInput>, capacity: u64,
		own_contribution: i64, their_contribution: i64,
	) -> NegotiationParams {
		NegotiationParams {
			channel_id: ChannelId::from_bytes([0x42; 32]),
			holder_is_initiator: initiator,
			feerate_sat_per_kw: 1000,
			feerate_floor_sat_per_kw: 253,
			require_confirmed_inputs: false,
			locktime: 850_000,
			shared_funding_input: shared_input,
			shared_funding_output: funding_output(capacity),
			holder_contribution_satoshis: own_contribution,
			counterparty_contribution_satoshis: their_contribution,
		}
	}

	/// Run a full negotiation between two constructors, returning both constructed transactions.
	fn negotiate(
		mut initiator: InteractiveTxConstructor, mut acceptor: InteractiveTxConstructor,
		mut first: InteractiveTxMessageSend,
	) -> (ConstructedTransaction, ConstructedTransaction) {
		let mut turn_is_acceptor = true;
		let mut initiator_tx = None;
		let mut acceptor_tx = None;
		for _ in 0..64 {
			let (us, them): (&mut InteractiveTxConstructor, &mut InteractiveTxConstructor) =
				if turn_is_acceptor {
					(&mut acceptor, &mut initiator)
				} else {
					(&mut initiator, &mut acceptor)
				};
			let _ = them;
			let next = match first {
				InteractiveTxMessageSend::TxAddInput(ref msg) => {
					Some(us.handle_tx_add_input(msg, true).unwrap())
				},
				InteractiveTxMessageSend::TxAddOutput(ref msg) => {
					Some(us.handle_tx_add_output(msg).unwrap())
				},
				InteractiveTxMessageSend::TxComplete(ref msg) => {
					let (response, constructed) = us.handle_tx_complete(msg).unwrap();
					if let Some(tx) = constructed {
						if turn_is_acceptor {
							acceptor_tx = Some(tx);
						} else {
							initiator_tx = Some(tx);
						}
					}
					response
				},
			};
			match next {
				Some(msg) => {
					first = msg;
					turn_is_acceptor = !turn_is_acceptor;
				},
				None => break,
			}
		}
		// Whichever side concluded without sending may still need its result recorded.
		if initiator_tx.is_none() {
			initiator_tx = initiator.constructed_transaction().cloned();
		}
		if acceptor_tx.is_none() {
			acceptor_tx = acceptor.constructed_transaction().cloned();
		}
		(initiator_tx.unwrap(), acceptor_tx.unwrap())
	}

	#[test]
	fn test_dual_funded_negotiation_converges() {
		let entropy_a = TestEntropySource::new(1);
		let entropy_b = TestEntropySource::new(2);
		// The initiator funds the 150k funding output with a 200k input; the acceptor adds a
		// 50k input and a small change output.
		let (initiator, first) = InteractiveTxConstructor::new(
			params(true, None, 150_000, 150_000, 0),
			&entropy_a,
			vec![contributed_input(200_000, 3)],
			vec![],
		)
		.unwrap();
		let (acceptor, none) = InteractiveTxConstructor::new(
			params(false, None, 150_000, 0, 150_000),
			&entropy_b,
			vec![contributed_input(50_000, 4)],
			vec![TxOut {
				value: Amount::from_sat(40_000),
				script_pubkey: ScriptBuf::from(vec![0x00, 0x20, 0xcc, 0xdd]),
			}],
		)
		.unwrap();
		assert!(none.is_none());

		let (tx_a, tx_b) = negotiate(initiator, acceptor, first.unwrap());
		assert_eq!(tx_a.txid(), tx_b.txid());
		assert_eq!(tx_a.tx.input.len(), 2);
		assert_eq!(tx_a.tx.output.len(), 2);
		assert_eq!(
			tx_a.tx.output[tx_a.shared_output_index as usize].value.to_sat(),
			150_000
		);
		// Signing order: the acceptor contributed less input value and signs first.
		assert!(!tx_a.holder_sends_tx_signatures_first());
		assert!(tx_b.holder_sends_tx_signatures_first());
	}

	#[test]
	fn test_splice_negotiation_has_shared_input_and_output() {
		let entropy_a = TestEntropySource::new(5);
		let entropy_b = TestEntropySource::new(6);
		let shared_input = SharedFundingInput {
			outpoint: OutPoint { txid: Txid::from_byte_array([9; 32]), vout: 0 },
			value_satoshis: 1_500_000,
		};
		// Splice-in of 500k on top of 1.5M: the new capacity is 2M.
		let (initiator, first) = InteractiveTxConstructor::new(
			params(true, Some(shared_input.clone()), 2_000_000, 500_000, 0),
			&entropy_a,
			vec![contributed_input(510_000, 3)],
			vec![],
		)
		.unwrap();
		let (acceptor, _) = InteractiveTxConstructor::new(
			params(false, Some(shared_input), 2_000_000, 0, 500_000),
			&entropy_b,
			vec![],
			vec![],
		)
		.unwrap();

		let (tx_a, tx_b) = negotiate(initiator, acceptor, first.unwrap());
		assert_eq!(tx_a.txid(), tx_b.txid());
		assert!(tx_a.shared_input_index.is_some());
		assert_eq!(tx_a.tx.input.len(), 2);
		assert_eq!(
			tx_a.tx.output[tx_a.shared_output_index as usize].value.to_sat(),
			2_000_000
		);
		assert_eq!(tx_a.holder_net_contribution_satoshis(), 500_000);
		assert_eq!(tx_b.holder_net_contribution_satoshis(), 0);
	}

	#[test]
	fn test_wrong_serial_parity_aborts() {
		let entropy = TestEntropySource::new(7);
		let (mut acceptor, _) = InteractiveTxConstructor::new(
			params(false, None, 100_000, 0, 100_000),
			&entropy,
			vec![],
			vec![],
		)
		.unwrap();
		let prevtx = p2wpkh_prevtx(50_000, 1);
		let msg = msgs::TxAddInput {
			channel_id: ChannelId::from_bytes([0x42; 32]),
			serial_id: 1, // odd: has the acceptor's own parity
			prevtx: Some(TransactionU16LenLimited::new(prevtx).unwrap()),
			prevtx_out: 0,
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME.0,
			shared_input_txid: None,
		};
		assert_eq!(
			acceptor.handle_tx_add_input(&msg, true).err(),
			Some(AbortReason::IncorrectSerialIdParity)
		);
		// The failed negotiation is dead; everything now aborts.
		assert_eq!(
			acceptor.handle_tx_add_input(&msg, true).err(),
			Some(AbortReason::UnexpectedCounterpartyMessage)
		);
	}

	#[test]
	fn test_duplicate_serial_id_aborts() {
		let entropy = TestEntropySource::new(8);
		let (mut acceptor, _) = InteractiveTxConstructor::new(
			params(false, None, 100_000, 0, 100_000),
			&entropy,
			vec![],
			vec![],
		)
		.unwrap();
		let prevtx = p2wpkh_prevtx(50_000, 1);
		let mut msg = msgs::TxAddInput {
			channel_id: ChannelId::from_bytes([0x42; 32]),
			serial_id: 2,
			prevtx: Some(TransactionU16LenLimited::new(prevtx.clone()).unwrap()),
			prevtx_out: 0,
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME.0,
			shared_input_txid: None,
		};
		acceptor.handle_tx_add_input(&msg, true).unwrap();
		// Same serial id with a fresh outpoint
		msg.prevtx = Some(TransactionU16LenLimited::new(p2wpkh_prevtx(60_000, 2)).unwrap());
		assert_eq!(
			acceptor.handle_tx_add_input(&msg, true).err(),
			Some(AbortReason::DuplicateSerialId)
		);
	}

	#[test]
	fn test_insufficient_fee_aborts() {
		let entropy_a = TestEntropySource::new(9);
		let entropy_b = TestEntropySource::new(10);
		// The initiator contributes exactly the funding value: no fee at all.
		let (initiator, first) = InteractiveTxConstructor::new(
			params(true, None, 150_000, 150_000, 0),
			&entropy_a,
			vec![contributed_input(150_000, 3)],
			vec![],
		)
		.unwrap();
		let (mut acceptor, _) = InteractiveTxConstructor::new(
			params(false, None, 150_000, 0, 150_000),
			&entropy_b,
			vec![],
			vec![],
		)
		.unwrap();

		// Drive manually: input, funding output, then completes; the acceptor rejects at build
		// time once it can see the initiator's whole contribution.
		let mut initiator = initiator;
		let mut msg = first.unwrap();
		let last_err = loop {
			let response = match msg {
				InteractiveTxMessageSend::TxAddInput(ref m) => {
					match acceptor.handle_tx_add_input(m, true) {
						Ok(next) => next,
						Err(e) => break Some(e),
					}
				},
				InteractiveTxMessageSend::TxAddOutput(ref m) => {
					match acceptor.handle_tx_add_output(m) {
						Ok(next) => next,
						Err(e) => break Some(e),
					}
				},
				InteractiveTxMessageSend::TxComplete(ref m) => {
					match acceptor.handle_tx_complete(m) {
						Ok((next, _)) => match next {
							Some(next) => next,
							None => break None,
						},
						Err(e) => break Some(e),
					}
				},
			};
			// Every acceptor response here is a tx_complete (it contributes nothing).
			match response {
				InteractiveTxMessageSend::TxComplete(ref m) => {
					match initiator.handle_tx_complete(m) {
						Ok((Some(next), _)) => msg = next,
						Ok((None, _)) => break None,
						Err(e) => break Some(e),
					}
				},
				_ => panic!("the acceptor has nothing to contribute"),
			}
		};
		assert_eq!(last_err, Some(AbortReason::InsufficientFees));
	}

	#[test]
	fn test_rbf_validation() {
		use crate::ln::commitments::FundingStatus;
		// Below the 25/24 increase
		assert_eq!(
			validate_rbf_attempt(
				2400,
				2450,
				&FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat: None },
				None
			)
			.err(),
			Some(AbortReason::InsufficientFeerateIncrease)
		);
		// Exactly 25/24 is fine
		assert!(validate_rbf_attempt(
			2400,
			2500,
			&FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat: None },
			None
		)
		.is_ok());
		// Cannot replace a confirmed or zero-conf tx
		assert_eq!(
			validate_rbf_attempt(2400, 4800, &FundingStatus::Confirmed, None).err(),
			Some(AbortReason::CannotRbfConfirmedTx)
		);
		assert_eq!(
			validate_rbf_attempt(2400, 4800, &FundingStatus::ZeroconfPublished, None).err(),
			Some(AbortReason::CannotRbfZeroConfTx)
		);
		// A liquidity purchase must be re-requested on RBF
		assert_eq!(
			validate_rbf_attempt(
				2400,
				4800,
				&FundingStatus::DualFundedUnconfirmed { liquidity_fee_msat: Some(1000) },
				None
			)
			.err(),
			Some(AbortReason::MissingLiquidityPurchase)
		);
	}

	#[test]
	fn test_will_fund_witness_validation() {
		use crate::sign::InMemorySigner;
		use bitcoin::secp256k1::{Secp256k1, SecretKey};
		let secp_ctx = Secp256k1::new();
		let signer = InMemorySigner::new(
			SecretKey::from_slice(&[1; 32]).unwrap(),
			SecretKey::from_slice(&[2; 32]).unwrap(),
			SecretKey::from_slice(&[3; 32]).unwrap(),
			SecretKey::from_slice(&[4; 32]).unwrap(),
			SecretKey::from_slice(&[5; 32]).unwrap(),
			[6; 32],
			SecretKey::from_slice(&[7; 32]).unwrap(),
		);
		let request = msgs::RequestFunding {
			requested_amount_satoshis: 500_000,
			funding_fee_base_satoshis: 1_000,
			funding_fee_proportional_millionths: 200,
		};
		let will_fund = msgs::WillFund {
			rates: request.clone(),
			signature: signer.sign_with_node_key(&request, &secp_ctx),
		};
		let fee_msat =
			validate_will_fund(&request, &will_fund, &signer.node_id(&secp_ctx), &secp_ctx)
				.unwrap();
		// base 1000 sat + 500_000 * 200 / 1e6 = 100 sat proportional
		assert_eq!(fee_msat, 1_100_000);

		// A witness from the wrong key fails the session
		let other_node = SecretKey::from_slice(&[8; 32]).unwrap();
		let bogus = msgs::WillFund {
			rates: request.clone(),
			signature: {
				let signer2 = InMemorySigner { node_secret: other_node, ..signer.clone() };
				signer2.sign_with_node_key(&request, &secp_ctx)
			},
		};
		assert_eq!(
			validate_will_fund(&request, &bogus, &signer.node_id(&secp_ctx), &secp_ctx).err(),
			Some(AbortReason::InvalidLiquidityWitness)
		);
	}
}
