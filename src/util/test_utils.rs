// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Test fixtures: deterministic collaborator implementations and a helper which wires up two
//! fully-established commitment sets as channel peers.

use bitcoin::amount::Amount;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hash_types::Txid;
use bitcoin::locktime::absolute::LockTime;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::{OutPoint as BitcoinOutPoint, Transaction, TxIn, TxOut, Version};
use bitcoin::{Sequence, Witness};

use crate::chain::chaininterface::{ConfirmationTarget, FeeEstimator, Priority, TransactionPublisher};
use crate::chain::transaction::OutPoint;
use crate::ln::chan_utils::HolderCommitmentTransaction;
use crate::ln::channel_keys::build_commitment_point;
use crate::ln::commitments::{
	build_commitment_transaction, ChannelParams, Commitment, CommitmentSet, CommitmentSpec,
	FundingStatus, LocalCommit, PartyParams, RemoteCommit, INITIAL_COMMITMENT_NUMBER,
};
use crate::ln::interactivetxs::FundingTxInput;
use crate::ln::types::ChannelId;
use crate::sign::{EntropySource, InMemorySigner};
use crate::util::logger::{Level, Logger, Record};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A logger which captures every line for later inspection.
pub struct TestLogger {
	/// Lines logged so far, formatted.
	pub lines: Mutex<Vec<(Level, String)>>,
}

impl TestLogger {
	/// Creates a logger with an empty capture buffer.
	pub fn new() -> TestLogger {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}

	/// The number of captured lines containing `needle`.
	pub fn count_lines_containing(&self, needle: &str) -> usize {
		self.lines.lock().unwrap().iter().filter(|(_, line)| line.contains(needle)).count()
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!("{}", record.args);
		#[cfg(test)]
		println!("{:<5} [{} : {}] {}", record.level, record.module_path, record.line, line);
		self.lines.lock().unwrap().push((record.level, line));
	}
}

/// A fee estimator returning a fixed feerate for every priority.
pub struct TestFeeEstimator {
	/// The feerate returned for every request.
	pub sat_per_kw: u32,
}

impl TestFeeEstimator {
	/// Creates an estimator pinned at `sat_per_kw`.
	pub fn new(sat_per_kw: u32) -> Self {
		Self { sat_per_kw }
	}
}

impl FeeEstimator for TestFeeEstimator {
	fn get_est_sat_per_1000_weight(&self, _priority: Priority) -> u32 {
		self.sat_per_kw
	}
}

/// A publisher which records everything handed to it.
pub struct TestPublisher {
	/// Published transactions with the target each was given.
	pub published: Mutex<Vec<(Transaction, Option<ConfirmationTarget>)>>,
}

impl TestPublisher {
	/// Creates an empty publisher.
	pub fn new() -> Self {
		Self { published: Mutex::new(Vec::new()) }
	}
}

impl TransactionPublisher for TestPublisher {
	fn publish_final_tx(&self, tx: &Transaction) {
		self.published.lock().unwrap().push((tx.clone(), None));
	}
	fn publish_replaceable_tx(&self, tx: &Transaction, target: ConfirmationTarget) {
		self.published.lock().unwrap().push((tx.clone(), Some(target)));
	}
}

/// A deterministic entropy source: every draw hashes a seed and a counter.
pub struct TestEntropySource {
	seed: u64,
	counter: AtomicU64,
}

impl TestEntropySource {
	/// Creates a source whose output stream is determined entirely by `seed`.
	pub fn new(seed: u64) -> Self {
		Self { seed, counter: AtomicU64::new(0) }
	}
}

impl EntropySource for TestEntropySource {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let n = self.counter.fetch_add(1, Ordering::Relaxed);
		let mut engine = Sha256::engine();
		engine.input(&self.seed.to_be_bytes());
		engine.input(&n.to_be_bytes());
		Sha256::from_engine(engine).to_byte_array()
	}
}

/// A deterministic signer whose secrets derive from a single tag byte.
pub fn test_signer(tag: u8) -> InMemorySigner {
	let sk = |n: u8| SecretKey::from_slice(&[tag.wrapping_add(n).max(1); 32]).unwrap();
	InMemorySigner::new(sk(1), sk(2), sk(3), sk(4), sk(5), [tag.max(1); 32], sk(6))
}

fn party_params<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, signer: &InMemorySigner, capacity_satoshis: u64,
) -> PartyParams {
	PartyParams {
		dust_limit_satoshis: 546,
		max_htlc_value_in_flight_msat: capacity_satoshis * 1000,
		channel_reserve_satoshis: 10_000,
		htlc_minimum_msat: 1_000,
		to_self_delay: 144,
		max_accepted_htlcs: 50,
		pubkeys: signer.pubkeys(secp_ctx),
	}
}

/// Builds both sides of an already-established channel: two commitment sets which have signed
/// each other's initial commitments, agree on all parameters, and are ready to exchange
/// updates. Node A is the opener.
pub fn linked_commitment_sets<T: secp256k1::Signing + secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, capacity_satoshis: u64, to_a_msat: u64, to_b_msat: u64,
) -> (CommitmentSet, InMemorySigner, CommitmentSet, InMemorySigner) {
	assert_eq!(capacity_satoshis * 1000, to_a_msat + to_b_msat);
	let signer_a = test_signer(10);
	let signer_b = test_signer(110);

	let funding_outpoint = OutPoint { txid: Txid::from_byte_array([0xfd; 32]), index: 0 };
	let channel_id = ChannelId::v1_from_funding_outpoint(funding_outpoint);

	let params_a = ChannelParams {
		channel_id,
		holder: party_params(secp_ctx, &signer_a, capacity_satoshis),
		counterparty: party_params(secp_ctx, &signer_b, capacity_satoshis),
		is_outbound_from_holder: true,
		commitment_format: crate::ln::chan_utils::CommitmentFormat::DefaultSegwit,
	};
	let params_b = ChannelParams {
		channel_id,
		holder: params_a.counterparty.clone(),
		counterparty: params_a.holder.clone(),
		is_outbound_from_holder: false,
		commitment_format: crate::ln::chan_utils::CommitmentFormat::DefaultSegwit,
	};

	let point_a0 = build_commitment_point(secp_ctx, &signer_a.commitment_seed, INITIAL_COMMITMENT_NUMBER);
	let point_b0 = build_commitment_point(secp_ctx, &signer_b.commitment_seed, INITIAL_COMMITMENT_NUMBER);
	let point_a1 =
		build_commitment_point(secp_ctx, &signer_a.commitment_seed, INITIAL_COMMITMENT_NUMBER - 1);
	let point_b1 =
		build_commitment_point(secp_ctx, &signer_b.commitment_seed, INITIAL_COMMITMENT_NUMBER - 1);

	let spec_a = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw: 1000,
		to_local_msat: to_a_msat,
		to_remote_msat: to_b_msat,
	};
	let spec_b = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw: 1000,
		to_local_msat: to_b_msat,
		to_remote_msat: to_a_msat,
	};

	let build_side = |params: &ChannelParams,
	                  own_spec: &CommitmentSpec,
	                  own_point: &PublicKey,
	                  their_point: &PublicKey,
	                  their_signer: &InMemorySigner|
	 -> Commitment {
		let tx_params = crate::ln::chan_utils::ChannelTransactionParameters {
			holder_pubkeys: params.holder.pubkeys.clone(),
			holder_selected_contest_delay: params.holder.to_self_delay,
			holder_dust_limit_satoshis: params.holder.dust_limit_satoshis,
			counterparty_pubkeys: params.counterparty.pubkeys.clone(),
			counterparty_selected_contest_delay: params.counterparty.to_self_delay,
			counterparty_dust_limit_satoshis: params.counterparty.dust_limit_satoshis,
			is_outbound_from_holder: params.is_outbound_from_holder,
			funding_outpoint,
			channel_value_satoshis: capacity_satoshis,
			commitment_format: params.commitment_format,
		};

		let (local_tx, _) =
			build_commitment_transaction(true, 0, own_spec, own_point, &tx_params, secp_ctx);
		let counterparty_sig = local_tx.built_transaction().sign(
			&their_signer.funding_key,
			&tx_params.make_funding_redeemscript(),
			capacity_satoshis,
			secp_ctx,
		);
		let (remote_tx, _) =
			build_commitment_transaction(false, 0, own_spec, their_point, &tx_params, secp_ctx);

		Commitment {
			funding_tx_index: 0,
			funding_outpoint,
			capacity_satoshis,
			funding_status: FundingStatus::Confirmed,
			local_commit: LocalCommit {
				index: 0,
				spec: own_spec.clone(),
				commit_tx: HolderCommitmentTransaction::new(
					local_tx,
					counterparty_sig,
					Vec::new(),
					&params.holder.pubkeys.funding_pubkey,
					&params.counterparty.pubkeys.funding_pubkey,
				),
			},
			remote_commit: RemoteCommit {
				index: 0,
				spec: own_spec.clone(),
				txid: remote_tx.txid(),
				remote_per_commitment_point: *their_point,
			},
			next_remote_commit: None,
		}
	};

	let commitment_a = build_side(&params_a, &spec_a, &point_a0, &point_b0, &signer_b);
	let commitment_b = build_side(&params_b, &spec_b, &point_b0, &point_a0, &signer_a);

	let set_a = CommitmentSet::new(params_a, commitment_a, point_b1);
	let set_b = CommitmentSet::new(params_b, commitment_b, point_a1);
	(set_a, signer_a, set_b, signer_b)
}

/// A wallet UTXO ready to contribute to an interactive transaction.
pub fn wallet_input(value_satoshis: u64, tag: u8) -> FundingTxInput {
	let mut spk = vec![0x00, 0x14];
	spk.extend_from_slice(&[tag; 20]);
	let prevtx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: BitcoinOutPoint { txid: Txid::from_byte_array([tag; 32]), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(value_satoshis),
			script_pubkey: ScriptBuf::from(spk),
		}],
	};
	FundingTxInput {
		input: TxIn {
			previous_output: BitcoinOutPoint { txid: prevtx.compute_txid(), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		},
		prev_output: prevtx.output[0].clone(),
		prevtx,
	}
}
