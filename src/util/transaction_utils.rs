// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::transaction::TxOut;

use core::cmp::Ordering;

/// Sorts transaction outputs in the canonical commitment order: ascending value, then ascending
/// lexicographic script. `tie_breaker` decides between outputs whose value and script both match
/// (only possible for HTLC outputs, which break the tie on CLTV expiry).
pub(crate) fn sort_outputs<T, C: Fn(&T, &T) -> Ordering>(
	outputs: &mut Vec<(TxOut, T)>, tie_breaker: C,
) {
	outputs.sort_unstable_by(|a, b| {
		a.0.value.cmp(&b.0.value).then_with(|| {
			a.0.script_pubkey[..]
				.cmp(&b.0.script_pubkey[..])
				.then_with(|| tie_breaker(&a.1, &b.1))
		})
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::amount::Amount;
	use bitcoin::script::{Builder, ScriptBuf};
	use bitcoin::transaction::TxOut;

	#[test]
	fn sort_output_by_value() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(99),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| {
			unreachable!();
		});

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_by_script_pubkey() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(3).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(1).push_int(2).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| {
			unreachable!();
		});

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_by_bip_test() {
		let txout1 = TxOut {
			value: Amount::from_sat(100000000),
			script_pubkey: script_from_hex("41046a0765b5865641ce08dd39690aade26dfbf5511430ca428a3089261361cef170e3929a68aee3d8d4848b0c5111b0a37b82b86ad559fd2a745b44d8e8d9dfdc0cac"),
		};
		let txout1_ = txout1.clone();

		// doesn't deserialize cleanly:
		let txout2 = TxOut {
			value: Amount::from_sat(2400000000),
			script_pubkey: script_from_hex("41044a656f065871a353f216ca26cef8dde2f03e8c16202d2e8ad769f02032cb86a5eb5e56842e92e19141d60a01928f8dd2c875a390f67c1f6c94cfc617c0ea45afac"),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| {
			unreachable!();
		});

		assert_eq!(&outputs, &vec![(txout1_, "ignore"), (txout2_, "ignore")]);
	}

	#[test]
	fn sort_output_tie_breaker_test() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(1).push_int(2).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = txout1.clone();
		let txout2_ = txout1.clone();

		let mut outputs = vec![(txout1, 420), (txout2, 69)];
		sort_outputs(&mut outputs, |a, b| a.cmp(b));

		assert_eq!(&outputs, &vec![(txout2_, 69), (txout1_, 420)]);
	}

	fn script_from_hex(hex_str: &str) -> ScriptBuf {
		ScriptBuf::from(::hex::decode(hex_str).unwrap())
	}
}
