// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_channel"]

//! A payment-channel commitment engine, in library form.
//!
//! This crate maintains the bilateral state of a two-party off-chain channel: it constructs and
//! signs every transaction which may ever be broadcast from the channel (commitment transactions,
//! second-stage HTLC transactions, third-stage delayed claims, and penalty transactions), drives
//! the HTLC update protocol and the interactive funding protocol used for dual-funded opens,
//! splices and RBF, and reacts to whichever commitment transaction ends up confirmed on chain.
//!
//! There is no built-in networking, routing, wallet or storage - peers hand us messages, we hand
//! back messages, and collaborators are reached through the traits in [`chain`] and [`sign`].
//! This makes the crate a good candidate for tight integration into an existing node rather than
//! being a rather-separate lightning appendage.

#![cfg_attr(not(any(test, feature = "_test_utils")), deny(missing_docs))]
#![cfg_attr(not(any(test, feature = "_test_utils")), forbid(unsafe_code))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![allow(ellipsis_inclusive_range_patterns)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate bitcoin;
#[cfg(test)]
extern crate hex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
pub mod sign;

/// Re-export of the `std::io` types the serialization framework is written against.
pub use std::io;
