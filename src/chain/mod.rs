// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow the channel engine to interact with the bitcoin blockchain:
//! fee estimation, transaction publication, chain watching, and the on-chain reaction to
//! force-closes.

pub mod chaininterface;
pub mod channelmonitor;
pub mod package;
pub mod transaction;
