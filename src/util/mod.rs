// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Some utility modules live here. See individual sub-modules for more info.

#[macro_use]
pub(crate) mod macro_logger;
#[macro_use]
pub(crate) mod ser_macros;

// These have to come after the macro modules to build
pub mod logger;
pub mod ser;

pub(crate) mod byte_utils;
pub(crate) mod transaction_utils;

#[cfg(any(test, feature = "_test_utils"))]
pub mod test_utils;
