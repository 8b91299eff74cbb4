// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retrying failed tests.
//!
//! The main structure in this module is [`RetryOrchestrator`].

mod config;
mod imp;
mod substitution;
mod template;

pub use config::*;
pub use imp::*;
pub use substitution::*;
pub use template::*;
