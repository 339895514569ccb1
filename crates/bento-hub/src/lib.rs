// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Headless Bento hub: hosts one box behind a Unix socket.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

pub mod demo;
pub mod prefs;
pub mod server;

pub use prefs::{Args, HostPrefs};
pub use server::Hub;
