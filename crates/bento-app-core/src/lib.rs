// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for Bento tools.
//! Keeps runtime adapters thin and storage-agnostic.

pub mod config;
