// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TLS-intercepting CONNECT proxy with passive HTTP message capture.
//!
//! The engine terminates a client's CONNECT tunnel with a leaf
//! certificate minted by a local root authority, opens a verified TLS
//! connection to the real origin, forwards every byte transparently, and
//! reassembles each direction's stream into discrete HTTP messages for
//! observation.

pub mod ca;
pub mod capture;
pub mod config;
pub mod error;
pub mod proxy;
pub mod reassembly;
pub mod rules;
pub mod scratch;
pub mod tunnel;
