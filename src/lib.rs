#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bydbox_lib
//!
//! This crate provides an asynchronous client for BYD Battery-Box storage systems.
//! It talks Modbus to the BMU gateway, decodes the BMU and per-tower BMS status,
//! retrieves and decodes the event log of every unit, tracks cell voltage extremes
//! and monitors the connection health.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bydbox`
//!   command-line tool.
//! - `bin-dependencies`: Enables everything required by the `bydbox` binary executable
//!   (command line parsing, logging backend, YAML configuration).
//!
//! ## Overview
//!
//! - [`transport`]: the register transport with retry and reconnect.
//! - [`client::BydBox`]: the public operations, `initialize`, `poll_status`, `poll_log`, ...
//! - [`status`], [`logbook`], [`log_codec`]: decoders for status blocks and log entries.
//! - [`history`], [`health`]: cell voltage extremes and connection quality.

/// Contains error types for the library.
mod error;

pub mod client;
/// Conversions of raw register words and payload bytes.
pub mod codec;
pub mod health;
pub mod history;
/// Per-code decoders of log payloads.
pub mod log_codec;
pub mod logbook;
/// Register map, device information and vendor label tables.
pub mod protocol;
pub mod snapshot;
pub mod status;
pub mod transport;

pub use client::BydBox;
pub use error::{Error, Result};
