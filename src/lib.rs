//! # cryo_daq Core Library
//!
//! This crate is the core library for the `cryo_daq` application: a
//! headless data-acquisition and sequencing system for lock-in amplifiers
//! and a PPMS cryostat/magnet controller. The binary (`main.rs`) is a thin
//! CLI over this library, so the same logic can back other frontends.
//!
//! ## Crate Structure
//!
//! - **`config`**: structures for loading and validating application
//!   configuration from TOML files. See [`config::Settings`].
//! - **`error`**: the central [`error::DaqError`] enum used across the
//!   application.
//! - **`link`**: ASCII command/response links to instruments: the serial
//!   implementation plus the mocks and the register-level simulator.
//! - **`lockin`**: lock-in amplifier device models behind the
//!   [`lockin::Lockin`] capability trait, the discrete register ladders,
//!   and the closed-loop sensitivity range controller.
//! - **`ppms`**: the controller device model. The vendor SDK stays behind
//!   the [`ppms::PpmsClient`] trait; [`ppms::Ppms`] adds unit conversion
//!   and magnet limits.
//! - **`sequencer`**: ordered temperature/field/wait/shutdown step
//!   execution on a background worker, with completion polling and abort.
//! - **`acquisition`**: the per-tick polling loop, the fixed column
//!   schema, and the results sinks (CSV, in-memory).

pub mod acquisition;
pub mod config;
pub mod error;
pub mod link;
pub mod lockin;
pub mod ppms;
pub mod sequencer;
