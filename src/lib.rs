// Copyright 2026 Unlist Contributors
// SPDX-License-Identifier: Apache-2.0

//! Unlist runtime library — automated data-broker scan and opt-out engine.
//!
//! This library crate exposes the core modules for integration testing.

pub mod broker;
pub mod cli;
pub mod config;
pub mod driver;
pub mod events;
pub mod job;
pub mod scheduler;
pub mod services;
pub mod vault;
