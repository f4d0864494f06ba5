// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! netcap core
//!
//! Orchestrates a distributed packet-capture experiment: picks nodes,
//! provisions Producer/Consumer/Observer agents, drives them through a
//! start/stop barrier and pulls every node's artifacts into one result tree.
//!
//! # Architecture
//!
//! - **domain:** experiment aggregate, errors, config, ports
//! - **application:** node selector, provisioner, barrier, agent runtime, collector, orchestrator
//! - **infrastructure:** kubectl adapter, signal stores, sysfs link resolver, tcpdump launcher, event bus, fakes (behind `test-support`)

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
