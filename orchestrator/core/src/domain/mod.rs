// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: experiment aggregate, error taxonomy, configuration schema
//! and the ports (cluster, signal store, link resolver, capture) the
//! application services are written against.

pub mod capture;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod events;
pub mod experiment;
pub mod layout;
pub mod link;
pub mod signal;
