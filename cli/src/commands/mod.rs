// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for netcap CLI

pub mod agent;
pub mod config;
pub mod run;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::run::RunArgs;
