// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_runtime;
pub mod barrier;
pub mod collector;
pub mod node_selector;
pub mod orchestrator;
pub mod provisioner;
pub mod report;
pub mod roles;

// Re-export use cases for convenience
pub use agent_runtime::{AgentReport, AgentRuntime};
pub use orchestrator::{ExperimentOrchestrator, ExperimentPlan};
pub use report::RunReport;
