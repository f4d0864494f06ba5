// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod capture;
pub mod event_bus;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod kubectl;
pub mod link_resolver;
pub mod result_tree;
pub mod signal_store;

pub use event_bus::EventBus;
