// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Wamux integration tests.
//!
//! Provides a scriptable mock chat client and an engine harness for fast,
//! deterministic tests without a real chat protocol.
//!
//! # Components
//!
//! - [`MockClient`] - Mock external client with failure scripting and callback injection
//! - [`TestHarness`] - Engine wired to a `MockClient` and an in-memory checkpoint store

pub mod harness;
pub mod mock_client;

pub use harness::{TestHarness, TestHarnessBuilder, drain_events};
pub use mock_client::{AutoConnect, MockClient, MockHandle, SentMessage};
