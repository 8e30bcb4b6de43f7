// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Traits for the collaborators the orchestrator drives but does not implement.
//!
//! All traits use `#[async_trait]` for dynamic dispatch compatibility.

pub mod client;
pub mod kv;

pub use client::{ChatClient, ClientEvent, ClientEventKind, ClientEventSink, ClientHandle};
pub use kv::KvStore;
