// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key-value checkpoint store contract (Redis-like get/set/expire).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::WamuxError;

/// Black-box key-value store used to checkpoint session snapshots and
/// credential challenges across process restarts.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the value stored at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, WamuxError>;

    /// Stores `value` at `key`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), WamuxError>;

    /// Removes `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), WamuxError>;
}
