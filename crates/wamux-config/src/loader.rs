// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered configuration loading with Figment.
//!
//! Lookup order: `/etc/wamux/wamux.toml` < `~/.config/wamux/wamux.toml` <
//! `./wamux.toml` < `WAMUX_*` environment variables.

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::WamuxConfig;

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/wamux/wamux.toml";

/// Config file name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "wamux.toml";

/// Top-level sections reachable through `WAMUX_<SECTION>_<KEY>` variables.
///
/// `[[queues]]` is an array of tables and can only be set from files.
const ENV_SECTIONS: &[&str] = &[
    "rate_limit",
    "reconnect",
    "checkpoint",
    "breaker",
    "metrics",
    "health",
    "pool",
    "log",
];

/// Path of the per-user config file, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wamux").join(LOCAL_CONFIG_FILE))
}

/// Load configuration from the standard hierarchy with env var overrides.
pub fn load_config() -> Result<WamuxConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string on top of the compiled defaults.
///
/// Environment variables are not consulted.
pub fn load_config_from_str(toml_content: &str) -> Result<WamuxConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(WamuxConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from an explicit file, with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<WamuxConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(WamuxConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// The full layered figment, before extraction.
pub fn build_figment() -> Figment {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(WamuxConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH));
    if let Some(user) = user_config_path() {
        figment = figment.merge(Toml::file(user));
    }
    figment
        .merge(Toml::file(LOCAL_CONFIG_FILE))
        .merge(env_provider())
}

/// Maps `WAMUX_RATE_LIMIT_MAX_PER_WINDOW` to `rate_limit.max_per_window`.
///
/// Uses an explicit section table instead of `Env::split("_")` because both
/// section and key names contain underscores.
fn env_provider() -> Env {
    Env::prefixed("WAMUX_").map(|key| map_env_key(key.as_str()).into())
}

pub(crate) fn map_env_key(key: &str) -> String {
    for section in ENV_SECTIONS {
        if let Some(rest) = key
            .strip_prefix(section)
            .and_then(|rest| rest.strip_prefix('_'))
            && !rest.is_empty()
        {
            return format!("{section}.{rest}");
        }
    }
    key.to_string()
}
