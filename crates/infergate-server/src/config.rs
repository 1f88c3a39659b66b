// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the infergate gateway.

use std::net::SocketAddr;

use infergate_core::config::{ConfigError, parse_var};
use infergate_core::proxy::HttpProxyConfig;
use infergate_core::supervisor::NativeSupervisorConfig;
use infergate_core::{DispatchConfig, PoolConfig};

/// Gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway listens on.
    pub bind_addr: SocketAddr,
    /// Maximum inbound body size in bytes.
    pub max_body_bytes: usize,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Dispatcher and queue settings.
    pub dispatch: DispatchConfig,
    /// How worker processes are launched.
    pub supervisor: NativeSupervisorConfig,
    /// How requests reach the workers.
    pub proxy: HttpProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6006)),
            max_body_bytes: 32 * 1024 * 1024,
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            supervisor: NativeSupervisorConfig::default(),
            proxy: HttpProxyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_var(&lookup, "INFERGATE_BIND_ADDR", defaults.bind_addr)?,
            max_body_bytes: parse_var(&lookup, "INFERGATE_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            pool: PoolConfig::from_lookup(&lookup)?,
            dispatch: DispatchConfig::from_lookup(&lookup)?,
            supervisor: NativeSupervisorConfig::from_lookup(&lookup)?,
            proxy: HttpProxyConfig::from_lookup(&lookup)?,
        })
    }
}
