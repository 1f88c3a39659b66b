// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy module - forwarding opaque requests to worker endpoints.

pub mod http;
pub mod mock;
mod traits;

pub use http::{HttpProxyClient, HttpProxyConfig};
pub use mock::{MockProxy, MockReply};
pub use traits::*;
