// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor module - worker process lifecycle backends.

pub mod mock;
pub mod native;
mod traits;

pub use mock::MockSupervisor;
pub use native::{NativeSupervisor, NativeSupervisorConfig};
pub use traits::*;
