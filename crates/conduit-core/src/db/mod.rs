// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel, peer, and transfer rows.
//!
//! Like the operation DAO, every function takes a `&mut SqliteConnection` so the
//! handlers can compose them with ledger and operation writes inside one
//! transaction.

pub mod channels;
pub mod peers;
pub mod transfers;
