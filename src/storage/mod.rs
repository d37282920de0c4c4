// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local persistence: the SQLite store and the row model it speaks.

pub mod sql;
mod row;

pub use row::{check_identifier, json_id, Row, RowExt, StorageError};
pub use sql::{SqlStore, StoreTx, TxFuture, CACHE_TABLES, RECORD_TABLES};
