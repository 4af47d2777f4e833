/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Buffered editing session / transaction engine (`spec.md` §4.G).
//!
//! A session is created in one of five modes (production, staging,
//! editing, submitted, a named-edition preview). In editing mode, writes
//! and deletes are buffered in memory until `commit`; outside a
//! transaction, a single write/delete auto-commits immediately.

mod session;
mod types;

pub use session::{ReadonlyOpen, Session};
pub use types::{PendingEntry, PendingRecord, PointerBlob, SessionMode, StatStatus, WorkingRecord};
