/*
 * Copyright (c) Kronoa Source Control Team and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Leased exclusive lock (`spec.md` §4.J/§5).
//!
//! Exactly one holder of `.lock` may run an admin operation
//! (stage/deploy/reject/set_staging_pointer/flatten/gc) at a time. The
//! lease is implemented entirely over [`kronoa_backend::Blobstore::create_if_absent`]
//! and [`kronoa_backend::Blobstore::conditional_write`] — there is no
//! dedicated `acquire_lock` backend method, since every adapter already
//! exposes the two primitives the state machine needs.

mod clock;
mod lease;

pub use clock::{Clock, SystemClock};
pub use lease::{Lease, LeaseState};
