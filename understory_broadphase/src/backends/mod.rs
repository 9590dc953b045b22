// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadphase engines.
//!
//! - [`Sap`]: incremental sweep-and-prune over three sorted endpoint axes. Cheap when
//!   boxes move a little per update.
//! - [`Mbp`]: box pruning inside user-provided regions. Scales with large sleeping
//!   populations and reports boxes outside every region.

pub(crate) mod mbp;
pub(crate) mod sap;

pub use mbp::{MAX_REGIONS, Mbp, MbpConfig, MbpPairFlags};
pub use sap::{Sap, SapConfig};
