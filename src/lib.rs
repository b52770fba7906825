// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Core subsystems of a batch workload manager for HPC clusters.
//!
//! This crate provides the two performance-critical pieces that run on every
//! cluster: [`iomux`], the per-node stdio multiplexer that splices task
//! stdin/stdout/stderr between local pipes and remote interactive clients,
//! and [`gang`], the controller-side gang scheduler that time-slices jobs
//! within partitions and preempts across partitions by priority.
//!
//! Placement, fair-share, accounting, and the RPC surface live elsewhere;
//! both subsystems reach those collaborators through narrow traits.

#[macro_use]
extern crate log;

pub mod collections;
pub mod config;
pub mod gang;
pub mod iomux;
pub mod runtime;

/// Asserts that two expressions are equal, bailing out of the calling
/// function with an [`anyhow::Error`] on mismatch. Only meant for tests.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        r#"ensure failed: `(left == right)`
  left: `{:?}`,
 right: `{:?}`"#,
                        left_val,
                        right_val
                    )
                }
            },
        }
    }};
}
