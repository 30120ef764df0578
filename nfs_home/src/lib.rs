// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod config;
pub mod plan;
pub mod reconcile;
pub mod role;

mod error;

pub use error::{Error, Result};
