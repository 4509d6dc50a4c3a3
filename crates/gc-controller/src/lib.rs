/*
 * 5D Labs Platform - Policy-driven Garbage Collection Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Garbage collection controller library
//!
//! Operators declare `GarbageCollectionPolicy` objects describing which resources
//! to watch, when they expire and how fast they may be deleted. This crate holds
//! the evaluation engine (TTL, matching, rate limiting, retrying deletes), the
//! per-policy watch registry and the reconciliation loop that ties them together.

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crds;
pub mod evaluation;
pub mod fieldpath;
pub mod leader;
pub mod matcher;
pub mod rate_limit;
pub mod registry;
pub mod ttl;
pub mod types;
pub mod watch;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use controller::{reconcile, run_controller, Context, Reconciler};
pub use crds::{GarbageCollectionPolicy, GarbageCollectionPolicySpec, GarbageCollectionPolicyStatus};
pub use evaluation::{EvaluationResult, Evaluator};
pub use registry::PolicyRegistry;
pub use types::{Error, Result};
