/*
 * CloudOps - Pipeline Controller for Jenkins and Kubernetes
 * Copyright (C) 2025 CloudOps team
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

//! Pipeline controller core library
//!
//! Turns declarative pipeline configs into Jenkins jobs and the Kubernetes
//! workload, Service and Ingress that serve the built image, keeps both in
//! step across create/update/delete, and tracks builds to completion.

pub mod advisory;
pub mod api;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod error;
pub mod jenkins;
pub mod model;
pub mod naming;
pub mod reconcile;
pub mod store;
pub mod templates;
pub mod tracker;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use model::{BuildStatus, JobRecord, PipelineConfig};
pub use naming::JobNameValidator;
pub use reconcile::{EngineContext, EngineSettings, ReconciliationEngine};
