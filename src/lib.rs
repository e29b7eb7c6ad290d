// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The DC2 executor: an EC2-shaped compute control plane over a local Docker
//! engine.
//!
//! An [`Executor`] makes containers look and behave like cloud instances.
//! The XML front-end translates EC2 Query calls (`RunInstances`,
//! `DescribeInstances`, volume management and friends) into the methods on
//! [`Executor`]; this crate sequences the container-engine primitives those
//! calls need and keeps the surrounding substrate alive:
//!
//! * a per-executor **main container and volume** holding the sparse files
//!   that back volumes,
//! * the shared link-local **IMDS overlay network**, and
//! * the shared **IMDS proxy container** answering `169.254.169.254` for
//!   every pseudo-instance, reference-counted across executors and
//!   processes via labels.
//!
//! Nothing is cached in-process: every lifecycle decision is made against
//! label-scoped queries on the live engine, which keeps concurrent executors
//! (including ones in other processes) and crash recovery honest.

pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod imds;
pub mod labels;
pub mod models;

mod executor;
mod instances;
mod volumes;

pub use config::{ExecutorOptions, RuntimeMode};
pub use error::ExecutorError;
pub use executor::Executor;
pub use models::{
    ContainerId,
    InstanceDescription,
    InstanceState,
    InstanceStateChange,
    VolumeAttachment,
    VolumeDescription,
};
