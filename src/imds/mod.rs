// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The Instance Metadata Service substrate: the link-local overlay network,
//! the resolver deciding how the in-process metadata backend is reached from
//! that network, and the supervisor of the shared reverse-proxy container
//! answering `169.254.169.254` for every pseudo-instance.

pub mod backend;
pub mod network;
pub mod proxy;

pub use backend::{resolve_backend, BackendEndpoint};
pub use network::{ensure_network, resolved_network_name};
pub use proxy::ImdsProxy;
