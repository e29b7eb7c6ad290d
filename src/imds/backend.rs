// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Instant;

use bollard::models::EndpointSettings;
use log::*;
use nix::unistd::gethostname;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        RuntimeMode,
        GATEWAY_DEADLINE,
        GATEWAY_POLL_INTERVAL,
        HOST_DOCKER_INTERNAL,
    },
    engine::{sleep_or_cancelled, EngineClient},
    error::ExecutorError,
    imds::network::{ipam_gateway, resolved_network_name},
};

/// Where the IMDS backend (served by this process) can be reached from the
/// proxy container, and the runtime mode that implies.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: RuntimeMode,
}

/// Decides how the proxy reaches the metadata backend.
///
/// When the process itself runs inside a container (its hostname names an
/// engine container) the backend is reached over the overlay network, so
/// that container is connected to the overlay and its address there is the
/// backend host. Otherwise the backend listens on the host: on Linux that is
/// the overlay's gateway address, elsewhere the engine provides
/// `host.docker.internal`.
pub async fn resolve_backend(
    engine: &EngineClient,
    port: u16,
    cancel: &CancellationToken,
) -> Result<BackendEndpoint, ExecutorError> {
    let overlay = resolved_network_name();
    let hostname = gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let containerized = match RuntimeMode::from_env() {
        Some(RuntimeMode::Container) => true,
        Some(RuntimeMode::Host) => false,
        None => {
            !hostname.is_empty()
                && match engine.inspect_container(&hostname, cancel).await {
                    Ok(_) => true,
                    Err(err) if err.is_not_found() => false,
                    Err(err) => return Err(err),
                }
        },
    };

    if containerized {
        let host = own_overlay_address(engine, &hostname, &overlay, cancel).await?;
        info!("Running inside container {}; IMDS backend at {}:{}", hostname, host, port);
        return Ok(BackendEndpoint {
            host,
            port,
            mode: RuntimeMode::Container,
        });
    }

    let host = if cfg!(target_os = "linux") {
        overlay_gateway(engine, &overlay, cancel).await?
    } else {
        HOST_DOCKER_INTERNAL.to_string()
    };
    info!("IMDS backend reachable from the proxy at {}:{}", host, port);
    Ok(BackendEndpoint {
        host,
        port,
        mode: RuntimeMode::Host,
    })
}

/// Connect our own container to the overlay (idempotently) and return its
/// IPv4 address there.
async fn own_overlay_address(
    engine: &EngineClient,
    container: &str,
    overlay: &str,
    cancel: &CancellationToken,
) -> Result<String, ExecutorError> {
    match engine
        .connect_network(overlay, container, EndpointSettings::default(), cancel)
        .await
    {
        Ok(()) => debug!("Connected {} to {}", container, overlay),
        Err(err) if err.is_conflict() => {},
        Err(err) => return Err(err),
    }
    let inspect = engine.inspect_container(container, cancel).await?;
    inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|networks| networks.get(overlay).cloned())
        .and_then(|endpoint| endpoint.ip_address)
        .filter(|address| !address.is_empty())
        .ok_or_else(|| {
            ExecutorError::ImdsNetwork(format!(
                "container {} has no IPv4 address on {}",
                container, overlay
            ))
        })
}

/// Polls the overlay's IPAM gateway until it is known or the deadline runs
/// out. The address shows up a moment after network creation, hence the
/// polling.
async fn overlay_gateway(
    engine: &EngineClient,
    overlay: &str,
    cancel: &CancellationToken,
) -> Result<String, ExecutorError> {
    let deadline = Instant::now() + GATEWAY_DEADLINE;
    loop {
        match engine.inspect_network(overlay, cancel).await {
            Ok(network) => {
                if let Some(gateway) = ipam_gateway(&network) {
                    return Ok(gateway);
                }
            },
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => debug!("Gateway lookup on {} failed: {}", overlay, err.chained_message()),
        }
        if Instant::now() + GATEWAY_POLL_INTERVAL >= deadline {
            return Err(ExecutorError::GatewayTimeout);
        }
        sleep_or_cancelled(cancel, GATEWAY_POLL_INTERVAL).await?;
    }
}
