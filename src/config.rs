// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! Executor options and the well-known constants of the substrate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::ExecutorError;

/// Image used for the per-executor main substrate container.
pub const MAIN_IMAGE: &str = "alpine:latest";
/// Command keeping the main container alive.
pub const MAIN_COMMAND: [&str; 2] = ["sleep", "infinity"];
/// Mountpoint of the main volume inside the main and instance containers.
pub const MAIN_MOUNT: &str = "/var/dc2";
/// Prefix of the main container name; a unique hex suffix is appended.
pub const MAIN_NAME_PREFIX: &str = "dc2-main-";
/// Suffix of the main volume name, appended to the main container name.
pub const MAIN_VOLUME_SUFFIX: &str = "-volume";
/// Prefix of instance container names; the instance ID is appended.
pub const INSTANCE_NAME_PREFIX: &str = "dc2-";
/// The engine's default bridge network, used when no instance network is
/// configured.
pub const DEFAULT_INSTANCE_NETWORK: &str = "bridge";

/// Canonical name of the IMDS overlay network. The name actually in use may
/// diverge when another process created the subnet first; see
/// [`crate::imds::network`].
pub const IMDS_NETWORK: &str = "dc2-imds";
/// The link-local subnet reserved for IMDS traffic.
pub const IMDS_SUBNET: &str = "169.254.169.0/24";
/// The fixed address of the IMDS proxy on the overlay.
pub const IMDS_PROXY_IP: &str = "169.254.169.254";
/// Well-known name of the shared IMDS proxy container.
pub const IMDS_PROXY_CONTAINER: &str = "dc2-imds-proxy";
/// Value of the `dc2:imds-proxy-version` label a healthy proxy must carry.
pub const IMDS_PROXY_VERSION: &str = "1";
/// Image run as the IMDS proxy unless overridden.
pub const DEFAULT_IMDS_PROXY_IMAGE: &str = "ghcr.io/dc2/imds-proxy:latest";
/// Routing configuration passed to the proxy image.
pub const IMDS_PROXY_COMMAND: [&str; 4] =
    ["--listen", "0.0.0.0:80", "--docker-socket", "/var/run/docker.sock"];

/// Environment variable overriding the proxy image.
pub const PROXY_IMAGE_ENV: &str = "DC2_IMDS_PROXY_IMAGE";
/// Environment variable carrying the runtime mode.
pub const RUNTIME_ENV: &str = "DC2_RUNTIME";
/// Engine socket bind-mounted into the proxy container.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";
/// Extra-host entry resolving the host gateway inside the proxy.
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal:host-gateway";
/// Backend host reported on engines that expose no bridge gateway.
pub const HOST_DOCKER_INTERNAL: &str = "host.docker.internal";

/// Overall budget for one `ensure` pass over the IMDS proxy.
pub const ENSURE_DEADLINE: Duration = Duration::from_secs(60);
/// Cadence of the proxy readiness probe.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff applied when the ensure loop hits a transient engine error.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Budget for resolving the overlay network's gateway address.
pub const GATEWAY_DEADLINE: Duration = Duration::from_secs(10);
/// Cadence of gateway resolution attempts.
pub const GATEWAY_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Number of log lines attached to proxy readiness failures.
pub const LOG_TAIL: &str = "50";

/// Where this process runs relative to the engine. Containerized deployments
/// reach the IMDS backend over the overlay network; host deployments reach it
/// through the engine's gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeMode {
    Host,
    Container,
}

impl RuntimeMode {
    /// The `DC2_RUNTIME=<mode>` entry stamped into container environments.
    pub fn env_entry(&self) -> String {
        format!("{}={}", RUNTIME_ENV, self)
    }

    /// Reads `DC2_RUNTIME` from the host environment, if set and valid.
    pub fn from_env() -> Option<RuntimeMode> {
        std::env::var(RUNTIME_ENV).ok().and_then(|v| v.parse().ok())
    }
}

/// Options accepted by [`crate::Executor::new`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorOptions {
    /// Port the IMDS backend listens on inside this process. Must be
    /// positive.
    pub imds_backend_port: u16,
    /// Network instance containers join. `None` (or the engine default)
    /// leaves instances on the default bridge.
    pub instance_network: Option<String>,
    /// Overrides the IMDS proxy image. The `DC2_IMDS_PROXY_IMAGE`
    /// environment variable takes precedence over this field.
    pub imds_proxy_image: Option<String>,
}

impl ExecutorOptions {
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.imds_backend_port == 0 {
            return Err(ExecutorError::InvalidRequest(
                "the IMDS backend port must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The instance network, if it is explicit and not the engine default.
    pub fn explicit_instance_network(&self) -> Option<&str> {
        self.instance_network
            .as_deref()
            .filter(|name| *name != DEFAULT_INSTANCE_NETWORK && !name.is_empty())
    }

    /// Resolves the proxy image: environment override, then the option, then
    /// the built-in default.
    pub fn proxy_image(&self) -> String {
        std::env::var(PROXY_IMAGE_ENV)
            .ok()
            .filter(|image| !image.is_empty())
            .or_else(|| self.imds_proxy_image.clone())
            .unwrap_or_else(|| DEFAULT_IMDS_PROXY_IMAGE.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_backend_port_is_rejected() {
        let options = ExecutorOptions::default();
        let err = options.validate().unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        let options = ExecutorOptions {
            imds_backend_port: 8090,
            ..Default::default()
        };
        options.validate().unwrap();
    }

    #[test]
    fn default_bridge_is_not_an_explicit_network() {
        let mut options = ExecutorOptions {
            imds_backend_port: 8090,
            instance_network: Some("bridge".to_string()),
            ..Default::default()
        };
        assert_eq!(options.explicit_instance_network(), None);
        options.instance_network = Some("my-net".to_string());
        assert_eq!(options.explicit_instance_network(), Some("my-net"));
        options.instance_network = None;
        assert_eq!(options.explicit_instance_network(), None);
    }

    #[test]
    fn runtime_mode_round_trips() {
        assert_eq!(RuntimeMode::Host.to_string(), "host");
        assert_eq!(RuntimeMode::Container.to_string(), "container");
        assert_eq!("host".parse::<RuntimeMode>().unwrap(), RuntimeMode::Host);
        assert_eq!(
            "container".parse::<RuntimeMode>().unwrap(),
            RuntimeMode::Container
        );
        assert!("vm".parse::<RuntimeMode>().is_err());
        assert_eq!(RuntimeMode::Host.env_entry(), "DC2_RUNTIME=host");
    }
}
