// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{collections::HashMap, sync::RwLock};

use bollard::{models::Network, network::CreateNetworkOptions};
use lazy_static::lazy_static;
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{IMDS_NETWORK, IMDS_SUBNET},
    engine::EngineClient,
    error::ExecutorError,
};

lazy_static! {
    // The one piece of process-wide state: the name the IMDS overlay network
    // actually goes by. Another process may have created the subnet under a
    // different name, in which case that name is adopted and every executor
    // in this process must converge on it.
    static ref RESOLVED_IMDS_NETWORK: RwLock<Option<String>> = RwLock::new(None);
}

/// The overlay network name currently in effect: the adopted name if one was
/// resolved, the canonical name otherwise.
pub fn resolved_network_name() -> String {
    RESOLVED_IMDS_NETWORK
        .read()
        .unwrap()
        .clone()
        .unwrap_or_else(|| IMDS_NETWORK.to_string())
}

fn set_resolved(name: &str) {
    *RESOLVED_IMDS_NETWORK.write().unwrap() = Some(name.to_string());
}

/// Idempotently brings up the IMDS overlay network and returns its resolved
/// name.
///
/// The network is never removed once it exists: it is shared by every
/// executor on the machine, across processes, and recreating it would detach
/// live proxies.
pub async fn ensure_network(
    engine: &EngineClient,
    cancel: &CancellationToken,
) -> Result<String, ExecutorError> {
    let name = resolved_network_name();
    match engine.inspect_network(&name, cancel).await {
        Ok(_) => {
            set_resolved(&name);
            debug!("IMDS network {} already exists", name);
            return Ok(name);
        },
        Err(err) if err.is_not_found() => {},
        Err(err) => return Err(err),
    }

    let mut subnet = HashMap::new();
    subnet.insert("Subnet".to_string(), IMDS_SUBNET.to_string());
    let options = CreateNetworkOptions {
        name: IMDS_NETWORK.to_string(),
        check_duplicate: true,
        driver: "bridge".to_string(),
        internal: false,
        attachable: false,
        ingress: false,
        ipam: bollard::models::Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![subnet]),
            options: None,
        },
        enable_ipv6: false,
        options: Default::default(),
        labels: Default::default(),
    };
    match engine.create_network(options, cancel).await {
        Ok(res) => {
            if let Some(id) = &res.id {
                info!("IMDS network {} (id:{}) created", IMDS_NETWORK, id);
            }
            if let Some(warning) = res.warning {
                warn!("Creating {} network had warnings: {}", IMDS_NETWORK, warning);
            }
            set_resolved(IMDS_NETWORK);
            Ok(IMDS_NETWORK.to_string())
        },
        Err(err) if err.is_conflict() => {
            // Lost the race against another process; the canonical network
            // now exists.
            set_resolved(IMDS_NETWORK);
            Ok(IMDS_NETWORK.to_string())
        },
        Err(err) if err.is_pool_overlap() => adopt_existing(engine, cancel).await,
        Err(err) => Err(err),
    }
}

/// The link-local subnet already belongs to a network created under another
/// name. Find it and adopt that name.
async fn adopt_existing(
    engine: &EngineClient,
    cancel: &CancellationToken,
) -> Result<String, ExecutorError> {
    let networks = engine.list_networks(cancel).await?;
    for network in networks {
        if !owns_imds_subnet(&network) {
            continue;
        }
        if let Some(name) = network.name {
            info!("Adopting existing network {} for the IMDS subnet", name);
            set_resolved(&name);
            return Ok(name);
        }
    }
    Err(ExecutorError::ImdsNetwork(format!(
        "subnet {} overlaps an existing pool but no network owns it",
        IMDS_SUBNET
    )))
}

fn owns_imds_subnet(network: &Network) -> bool {
    network
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.config.as_ref())
        .map_or(false, |configs| {
            configs
                .iter()
                .any(|config| config.get("Subnet").map(String::as_str) == Some(IMDS_SUBNET))
        })
}

/// Reads the first IPv4 gateway of a network's IPAM configuration.
pub(crate) fn ipam_gateway(network: &Network) -> Option<String> {
    network
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.config.as_ref())
        .and_then(|configs| {
            configs
                .iter()
                .find_map(|config| config.get("Gateway").filter(|gw| !gw.is_empty()).cloned())
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn network_with(config: Vec<HashMap<String, String>>) -> Network {
        Network {
            name: Some("some-net".to_string()),
            ipam: Some(bollard::models::Ipam {
                driver: Some("default".to_string()),
                config: Some(config),
                options: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn subnet_match_requires_the_link_local_pool() {
        let mut config = HashMap::new();
        config.insert("Subnet".to_string(), IMDS_SUBNET.to_string());
        assert!(owns_imds_subnet(&network_with(vec![config])));

        let mut config = HashMap::new();
        config.insert("Subnet".to_string(), "172.18.0.0/16".to_string());
        assert!(!owns_imds_subnet(&network_with(vec![config])));
        assert!(!owns_imds_subnet(&network_with(vec![])));
        assert!(!owns_imds_subnet(&Network::default()));
    }

    #[test]
    fn gateway_extraction_skips_empty_entries() {
        let mut first = HashMap::new();
        first.insert("Gateway".to_string(), "".to_string());
        let mut second = HashMap::new();
        second.insert("Gateway".to_string(), "169.254.169.1".to_string());
        let network = network_with(vec![first, second]);
        assert_eq!(ipam_gateway(&network), Some("169.254.169.1".to_string()));
        assert_eq!(ipam_gateway(&Network::default()), None);
    }

    #[test]
    fn resolved_name_defaults_to_canonical_and_sticks() {
        // Single test for the cell: tests run concurrently and the cell is
        // process-wide, so the default and the update are asserted together.
        assert_eq!(resolved_network_name(), IMDS_NETWORK);
        set_resolved("adopted-imds");
        assert_eq!(resolved_network_name(), "adopted-imds");
        set_resolved(IMDS_NETWORK);
    }
}
