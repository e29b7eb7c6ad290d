// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The executor: owns the per-process substrate (main volume + main
//! container), brings up the shared IMDS machinery, and exposes the
//! instance and volume lifecycles (implemented in `instances.rs` and
//! `volumes.rs`).

use std::collections::HashMap;

use bollard::{
    container::Config,
    models::{HostConfig, Mount, MountTypeEnum},
    network::CreateNetworkOptions,
};
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        ExecutorOptions,
        RuntimeMode,
        MAIN_COMMAND,
        MAIN_IMAGE,
        MAIN_MOUNT,
        MAIN_NAME_PREFIX,
        MAIN_VOLUME_SUFFIX,
    },
    engine::EngineClient,
    error::ExecutorError,
    ids,
    imds::{self, ImdsProxy},
    labels,
    models::ContainerId,
};

/// A running executor: one main substrate plus a share of the IMDS overlay
/// and proxy. Executors on the same engine cooperate through labels; nothing
/// is cached in-process, so a crashed executor leaves nothing to reconcile
/// beyond its engine objects.
pub struct Executor {
    pub(crate) engine: EngineClient,
    pub(crate) runtime: RuntimeMode,
    pub(crate) overlay_network: String,
    pub(crate) instance_network: Option<String>,
    pub(crate) main_id: ContainerId,
    pub(crate) main_name: String,
    pub(crate) main_volume: String,
    proxy: ImdsProxy,
}

impl Executor {
    /// Brings up the substrate for a new executor and returns the handle.
    ///
    /// Ordering matters: the overlay network must exist before the backend
    /// endpoint can be resolved, the main container must exist before the
    /// proxy is ensured (its labels are what the proxy routes by), and the
    /// proxy comes last so a failed bring-up never leaves instances without
    /// metadata.
    pub async fn new(
        options: ExecutorOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, ExecutorError> {
        options.validate()?;
        let engine = EngineClient::connect()?;
        engine.ping(cancel).await?;
        debug!("Using Docker client version {}", engine.version());

        let overlay_network = imds::ensure_network(&engine, cancel).await?;
        let backend = imds::resolve_backend(&engine, options.imds_backend_port, cancel).await?;

        let suffix = ids::unique_suffix();
        let main_name = format!("{}{}", MAIN_NAME_PREFIX, suffix);
        let main_volume = format!("{}{}", main_name, MAIN_VOLUME_SUFFIX);
        engine.create_volume(&main_volume, cancel).await?;
        engine.pull_image(MAIN_IMAGE, cancel).await?;

        let instance_network = options.explicit_instance_network().map(str::to_string);
        let mut main_labels = HashMap::new();
        main_labels.insert(labels::MAIN.to_string(), "true".to_string());
        main_labels.insert(labels::IMDS_BACKEND_HOST.to_string(), backend.host.clone());
        main_labels.insert(
            labels::IMDS_BACKEND_PORT.to_string(),
            backend.port.to_string(),
        );
        if let Some(network) = &instance_network {
            main_labels.insert(labels::INSTANCE_NETWORK.to_string(), network.clone());
        }
        let config = Config::<String> {
            image: Some(MAIN_IMAGE.to_string()),
            cmd: Some(MAIN_COMMAND.iter().map(|s| s.to_string()).collect()),
            labels: Some(main_labels),
            host_config: Some(HostConfig {
                privileged: Some(true),
                auto_remove: Some(true),
                mounts: Some(vec![main_volume_mount(&main_volume)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = engine.create_container(&main_name, config, cancel).await?;
        engine.start_container(&main_name, cancel).await?;
        info!("Main container {} started (id {})", main_name, created.id);

        if let Some(network) = &instance_network {
            ensure_instance_network(&engine, network, cancel).await?;
        }

        let proxy = ImdsProxy::new(engine.clone(), options.proxy_image(), backend.mode);
        proxy.ensure(cancel).await?;

        Ok(Self {
            engine,
            runtime: backend.mode,
            overlay_network,
            instance_network,
            main_id: ContainerId::from(created.id),
            main_name,
            main_volume,
            proxy,
        })
    }

    /// The ID of this executor's main container; instances carry it as their
    /// `dc2:imds-owner` label.
    pub fn main_container_id(&self) -> &ContainerId {
        &self.main_id
    }

    /// Tears the executor's substrate down. Every step runs regardless of
    /// earlier failures and "not found" is never an error: `close` may race
    /// other executors and may run after a partial bring-up.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        let mut errors: Vec<String> = Vec::new();
        let mut keep = |result: Result<(), ExecutorError>| {
            if let Err(err) = result {
                if !err.is_not_found() {
                    errors.push(err.chained_message());
                }
            }
        };

        keep(
            self.engine
                .remove_container(self.main_name.as_str(), true, cancel)
                .await,
        );
        keep(self.engine.remove_volume(&self.main_volume, cancel).await);
        keep(
            self.proxy
                .remove_if_unused(self.main_id.as_str(), cancel)
                .await,
        );
        if let Some(network) = &self.instance_network {
            keep(self.remove_owned_network(network, cancel).await);
        }

        if errors.is_empty() {
            info!("Executor {} closed", self.main_name);
            Ok(())
        } else {
            Err(ExecutorError::Shutdown(errors))
        }
    }

    /// The sorted instance IDs of every enabled instance owned by this
    /// executor.
    pub async fn list_owned_instances(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ExecutorError> {
        let filters = labels::filter_many(&[
            (labels::ENABLED, "true"),
            (labels::IMDS_OWNER, self.main_id.as_str()),
        ]);
        let containers = self.engine.list_containers(filters, cancel).await?;
        let mut instance_ids: Vec<String> = containers
            .into_iter()
            .filter_map(|container| {
                container
                    .labels
                    .and_then(|container_labels| container_labels.get(labels::INSTANCE_ID).cloned())
            })
            .collect();
        instance_ids.sort();
        Ok(instance_ids)
    }

    /// Removes the configured instance network when this executor owns it
    /// and no other executor still references it.
    async fn remove_owned_network(
        &self,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let inspected = match self.engine.inspect_network(network, cancel).await {
            Ok(inspected) => inspected,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let owned = inspected
            .labels
            .as_ref()
            .and_then(|network_labels| network_labels.get(labels::OWNED_NETWORK))
            .map(String::as_str)
            == Some("true");
        if !owned {
            debug!("Instance network {} is not owned; leaving it", network);
            return Ok(());
        }

        let mains = self
            .engine
            .list_containers(labels::filter(labels::MAIN, "true"), cancel)
            .await?;
        let still_referenced = mains.iter().any(|main| {
            main.id.as_deref() != Some(self.main_id.as_str())
                && main
                    .labels
                    .as_ref()
                    .and_then(|main_labels| main_labels.get(labels::INSTANCE_NETWORK))
                    .map(String::as_str)
                    == Some(network)
        });
        if still_referenced {
            debug!("Instance network {} is still referenced; leaving it", network);
            return Ok(());
        }

        match self.engine.remove_network(network, cancel).await {
            Ok(()) => {
                info!("Instance network {} removed", network);
                Ok(())
            },
            Err(err) if err.is_not_found() || err.is_active_endpoints() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// The mount exposing the main volume's backing files to a container.
pub(crate) fn main_volume_mount(volume_name: &str) -> Mount {
    Mount {
        target: Some(MAIN_MOUNT.to_string()),
        source: Some(volume_name.to_string()),
        typ: Some(MountTypeEnum::VOLUME),
        ..Default::default()
    }
}

/// Creates the explicit instance network if it does not exist yet, labelled
/// as owned so teardown knows it may be reclaimed.
async fn ensure_instance_network(
    engine: &EngineClient,
    network: &str,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    match engine.inspect_network(network, cancel).await {
        Ok(_) => {
            debug!("Instance network {} already exists", network);
            return Ok(());
        },
        Err(err) if err.is_not_found() => {},
        Err(err) => return Err(err),
    }
    let mut network_labels = HashMap::new();
    network_labels.insert(labels::OWNED_NETWORK.to_string(), "true".to_string());
    let options = CreateNetworkOptions {
        name: network.to_string(),
        check_duplicate: true,
        driver: "bridge".to_string(),
        internal: false,
        attachable: false,
        ingress: false,
        ipam: Default::default(),
        enable_ipv6: false,
        options: Default::default(),
        labels: network_labels,
    };
    match engine.create_network(options, cancel).await {
        Ok(res) => {
            if let Some(id) = &res.id {
                info!("Instance network {} (id:{}) created", network, id);
            }
            Ok(())
        },
        // Another executor created it between the inspect and the create.
        Err(err) if err.is_conflict() => Ok(()),
        Err(err) => Err(err),
    }
}
