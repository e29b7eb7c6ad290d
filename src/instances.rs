// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The pseudo-instance lifecycle: containers dressed up as EC2 instances.

use std::collections::HashMap;

use bollard::{
    container::Config,
    models::{ContainerInspectResponse, ContainerState, ContainerStateStatusEnum, EndpointSettings, HostConfig},
};
use chrono::{DateTime, Utc};
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::INSTANCE_NAME_PREFIX,
    error::ExecutorError,
    executor::{main_volume_mount, Executor},
    ids,
    labels,
    models::{normalize_architecture, InstanceDescription, InstanceState, InstanceStateChange},
};

impl Executor {
    /// Creates `count` pseudo-instances from `image` and returns their IDs
    /// in creation order.
    ///
    /// Instances run privileged: volume attachment binds loop devices inside
    /// the container, which plain containers may not do. A partial failure
    /// leaves the earlier instances running; they are discoverable through
    /// [`Executor::list_owned_instances`].
    pub async fn create_instances(
        &self,
        image: &str,
        instance_type: &str,
        count: usize,
        user_data: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ExecutorError> {
        if count == 0 {
            return Err(ExecutorError::InvalidRequest(
                "instance count must be positive".to_string(),
            ));
        }
        self.engine.pull_image(image, cancel).await?;

        let mut instance_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let instance_id = ids::instance_id();
            let container_name = format!("{}{}", INSTANCE_NAME_PREFIX, instance_id);

            let mut instance_labels = HashMap::new();
            instance_labels.insert(labels::ENABLED.to_string(), "true".to_string());
            instance_labels.insert(labels::INSTANCE_ID.to_string(), instance_id.clone());
            instance_labels.insert(labels::INSTANCE_TYPE.to_string(), instance_type.to_string());
            instance_labels.insert(labels::IMAGE_ID.to_string(), image.to_string());
            instance_labels.insert(labels::IMDS_OWNER.to_string(), self.main_id.to_string());
            if let Some(user_data) = user_data {
                instance_labels.insert(labels::USER_DATA.to_string(), user_data.to_string());
            }

            let config = Config::<String> {
                image: Some(image.to_string()),
                attach_stdin: Some(false),
                attach_stdout: Some(false),
                attach_stderr: Some(false),
                open_stdin: Some(true),
                tty: Some(true),
                env: Some(vec![self.runtime.env_entry()]),
                labels: Some(instance_labels),
                host_config: Some(HostConfig {
                    privileged: Some(true),
                    mounts: Some(vec![main_volume_mount(&self.main_volume)]),
                    network_mode: self.instance_network.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let created = self
                .engine
                .create_container(&container_name, config, cancel)
                .await?;
            match self
                .engine
                .connect_network(
                    &self.overlay_network,
                    &container_name,
                    EndpointSettings::default(),
                    cancel,
                )
                .await
            {
                Ok(()) => {},
                // Already connected; a retried create sequence lands here.
                Err(err) if err.is_conflict() => {},
                Err(err) => return Err(err),
            }
            self.engine.start_container(&container_name, cancel).await?;
            info!("Instance {} running (container {})", instance_id, created.id);
            instance_ids.push(instance_id);
        }
        Ok(instance_ids)
    }

    /// Describes the given instances. Unknown IDs produce no entry rather
    /// than an error, matching DescribeInstances semantics.
    pub async fn describe_instances(
        &self,
        instance_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceDescription>, ExecutorError> {
        let mut descriptions = Vec::new();
        for instance_id in instance_ids {
            let container_id = match self.find_instance(instance_id, cancel).await? {
                Some(container_id) => container_id,
                None => continue,
            };
            let inspect = match self.engine.inspect_container(&container_id, cancel).await {
                Ok(inspect) => inspect,
                // Removed between the lookup and the inspect.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            descriptions.push(self.describe_one(instance_id, inspect, cancel).await?);
        }
        Ok(descriptions)
    }

    pub async fn start_instances(
        &self,
        instance_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceStateChange>, ExecutorError> {
        let resolved = self.resolve_all(instance_ids, cancel).await?;
        let mut changes = Vec::with_capacity(resolved.len());
        for (instance_id, container_id) in resolved {
            let previous_state = self.instance_state(&container_id, cancel).await?;
            match self.engine.start_container(&container_id, cancel).await {
                Ok(()) => {},
                Err(err) if err.is_not_modified() => {},
                Err(err) => return Err(err),
            }
            let current_state = self.instance_state(&container_id, cancel).await?;
            debug!("Instance {}: {} -> {}", instance_id, previous_state, current_state);
            changes.push(InstanceStateChange {
                instance_id,
                previous_state,
                current_state,
            });
        }
        Ok(changes)
    }

    /// Stops the given instances. `force` skips the grace period and kills
    /// the container processes immediately.
    pub async fn stop_instances(
        &self,
        instance_ids: &[String],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceStateChange>, ExecutorError> {
        let resolved = self.resolve_all(instance_ids, cancel).await?;
        let timeout = if force { Some(0) } else { None };
        let mut changes = Vec::with_capacity(resolved.len());
        for (instance_id, container_id) in resolved {
            let previous_state = self.instance_state(&container_id, cancel).await?;
            match self
                .engine
                .stop_container(&container_id, timeout, cancel)
                .await
            {
                Ok(()) => {},
                Err(err) if err.is_not_modified() => {},
                Err(err) => return Err(err),
            }
            let current_state = self.instance_state(&container_id, cancel).await?;
            debug!("Instance {}: {} -> {}", instance_id, previous_state, current_state);
            changes.push(InstanceStateChange {
                instance_id,
                previous_state,
                current_state,
            });
        }
        Ok(changes)
    }

    /// Terminates the given instances: stop if running, then remove. The
    /// reported current state is always `terminated`; the engine has nothing
    /// left to inspect once the container is gone.
    pub async fn terminate_instances(
        &self,
        instance_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceStateChange>, ExecutorError> {
        let resolved = self.resolve_all(instance_ids, cancel).await?;
        let mut changes = Vec::with_capacity(resolved.len());
        for (instance_id, container_id) in resolved {
            let previous_state = self.instance_state(&container_id, cancel).await?;
            if matches!(previous_state, InstanceState::Running | InstanceState::Stopping) {
                match self.engine.stop_container(&container_id, None, cancel).await {
                    Ok(()) => {},
                    Err(err) if err.is_not_modified() || err.is_not_found() => {},
                    Err(err) => return Err(err),
                }
            }
            match self.engine.remove_container(&container_id, true, cancel).await {
                Ok(()) => {},
                Err(err) if err.is_not_found() => {},
                Err(err) => return Err(err),
            }
            info!("Instance {} terminated", instance_id);
            changes.push(InstanceStateChange {
                instance_id,
                previous_state,
                current_state: InstanceState::Terminated,
            });
        }
        Ok(changes)
    }

    /// Looks an instance up by its ID label. Returns the container ID, or
    /// `None` when no enabled container carries the label.
    pub(crate) async fn find_instance(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ExecutorError> {
        let filters = labels::filter_many(&[
            (labels::ENABLED, "true"),
            (labels::INSTANCE_ID, instance_id),
        ]);
        let mut containers = self.engine.list_containers(filters, cancel).await?;
        Ok(containers.pop().and_then(|container| container.id))
    }

    /// Resolves every ID up front; a single miss fails the whole request
    /// before any instance is touched.
    async fn resolve_all(
        &self,
        instance_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, String)>, ExecutorError> {
        let mut resolved = Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            match self.find_instance(instance_id, cancel).await? {
                Some(container_id) => resolved.push((instance_id.clone(), container_id)),
                None => return Err(ExecutorError::InstanceNotFound(instance_id.clone())),
            }
        }
        Ok(resolved)
    }

    async fn instance_state(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceState, ExecutorError> {
        let inspect = self.engine.inspect_container(container_id, cancel).await?;
        let state = inspect
            .state
            .ok_or_else(|| ExecutorError::StateDecode("inspect returned no state".to_string()))?;
        map_container_state(&state)
    }

    async fn describe_one(
        &self,
        instance_id: &str,
        inspect: ContainerInspectResponse,
        cancel: &CancellationToken,
    ) -> Result<InstanceDescription, ExecutorError> {
        let state = inspect
            .state
            .as_ref()
            .ok_or_else(|| ExecutorError::StateDecode("inspect returned no state".to_string()))?;
        let instance_state = map_container_state(state)?;
        let health_status = health_status(state);

        let container_labels = inspect
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        let image_id = container_labels
            .get(labels::IMAGE_ID)
            .cloned()
            .unwrap_or_default();
        let instance_type = container_labels
            .get(labels::INSTANCE_TYPE)
            .cloned()
            .unwrap_or_default();

        // Resolve the architecture from the image actually backing the
        // container; the label only records what the caller asked for.
        let image_ref = inspect.image.clone().unwrap_or_else(|| image_id.clone());
        let image = self.engine.inspect_image(&image_ref, cancel).await?;
        let architecture = normalize_architecture(&image.architecture);

        let private_dns_name = inspect
            .name
            .as_deref()
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        let private_ip_address = primary_ipv4(&networks, &self.overlay_network);

        let created = inspect
            .created
            .ok_or_else(|| ExecutorError::StateDecode("inspect returned no creation time".to_string()))?;
        let launch_time = DateTime::parse_from_rfc3339(&created)
            .map_err(|err| {
                ExecutorError::StateDecode(format!("bad creation timestamp {:?}: {}", created, err))
            })?
            .with_timezone(&Utc);

        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            image_id,
            state: instance_state,
            health_status,
            private_dns_name,
            private_ip_address: private_ip_address.clone(),
            public_ip_address: private_ip_address,
            instance_type,
            architecture,
            launch_time,
        })
    }
}

/// Maps the engine's container state onto the EC2 instance state. Total over
/// the states the engine documents; anything else is a decode error rather
/// than a guess.
pub(crate) fn map_container_state(
    state: &ContainerState,
) -> Result<InstanceState, ExecutorError> {
    let status = state.status;
    let running = state.running.unwrap_or(false);
    let paused = state.paused.unwrap_or(false);
    let dead = state.dead.unwrap_or(false);

    if status == Some(ContainerStateStatusEnum::CREATED) {
        Ok(InstanceState::Pending)
    } else if running && !paused {
        Ok(InstanceState::Running)
    } else if paused {
        Ok(InstanceState::Stopping)
    } else if status == Some(ContainerStateStatusEnum::EXITED) {
        Ok(InstanceState::Stopped)
    } else if dead {
        Ok(InstanceState::Terminated)
    } else if status == Some(ContainerStateStatusEnum::REMOVING) {
        Ok(InstanceState::ShuttingDown)
    } else {
        Err(ExecutorError::StateDecode(format!(
            "container state {:?} (running: {}, paused: {}, dead: {}) maps to no instance state",
            status, running, paused, dead
        )))
    }
}

/// The health string reported on describe: "unknown" unless the image
/// defines a healthcheck, otherwise the engine's verdict lower-cased.
fn health_status(state: &ContainerState) -> String {
    state
        .health
        .as_ref()
        .and_then(|health| health.status)
        .map(|status| status.to_string().trim().to_lowercase())
        .filter(|status| !status.is_empty() && status != "none" && status != "empty")
        .unwrap_or_else(|| "unknown".to_string())
}

/// Picks the instance's primary IPv4: the first non-empty address over the
/// sorted attached networks, preferring anything over the IMDS overlay but
/// falling back to it rather than reporting nothing.
fn primary_ipv4(networks: &HashMap<String, EndpointSettings>, overlay: &str) -> String {
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();
    let address_of = |name: &str| {
        networks
            .get(name)
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|address| !address.is_empty())
    };
    for name in &names {
        if name.as_str() == overlay {
            continue;
        }
        if let Some(address) = address_of(name) {
            return address;
        }
    }
    for name in &names {
        if let Some(address) = address_of(name) {
            return address;
        }
    }
    String::new()
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;

    fn engine_state(
        status: Option<ContainerStateStatusEnum>,
        running: bool,
        paused: bool,
        dead: bool,
    ) -> ContainerState {
        ContainerState {
            status,
            running: Some(running),
            paused: Some(paused),
            dead: Some(dead),
            ..Default::default()
        }
    }

    #[test]
    fn state_mapping_follows_the_table() {
        use ContainerStateStatusEnum::*;
        let cases = [
            (engine_state(Some(CREATED), false, false, false), InstanceState::Pending),
            (engine_state(Some(RUNNING), true, false, false), InstanceState::Running),
            (engine_state(Some(PAUSED), true, true, false), InstanceState::Stopping),
            (engine_state(Some(PAUSED), false, true, false), InstanceState::Stopping),
            (engine_state(Some(EXITED), false, false, false), InstanceState::Stopped),
            (engine_state(Some(DEAD), false, false, true), InstanceState::Terminated),
            (engine_state(Some(REMOVING), false, false, false), InstanceState::ShuttingDown),
        ];
        for (state, expected) in cases {
            assert_eq!(map_container_state(&state).unwrap(), expected);
        }
    }

    #[test]
    fn state_mapping_is_total_and_single_valued() {
        use ContainerStateStatusEnum::*;
        // Every engine tuple either maps to exactly one instance state or is
        // a decode error; nothing panics and nothing falls through.
        for status in [
            None,
            Some(EMPTY),
            Some(CREATED),
            Some(RUNNING),
            Some(PAUSED),
            Some(RESTARTING),
            Some(REMOVING),
            Some(EXITED),
            Some(DEAD),
        ] {
            for running in [false, true] {
                for paused in [false, true] {
                    for dead in [false, true] {
                        let state = engine_state(status, running, paused, dead);
                        let _ = map_container_state(&state);
                    }
                }
            }
        }
        // A tuple outside the table is an error, not a guess.
        let err = map_container_state(&engine_state(Some(RESTARTING), false, false, false))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::StateDecode(_)));
        let err = map_container_state(&engine_state(None, false, false, false)).unwrap_err();
        assert!(matches!(err, ExecutorError::StateDecode(_)));
    }

    #[test]
    fn every_instance_state_is_reachable() {
        use ContainerStateStatusEnum::*;
        let reachable: Vec<InstanceState> = [
            engine_state(Some(CREATED), false, false, false),
            engine_state(Some(RUNNING), true, false, false),
            engine_state(Some(PAUSED), false, true, false),
            engine_state(Some(EXITED), false, false, false),
            engine_state(Some(DEAD), false, false, true),
            engine_state(Some(REMOVING), false, false, false),
        ]
        .iter()
        .map(|state| map_container_state(state).unwrap())
        .collect();
        for state in InstanceState::iter() {
            assert!(reachable.contains(&state), "{} is unreachable", state);
        }
    }

    fn endpoint(address: &str) -> EndpointSettings {
        EndpointSettings {
            ip_address: Some(address.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn primary_ip_prefers_sorted_non_overlay_networks() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint("172.17.0.2"));
        networks.insert("apps".to_string(), endpoint("10.0.0.2"));
        networks.insert("dc2-imds".to_string(), endpoint("169.254.169.7"));
        assert_eq!(primary_ipv4(&networks, "dc2-imds"), "10.0.0.2");
    }

    #[test]
    fn primary_ip_falls_back_to_the_overlay() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint(""));
        networks.insert("dc2-imds".to_string(), endpoint("169.254.169.7"));
        assert_eq!(primary_ipv4(&networks, "dc2-imds"), "169.254.169.7");
    }

    #[test]
    fn primary_ip_is_empty_without_addresses() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), EndpointSettings::default());
        assert_eq!(primary_ipv4(&networks, "dc2-imds"), "");
        assert_eq!(primary_ipv4(&HashMap::new(), "dc2-imds"), "");
    }

    #[test]
    fn health_defaults_to_unknown() {
        let state = engine_state(Some(ContainerStateStatusEnum::RUNNING), true, false, false);
        assert_eq!(health_status(&state), "unknown");
        let mut state = state;
        state.health = Some(bollard::models::Health {
            status: Some(bollard::models::HealthStatusEnum::HEALTHY),
            ..Default::default()
        });
        assert_eq!(health_status(&state), "healthy");
        state.health = Some(bollard::models::Health {
            status: Some(bollard::models::HealthStatusEnum::NONE),
            ..Default::default()
        });
        assert_eq!(health_status(&state), "unknown");
    }
}
