// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! Supervision of the shared IMDS proxy container.
//!
//! Exactly one proxy serves every executor on the machine, across processes,
//! so no in-process lock can coordinate its lifecycle. The engine's
//! unique-name constraint is the synchronizing primitive instead: `ensure`
//! always creates first and treats a name conflict as "someone else got
//! there", never inspect-then-create, which would race.

use std::{collections::HashMap, time::Instant};

use bollard::{
    container::Config,
    models::{ContainerInspectResponse, EndpointSettings, HostConfig},
};
use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        RuntimeMode,
        DOCKER_SOCKET,
        ENSURE_DEADLINE,
        HOST_GATEWAY_ALIAS,
        IMDS_PROXY_COMMAND,
        IMDS_PROXY_CONTAINER,
        IMDS_PROXY_IP,
        IMDS_PROXY_VERSION,
        LOG_TAIL,
        PROBE_INTERVAL,
        TRANSIENT_RETRY_DELAY,
    },
    engine::{sleep_or_cancelled, EngineClient, ExecOutput},
    error::ExecutorError,
    imds::network::resolved_network_name,
    labels,
};

/// TCP probe run inside the proxy container to confirm it accepts requests.
const READINESS_PROBE: [&str; 4] = ["nc", "-z", "127.0.0.1", "80"];

pub struct ImdsProxy {
    engine: EngineClient,
    image: String,
    runtime: RuntimeMode,
}

impl ImdsProxy {
    pub fn new(engine: EngineClient, image: String, runtime: RuntimeMode) -> Self {
        Self {
            engine,
            image,
            runtime,
        }
    }

    /// Guarantees a single healthy proxy container exists on the overlay at
    /// the fixed link-local address, within a bounded deadline.
    pub async fn ensure(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        let overlay = resolved_network_name();
        let deadline = Instant::now() + ENSURE_DEADLINE;
        loop {
            // Create-first. Two processes may both find no proxy and both
            // create; the engine accepts exactly one and answers the other
            // with a name conflict.
            match self.try_create(&overlay, cancel).await {
                Ok(id) => {
                    info!("IMDS proxy created (id {})", id);
                    self.start(cancel).await?;
                    return self.wait_ready(deadline, cancel).await;
                },
                Err(err) if err.is_conflict() => {},
                Err(err) if err.is_transient() => {
                    self.backoff(deadline, err, cancel).await?;
                    continue;
                },
                Err(err) => return Err(err),
            }

            let inspect = match self
                .engine
                .inspect_container(IMDS_PROXY_CONTAINER, cancel)
                .await
            {
                Ok(inspect) => inspect,
                Err(err) if err.is_transient() => {
                    self.backoff(deadline, err, cancel).await?;
                    continue;
                },
                Err(err) => return Err(err),
            };

            if let Some(reason) = self.staleness(&inspect, &overlay) {
                info!("Recreating stale IMDS proxy: {}", reason);
                match self
                    .engine
                    .remove_container(IMDS_PROXY_CONTAINER, true, cancel)
                    .await
                {
                    Ok(()) => {},
                    // A competing process may have removed it first.
                    Err(err) if err.is_transient() => {},
                    Err(err) => return Err(err),
                }
                continue;
            }

            self.start(cancel).await?;
            return self.wait_ready(deadline, cancel).await;
        }
    }

    /// Removes the proxy when no main container other than `ignore_main_id`
    /// remains; the proxy is reference-counted by the number of live
    /// executors, read straight off the engine.
    pub async fn remove_if_unused(
        &self,
        ignore_main_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mains = self
            .engine
            .list_containers(labels::filter(labels::MAIN, "true"), cancel)
            .await?;
        let remaining = mains
            .iter()
            .filter(|c| c.id.as_deref() != Some(ignore_main_id))
            .count();
        if remaining > 0 {
            debug!(
                "IMDS proxy stays: {} other executor(s) still reference it",
                remaining
            );
            return Ok(());
        }
        match self
            .engine
            .remove_container(IMDS_PROXY_CONTAINER, true, cancel)
            .await
        {
            Ok(()) => {
                info!("IMDS proxy removed");
                Ok(())
            },
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn try_create(
        &self,
        overlay: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        self.engine.pull_image(&self.image, cancel).await?;
        let mut container_labels = HashMap::new();
        container_labels.insert(
            labels::IMDS_PROXY_VERSION.to_string(),
            IMDS_PROXY_VERSION.to_string(),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert("80/tcp".to_string(), HashMap::new());
        let mut endpoints = HashMap::new();
        endpoints.insert(overlay.to_string(), EndpointSettings {
            ipam_config: Some(bollard::models::EndpointIpamConfig {
                ipv4_address: Some(IMDS_PROXY_IP.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let config = Config::<String> {
            image: Some(self.image.clone()),
            cmd: Some(IMDS_PROXY_COMMAND.iter().map(|s| s.to_string()).collect()),
            env: Some(vec![self.runtime.env_entry()]),
            labels: Some(container_labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET)]),
                extra_hosts: Some(vec![HOST_GATEWAY_ALIAS.to_string()]),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };
        let created = self
            .engine
            .create_container(IMDS_PROXY_CONTAINER, config, cancel)
            .await?;
        Ok(created.id)
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        match self
            .engine
            .start_container(IMDS_PROXY_CONTAINER, cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_modified() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Why the existing proxy container must be recreated, if it must.
    fn staleness(&self, inspect: &ContainerInspectResponse, overlay: &str) -> Option<String> {
        let on_overlay = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .map_or(false, |networks| networks.contains_key(overlay));
        if !on_overlay {
            return Some(format!("not attached to {}", overlay));
        }
        let config = inspect.config.as_ref();
        let image = config.and_then(|c| c.image.as_deref()).unwrap_or_default();
        if image != self.image {
            return Some(format!("image is {}, want {}", image, self.image));
        }
        let version = config
            .and_then(|c| c.labels.as_ref())
            .and_then(|container_labels| container_labels.get(labels::IMDS_PROXY_VERSION))
            .map(String::as_str)
            .unwrap_or_default();
        if version != IMDS_PROXY_VERSION {
            return Some(format!("version label is {:?}, want {}", version, IMDS_PROXY_VERSION));
        }
        let wanted_env = self.runtime.env_entry();
        let has_mode = config
            .and_then(|c| c.env.as_ref())
            .map_or(false, |env| env.iter().any(|entry| entry == &wanted_env));
        if !has_mode {
            return Some(format!("environment lacks {}", wanted_env));
        }
        None
    }

    /// Probes the proxy from inside its own network namespace until it
    /// accepts TCP on port 80 or the deadline passes.
    async fn wait_ready(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut failures: u32 = 0;
        let mut last = ExecOutput::default();
        loop {
            match self
                .engine
                .exec(IMDS_PROXY_CONTAINER, &READINESS_PROBE, cancel)
                .await
            {
                Ok(output) if output.exit_code == 0 => {
                    info!("IMDS proxy is ready at {}", IMDS_PROXY_IP);
                    return Ok(());
                },
                Ok(output) => last = output,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if err.is_transient() => {
                    last = ExecOutput {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: err.chained_message(),
                    };
                },
                Err(err) => return Err(err),
            }
            failures += 1;
            if should_log_failure(failures) {
                warn!(
                    "IMDS proxy readiness probe failed ({} attempt(s)): exit {} stderr {:?}",
                    failures, last.exit_code, last.stderr
                );
            }
            if Instant::now() + PROBE_INTERVAL >= deadline {
                return Err(self.deadline_error(last, cancel).await);
            }
            sleep_or_cancelled(cancel, PROBE_INTERVAL).await?;
        }
    }

    async fn backoff(
        &self,
        deadline: Instant,
        cause: ExecutorError,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        debug!(
            "Transient engine error while ensuring the IMDS proxy: {}",
            cause.chained_message()
        );
        if Instant::now() + TRANSIENT_RETRY_DELAY >= deadline {
            let last = ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: cause.chained_message(),
            };
            return Err(self.deadline_error(last, cancel).await);
        }
        sleep_or_cancelled(cancel, TRANSIENT_RETRY_DELAY).await
    }

    /// Builds the diagnostic timeout error: container state, last probe
    /// output and a tail of the proxy's logs. Collection is best effort; the
    /// proxy may be gone by now.
    async fn deadline_error(&self, last: ExecOutput, cancel: &CancellationToken) -> ExecutorError {
        let container_state = match self
            .engine
            .inspect_container(IMDS_PROXY_CONTAINER, cancel)
            .await
        {
            Ok(inspect) => inspect
                .state
                .map(|state| format!("{:?}", state))
                .unwrap_or_else(|| "unknown".to_string()),
            Err(err) => format!("unavailable ({})", err.chained_message()),
        };
        let logs = match self
            .engine
            .container_logs(IMDS_PROXY_CONTAINER, LOG_TAIL, cancel)
            .await
        {
            Ok(logs) => logs,
            Err(err) => format!("unavailable ({})", err.chained_message()),
        };
        ExecutorError::ProbeTimeout {
            container_state,
            probe_output: format!(
                "exit {} stdout {:?} stderr {:?}",
                last.exit_code, last.stdout, last.stderr
            ),
            logs,
        }
    }
}

/// The 1st, 2nd, 3rd and every 10th failure get logged; the rest stay quiet
/// so a slow proxy start does not flood the log.
fn should_log_failure(failures: u32) -> bool {
    failures <= 3 || failures % 10 == 0
}

#[cfg(test)]
mod test {
    use bollard::models::{ContainerConfig, NetworkSettings};

    use super::*;
    use crate::config::DEFAULT_IMDS_PROXY_IMAGE;

    fn proxy() -> ImdsProxy {
        ImdsProxy {
            engine: EngineClient::connect().expect("local defaults never fail to construct"),
            image: DEFAULT_IMDS_PROXY_IMAGE.to_string(),
            runtime: RuntimeMode::Host,
        }
    }

    fn healthy_inspect(overlay: &str) -> ContainerInspectResponse {
        let mut networks = HashMap::new();
        networks.insert(overlay.to_string(), EndpointSettings::default());
        let mut container_labels = HashMap::new();
        container_labels.insert(
            labels::IMDS_PROXY_VERSION.to_string(),
            IMDS_PROXY_VERSION.to_string(),
        );
        ContainerInspectResponse {
            config: Some(ContainerConfig {
                image: Some(DEFAULT_IMDS_PROXY_IMAGE.to_string()),
                labels: Some(container_labels),
                env: Some(vec!["DC2_RUNTIME=host".to_string()]),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn a_healthy_proxy_is_not_stale() {
        let proxy = proxy();
        assert_eq!(proxy.staleness(&healthy_inspect("dc2-imds"), "dc2-imds"), None);
    }

    #[test]
    fn missing_overlay_attachment_is_stale() {
        let proxy = proxy();
        let inspect = healthy_inspect("some-other-net");
        assert!(proxy.staleness(&inspect, "dc2-imds").is_some());
    }

    #[test]
    fn image_mismatch_is_stale() {
        let proxy = proxy();
        let mut inspect = healthy_inspect("dc2-imds");
        inspect.config.as_mut().unwrap().image = Some("nginx:latest".to_string());
        let reason = proxy.staleness(&inspect, "dc2-imds").unwrap();
        assert!(reason.contains("image"));
    }

    #[test]
    fn version_label_mismatch_is_stale() {
        let proxy = proxy();
        let mut inspect = healthy_inspect("dc2-imds");
        inspect
            .config
            .as_mut()
            .unwrap()
            .labels
            .as_mut()
            .unwrap()
            .insert(labels::IMDS_PROXY_VERSION.to_string(), "0".to_string());
        assert!(proxy.staleness(&inspect, "dc2-imds").is_some());
    }

    #[test]
    fn runtime_mode_mismatch_is_stale() {
        let proxy = proxy();
        let mut inspect = healthy_inspect("dc2-imds");
        inspect.config.as_mut().unwrap().env = Some(vec!["DC2_RUNTIME=container".to_string()]);
        let reason = proxy.staleness(&inspect, "dc2-imds").unwrap();
        assert!(reason.contains("DC2_RUNTIME"));
    }

    #[test]
    fn failure_logging_is_throttled() {
        let logged: Vec<u32> = (1..=25).filter(|n| should_log_failure(*n)).collect();
        assert_eq!(logged, vec![1, 2, 3, 10, 20]);
    }
}
