// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! A narrow capability interface over the container engine.
//!
//! Everything the executor knows about Docker lives here: the rest of the
//! crate talks in terms of these operations and classifies failures through
//! [`ExecutorError`]. Every call races the operation's cancellation token so
//! a cancelled request surfaces immediately, including mid-stream.

use std::{collections::HashMap, future::Future, time::Duration};

use bollard::{
    container::{
        Config,
        CreateContainerOptions,
        ListContainersOptions,
        LogOutput,
        LogsOptions,
        RemoveContainerOptions,
        StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{
        ContainerCreateResponse,
        ContainerInspectResponse,
        ContainerSummaryInner,
        EndpointSettings,
        Image,
        Network,
        NetworkCreateResponse,
        Volume,
    },
    network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions},
    volume::CreateVolumeOptions,
    Docker,
};
use futures::StreamExt;
use log::*;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;

/// Races a future against the cancellation token, surfacing
/// [`ExecutorError::Cancelled`] the moment the token fires.
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ExecutorError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        res = fut => res.map_err(ExecutorError::from),
    }
}

/// Sleeps for `duration` unless the token fires first.
pub(crate) async fn sleep_or_cancelled(
    cancel: &CancellationToken,
    duration: Duration,
) -> Result<(), ExecutorError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn log_text(log: LogOutput) -> String {
    match log {
        LogOutput::StdErr { message } |
        LogOutput::StdOut { message } |
        LogOutput::Console { message } |
        LogOutput::StdIn { message } => String::from_utf8_lossy(&message).into_owned(),
    }
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A wrapper around a [`bollard::Docker`] instance exposing the handful of
/// engine operations the executor needs.
#[derive(Clone)]
pub struct EngineClient {
    handle: Docker,
}

impl EngineClient {
    /// Connect to the local engine daemon.
    pub fn connect() -> Result<Self, ExecutorError> {
        let handle = Docker::connect_with_local_defaults()?;
        Ok(Self { handle })
    }

    /// Returns the version of the _docker client_.
    pub fn version(&self) -> String {
        self.handle.client_version().to_string()
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        guarded(cancel, self.handle.ping()).await?;
        Ok(())
    }

    /// Pull `image` from its registry, draining the progress stream. A no-op
    /// when the image is already local.
    pub async fn pull_image(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        match guarded(cancel, self.handle.inspect_image(image)).await {
            Ok(_) => {
                debug!("Image {} is already local", image);
                return Ok(());
            },
            Err(err) if err.is_not_found() => {},
            Err(err) => return Err(err),
        }
        info!("Pulling {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = self.handle.create_image(options, None, None);
        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                update = stream.next() => update,
            };
            match update {
                Some(Ok(progress)) => {
                    if let Some(status) = progress.status {
                        debug!("{}: {}", image, status);
                    }
                },
                Some(Err(err)) => return Err(err.into()),
                None => break,
            }
        }
        info!("Image {} pulled", image);
        Ok(())
    }

    pub async fn inspect_image(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<Image, ExecutorError> {
        guarded(cancel, self.handle.inspect_image(image)).await
    }

    pub async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
        cancel: &CancellationToken,
    ) -> Result<ContainerCreateResponse, ExecutorError> {
        let options = Some(CreateContainerOptions {
            name: name.to_string(),
        });
        guarded(cancel, self.handle.create_container(options, config)).await
    }

    pub async fn start_container(
        &self,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        guarded(cancel, self.handle.start_container::<String>(container, None)).await
    }

    /// Stop a container. `timeout` is the grace period in seconds before the
    /// engine kills the process; `None` leaves the engine default in place.
    pub async fn stop_container(
        &self,
        container: &str,
        timeout: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let options = timeout.map(|t| StopContainerOptions { t });
        guarded(cancel, self.handle.stop_container(container, options)).await
    }

    pub async fn remove_container(
        &self,
        container: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });
        guarded(cancel, self.handle.remove_container(container, options)).await
    }

    pub async fn inspect_container(
        &self,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInspectResponse, ExecutorError> {
        guarded(cancel, self.handle.inspect_container(container, None)).await
    }

    /// List all containers (running or not) matching the given filters.
    pub async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerSummaryInner>, ExecutorError> {
        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });
        guarded(cancel, self.handle.list_containers(options)).await
    }

    /// Collects the last `tail` lines of a container's output into a string.
    pub async fn container_logs(
        &self,
        container: &str,
        tail: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        });
        let mut stream = self.handle.logs(container, options);
        let mut collected = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(log)) => collected.push_str(&log_text(log)),
                Some(Err(err)) => return Err(err.into()),
                None => break,
            }
        }
        Ok(collected)
    }

    /// Run `command` inside a container and collect its exit code and
    /// output, stdout and stderr kept apart.
    pub async fn exec(
        &self,
        container: &str,
        command: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecutorError> {
        let config = CreateExecOptions::<String> {
            cmd: Some(command.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = guarded(cancel, self.handle.create_exec(container, config)).await?;
        let started = guarded(cancel, self.handle.start_exec(&exec.id, None)).await?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    chunk = output.next() => chunk,
                };
                match chunk {
                    Some(Ok(LogOutput::StdErr { message })) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    },
                    Some(Ok(log)) => stdout.push_str(&log_text(log)),
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                }
            }
        }
        let inspect = guarded(cancel, self.handle.inspect_exec(&exec.id)).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        trace!(
            "exec {:?} in {} exited with {}",
            command,
            container,
            exit_code
        );
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    pub async fn create_volume(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Volume, ExecutorError> {
        let config = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            ..Default::default()
        };
        let volume = guarded(cancel, self.handle.create_volume(config)).await?;
        info!("Docker volume {} created at {}", volume.name, volume.mountpoint);
        Ok(volume)
    }

    pub async fn remove_volume(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        guarded(cancel, self.handle.remove_volume(name, None)).await
    }

    pub async fn create_network(
        &self,
        options: CreateNetworkOptions<String>,
        cancel: &CancellationToken,
    ) -> Result<NetworkCreateResponse, ExecutorError> {
        guarded(cancel, self.handle.create_network(options)).await
    }

    pub async fn inspect_network(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Network, ExecutorError> {
        let options = Some(InspectNetworkOptions {
            verbose: false,
            scope: "local",
        });
        guarded(cancel, self.handle.inspect_network(name, options)).await
    }

    pub async fn list_networks(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Network>, ExecutorError> {
        guarded(
            cancel,
            self.handle.list_networks(None::<ListNetworksOptions<String>>),
        )
        .await
    }

    pub async fn remove_network(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        guarded(cancel, self.handle.remove_network(name)).await
    }

    pub async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint_config: EndpointSettings,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config,
        };
        guarded(cancel, self.handle.connect_network(network, options)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = guarded(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, bollard::errors::Error>(())
        })
        .await;
        assert!(matches!(res, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_is_interruptible() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let res = sleep_or_cancelled(&cancel, Duration::from_secs(60)).await;
        assert!(matches!(res, Err(ExecutorError::Cancelled)));
        let cancel = CancellationToken::new();
        sleep_or_cancelled(&cancel, Duration::from_millis(1))
            .await
            .unwrap();
    }
}
