// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

use std::error::Error;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref CONTAINER_NOT_FOUND: Regex =
        Regex::new(r"(?i)container .* not found").expect("hardcoded regex");
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    #[error("volume {0} not found")]
    VolumeNotFound(String),
    #[error("volume {volume} is not attached to instance {instance} on {device}")]
    NotAttached {
        volume: String,
        instance: String,
        device: String,
    },
    #[error("something went wrong with the Docker API")]
    Docker(#[from] bollard::errors::Error),
    #[error("command {command} in container {container} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        container: String,
        command: String,
        exit_code: i64,
        stderr: String,
    },
    #[error("could not decode the engine's container state: {0}")]
    StateDecode(String),
    #[error(
        "the IMDS proxy did not become ready before the deadline. container state: {container_state}; last probe output: {probe_output}; container logs: {logs}"
    )]
    ProbeTimeout {
        container_state: String,
        probe_output: String,
        logs: String,
    },
    #[error("could not resolve the IMDS gateway address before the deadline")]
    GatewayTimeout,
    #[error("IMDS network setup failed: {0}")]
    ImdsNetwork(String),
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("executor shutdown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),
}

impl ExecutorError {
    /// Combine all error messages down the chain into one string.
    pub fn chained_message(&self) -> String {
        let mut messages = vec![self.to_string()];
        let mut this = self as &dyn Error;
        while let Some(next) = this.source() {
            messages.push(next.to_string());
            this = next;
        }
        messages.join(" caused by:\n")
    }

    /// The engine reported that the referenced object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ExecutorError::Docker(bollard::errors::Error::DockerResponseNotFoundError { .. })
        )
    }

    /// The engine refused the operation because the object already exists.
    pub fn is_conflict(&self) -> bool {
        match self {
            ExecutorError::Docker(bollard::errors::Error::DockerResponseConflictError {
                ..
            }) => true,
            ExecutorError::Docker(bollard::errors::Error::DockerResponseServerError {
                message,
                ..
            }) => message.contains("already exists") || message.contains("already in use"),
            _ => false,
        }
    }

    /// The engine answered 304; the container is already in the wanted state.
    pub fn is_not_modified(&self) -> bool {
        matches!(
            self,
            ExecutorError::Docker(bollard::errors::Error::DockerResponseNotModifiedError { .. })
        )
    }

    /// Errors the proxy-ensure loop retries instead of surfacing: the engine
    /// briefly denies knowledge of a container while a competing process
    /// creates or removes it.
    pub fn is_transient(&self) -> bool {
        if self.is_not_found() {
            return true;
        }
        let message = match self {
            ExecutorError::Docker(err) => err.to_string().to_lowercase(),
            _ => return false,
        };
        message.contains("no such container")
            || message.contains("is marked for removal")
            || CONTAINER_NOT_FOUND.is_match(&message)
    }

    /// The engine refused to create a network because its subnet overlaps an
    /// existing pool.
    pub fn is_pool_overlap(&self) -> bool {
        match self {
            ExecutorError::Docker(err) => err.to_string().to_lowercase().contains("overlap"),
            _ => false,
        }
    }

    /// The engine refused to remove a network that still has endpoints.
    pub fn is_active_endpoints(&self) -> bool {
        match self {
            ExecutorError::Docker(err) => err.to_string().contains("active endpoints"),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutorError::Cancelled)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_error(message: &str) -> ExecutorError {
        ExecutorError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: message.to_string(),
        })
    }

    #[test]
    fn not_found_classification() {
        let err = ExecutorError::Docker(bollard::errors::Error::DockerResponseNotFoundError {
            message: "no such container".to_string(),
        });
        assert!(err.is_not_found());
        assert!(err.is_transient());
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflict_classification() {
        let err = ExecutorError::Docker(bollard::errors::Error::DockerResponseConflictError {
            message: "name is in use".to_string(),
        });
        assert!(err.is_conflict());
        let err = server_error("endpoint with name dc2-main already exists in network dc2-imds");
        assert!(err.is_conflict());
        assert!(!ExecutorError::GatewayTimeout.is_conflict());
    }

    #[test]
    fn transient_classification() {
        assert!(server_error("No such container: dc2-imds-proxy").is_transient());
        assert!(server_error("container is marked for removal and cannot be started").is_transient());
        assert!(server_error("Container dc2-imds-proxy was not found").is_transient());
        assert!(!server_error("port is already allocated").is_transient());
        assert!(!ExecutorError::Cancelled.is_transient());
    }

    #[test]
    fn overlap_classification() {
        assert!(server_error("Pool overlaps with other one on this address space").is_pool_overlap());
        assert!(!server_error("invalid subnet").is_pool_overlap());
    }

    #[test]
    fn chained_message_includes_the_source() {
        let err = ExecutorError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "broken".to_string(),
        });
        let chained = err.chained_message();
        assert!(chained.contains("Docker API"));
        assert!(chained.contains("caused by"));
    }

    #[test]
    fn shutdown_reports_every_error() {
        let err = ExecutorError::Shutdown(vec!["one".to_string(), "two".to_string()]);
        let message = err.to_string();
        assert!(message.contains("2 error(s)"));
        assert!(message.contains("one; two"));
    }
}
