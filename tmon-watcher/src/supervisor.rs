//! Liveness reporting to an external supervisor
//!
//! Any failure here is fatal for the watcher process.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{SupervisorConfig, SupervisorKind};
use crate::error::{Result, WatcherError};

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Announce the watcher once at startup
    async fn register(&self) -> Result<()>;

    /// Report that the watcher is alive
    async fn heartbeat(&self) -> Result<()>;
}

/// Build the supervisor described by the configuration
pub fn from_config(config: &SupervisorConfig, instance_id: &str) -> Result<Box<dyn Supervisor>> {
    match config.kind {
        SupervisorKind::None => Ok(Box::new(NullSupervisor)),
        SupervisorKind::File => {
            let path = config.path.clone().ok_or_else(|| {
                WatcherError::SupervisoryCommunication(
                    "file supervisor configured without a path".to_string(),
                )
            })?;
            Ok(Box::new(HeartbeatFile::new(path)))
        }
        SupervisorKind::Http => {
            let url = config.url.clone().ok_or_else(|| {
                WatcherError::SupervisoryCommunication(
                    "http supervisor configured without a url".to_string(),
                )
            })?;
            Ok(Box::new(HttpSupervisor::new(url, instance_id)?))
        }
    }
}

/// No supervisor; always succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSupervisor;

#[async_trait]
impl Supervisor for NullSupervisor {
    async fn register(&self) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes `<pid> <RFC 3339 timestamp>` to a file on every heartbeat
#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn touch(&self) -> Result<()> {
        let line = format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339());
        tokio::fs::write(&self.path, line).await.map_err(|e| {
            WatcherError::SupervisoryCommunication(format!(
                "cannot write heartbeat file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl Supervisor for HeartbeatFile {
    async fn register(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    WatcherError::SupervisoryCommunication(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        self.touch().await?;
        info!(path = %self.path.display(), "Registered heartbeat file");
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.touch().await
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatMessage<'a> {
    instance: &'a str,
    pid: u32,
    status: &'a str,
    timestamp: String,
}

/// POSTs a JSON heartbeat to a supervisor endpoint
pub struct HttpSupervisor {
    client: reqwest::Client,
    url: String,
    instance_id: String,
}

impl HttpSupervisor {
    pub fn new(url: impl Into<String>, instance_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WatcherError::SupervisoryCommunication(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            instance_id: instance_id.to_string(),
        })
    }

    async fn post(&self, status: &str) -> Result<()> {
        let message = HeartbeatMessage {
            instance: &self.instance_id,
            pid: std::process::id(),
            status,
            timestamp: Utc::now().to_rfc3339(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| WatcherError::SupervisoryCommunication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WatcherError::SupervisoryCommunication(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        debug!(url = %self.url, status, "Supervisor acknowledged");
        Ok(())
    }
}

#[async_trait]
impl Supervisor for HttpSupervisor {
    async fn register(&self) -> Result<()> {
        self.post("starting").await?;
        info!(url = %self.url, "Registered with supervisor");
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.post("alive").await
    }
}
