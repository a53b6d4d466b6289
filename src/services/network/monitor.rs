// Background connectivity observation
//
// The monitor publishes the latest path status through a watch channel so
// callers read it synchronously without waiting on the probe.

use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceType {
    Wifi,
    Cellular,
    Wired,
    Loopback,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStatus {
    pub connected: bool,
    /// Metered link (cellular, personal hotspot)
    pub expensive: bool,
    pub interface: Option<InterfaceType>,
}

impl PathStatus {
    pub fn offline() -> Self {
        Self {
            connected: false,
            expensive: false,
            interface: None,
        }
    }

    pub fn online(interface: InterfaceType) -> Self {
        Self {
            connected: true,
            expensive: matches!(interface, InterfaceType::Cellular),
            interface: Some(interface),
        }
    }
}

/// One observation of the network path
#[async_trait]
pub trait PathProbe: Send + Sync {
    async fn check(&self) -> PathStatus;
}

/// Considers the path up when a TCP connection to a well-known host succeeds
pub struct TcpPathProbe {
    addr: String,
    timeout: Duration,
}

impl TcpPathProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PathProbe for TcpPathProbe {
    async fn check(&self) -> PathStatus {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let interface = match stream.local_addr() {
                    Ok(SocketAddr::V4(a)) if a.ip().is_loopback() => InterfaceType::Loopback,
                    Ok(SocketAddr::V6(a)) if a.ip().is_loopback() => InterfaceType::Loopback,
                    _ => InterfaceType::Other,
                };
                PathStatus::online(interface)
            }
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", self.addr, e);
                PathStatus::offline()
            }
            Err(_) => {
                debug!("Connectivity probe to {} timed out", self.addr);
                PathStatus::offline()
            }
        }
    }
}

/// Continuously updated path status
pub struct PathMonitor {
    status: watch::Receiver<PathStatus>,
    // Keeps a fixed monitor's channel open
    _sender: Option<watch::Sender<PathStatus>>,
    task: Option<JoinHandle<()>>,
}

impl PathMonitor {
    /// Start probing every `interval`; the status is optimistic until the first probe lands
    pub fn spawn(probe: Arc<dyn PathProbe>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(PathStatus::online(InterfaceType::Other));
        let task = tokio::spawn(async move {
            loop {
                let status = probe.check().await;
                let changed = tx.send_if_modified(|current| {
                    let changed = *current != status;
                    *current = status;
                    changed
                });
                if changed {
                    info!(
                        "Network path {} ({:?})",
                        if status.connected { "up" } else { "down" },
                        status.interface
                    );
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self {
            status: rx,
            _sender: None,
            task: Some(task),
        }
    }

    /// A monitor that always reports `status`
    pub fn fixed(status: PathStatus) -> Self {
        let (tx, rx) = watch::channel(status);
        Self {
            status: rx,
            _sender: Some(tx),
            task: None,
        }
    }

    /// Latest observation, without waiting
    pub fn current(&self) -> PathStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PathStatus> {
        self.status.clone()
    }
}

impl Drop for PathMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
