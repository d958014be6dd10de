//! Connectivity observation and pause-on-loss
//!
//! A [`ConnectivitySource`] delivers status transitions. The
//! [`NetworkGuard`] keeps the latest status and, when pause-on-loss is
//! enabled, cancels the session's in-flight transfer on disconnect using
//! [`CancelReason::NetworkLost`], so it settles as `Paused` rather than
//! `Cancelled` or `Failed`. Resuming after reconnect is left to the user or
//! the schedule.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::config::Endpoint;
use crate::session::{CancelReason, SessionHandle};

/// Connectivity as last reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    /// Nothing reported yet
    Unknown,
    /// Reachable
    Connected,
    /// Unreachable
    Disconnected,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Unknown => write!(f, "unknown"),
            NetworkStatus::Connected => write!(f, "connected"),
            NetworkStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Network guard configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Cancel the running transfer when connectivity is lost
    #[serde(default = "default_pause_on_loss")]
    pub pause_on_loss: bool,

    /// Seconds between probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Seconds before a probe counts as failed
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            pause_on_loss: default_pause_on_loss(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_pause_on_loss() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    3
}

/// Delivers connectivity transitions
pub trait ConnectivitySource: Send + 'static {
    /// Start observing; the channel closes when the source stops
    fn watch(self: Box<Self>) -> mpsc::Receiver<NetworkStatus>;
}

/// A channel fed by the caller is a source as-is
impl ConnectivitySource for mpsc::Receiver<NetworkStatus> {
    fn watch(self: Box<Self>) -> mpsc::Receiver<NetworkStatus> {
        *self
    }
}

/// Probes reachability with a TCP connect to `host:port`
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    interval: Duration,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe an arbitrary `host:port`
    pub fn new(address: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            interval,
            timeout,
        }
    }

    /// Probe the ssh port of `endpoint`
    pub fn for_endpoint(endpoint: &Endpoint, options: &NetworkOptions) -> Self {
        Self::new(
            format!("{}:{}", endpoint.host, endpoint.port),
            Duration::from_secs(options.probe_interval_secs.max(1)),
            Duration::from_secs(options.probe_timeout_secs.max(1)),
        )
    }

    async fn probe(&self) -> NetworkStatus {
        match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(e)) => {
                tracing::trace!("Probe of {} failed: {}", self.address, e);
                NetworkStatus::Disconnected
            }
            Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl ConnectivitySource for TcpProbe {
    fn watch(self: Box<Self>) -> mpsc::Receiver<NetworkStatus> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = NetworkStatus::Unknown;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }
                let status = self.probe().await;
                if status != last {
                    last = status;
                    if tx.send(status).await.is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }
}

/// Watches connectivity on behalf of one session
pub struct NetworkGuard {
    status: watch::Receiver<NetworkStatus>,
    task: JoinHandle<()>,
}

impl NetworkGuard {
    /// Start observing `source` for `session`
    pub fn spawn(
        source: impl ConnectivitySource,
        session: SessionHandle,
        pause_on_loss: bool,
    ) -> Self {
        let (status_tx, status) = watch::channel(NetworkStatus::Unknown);
        let mut transitions = Box::new(source).watch();

        let task = tokio::spawn(async move {
            while let Some(next) = transitions.recv().await {
                let previous = status_tx.send_replace(next);
                if previous == next {
                    continue;
                }
                tracing::info!("Network status: {} -> {}", previous, next);

                if next == NetworkStatus::Disconnected
                    && pause_on_loss
                    && session.state().is_in_flight()
                {
                    tracing::warn!("Network lost, pausing transfer");
                    if let Err(e) = session.cancel_with(CancelReason::NetworkLost) {
                        tracing::warn!("Failed to pause transfer: {}", e);
                    }
                }
            }
            tracing::debug!("Connectivity source closed");
        });

        Self { status, task }
    }

    /// Latest reported status
    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.clone()
    }
}

impl Drop for NetworkGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for NetworkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGuard")
            .field("status", &self.status())
            .finish()
    }
}
