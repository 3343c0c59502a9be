//! Tunnel health and forwarded-port reconciliation.
//!
//! The [`RotationController`] runs once per watch cycle. It restarts the VPN
//! tunnel when the rotation interval has elapsed, when the peer port has been
//! reported closed too many times in a row, or when the previous restart
//! failed. Otherwise it asks the download engine whether its peer port is
//! reachable and pushes the sidecar's forwarded port when it is not.
//!
//! Every multi-attempt step uses a fixed-delay [`RetryPolicy`]. Exhausted
//! retries are returned to the caller, which logs them and tries again on the
//! next cycle.

pub mod gluetun;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::transmission::RpcError;

pub use gluetun::{GluetunClient, SidecarError};

// ============================================================================
// Peers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Running,
    Stopped,
}

/// The VPN sidecar's control API.
#[async_trait]
pub trait TunnelSidecar: Send + Sync {
    async fn status(&self) -> Result<TunnelStatus, SidecarError>;

    /// Currently forwarded port; 0 while the sidecar has not learned it.
    async fn forwarded_port(&self) -> Result<u16, SidecarError>;

    /// Ask the sidecar to tear the tunnel down. It restarts on its own.
    async fn request_restart(&self) -> Result<(), SidecarError>;
}

/// The download engine's peer-port settings.
#[async_trait]
pub trait PeerPortClient: Send + Sync {
    /// Whether the engine's peer port is reachable from outside.
    async fn port_test(&self) -> Result<bool, RpcError>;

    async fn set_peer_port(&self, port: u16) -> Result<(), RpcError>;
}

#[async_trait]
impl<T: TunnelSidecar + ?Sized> TunnelSidecar for Arc<T> {
    async fn status(&self) -> Result<TunnelStatus, SidecarError> {
        (**self).status().await
    }

    async fn forwarded_port(&self) -> Result<u16, SidecarError> {
        (**self).forwarded_port().await
    }

    async fn request_restart(&self) -> Result<(), SidecarError> {
        (**self).request_restart().await
    }
}

#[async_trait]
impl<T: PeerPortClient + ?Sized> PeerPortClient for Arc<T> {
    async fn port_test(&self) -> Result<bool, RpcError> {
        (**self).port_test().await
    }

    async fn set_peer_port(&self, port: u16) -> Result<(), RpcError> {
        (**self).set_peer_port(port).await
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("Failed to request tunnel restart: {0}")]
    Restart(#[source] SidecarError),

    #[error("Tunnel still down after {attempts} status checks")]
    TunnelDown { attempts: u32 },

    #[error("Sidecar has not reported a forwarded port yet")]
    PortUnknown,

    #[error("Port update failed after {attempts} attempts: {source}")]
    PortUpdate {
        attempts: u32,
        #[source]
        source: Box<VpnError>,
    },

    #[error("Port test failed after {attempts} attempts: {source}")]
    PortTest {
        attempts: u32,
        #[source]
        source: RpcError,
    },

    #[error("Sidecar error: {0}")]
    Sidecar(#[from] SidecarError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

// ============================================================================
// State
// ============================================================================

/// Fixed-delay retry: `attempts` tries with `delay` between consecutive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Retry budgets of the three multi-attempt steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    pub tunnel_up: RetryPolicy,
    pub port_update: RetryPolicy,
    pub port_test: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let delay = Duration::from_secs(3);
        Self {
            tunnel_up: RetryPolicy::new(10, delay),
            port_update: RetryPolicy::new(3, delay),
            port_test: RetryPolicy::new(3, delay),
        }
    }
}

/// Rotation triggers, re-read from the live configuration every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationSettings {
    /// Restart the tunnel this long after the last restart. Zero disables.
    pub interval: chrono::Duration,
    /// Restart once more than this many consecutive port tests failed.
    /// Zero disables.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnTunnelState {
    /// Port last pushed to the download engine; -1 when unknown.
    pub forwarded_port: i64,
    pub last_rotation_at: DateTime<Utc>,
    pub consecutive_port_check_failures: u32,
    /// The last restart failed; restart again regardless of the triggers.
    pub forced_retry: bool,
}

impl VpnTunnelState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            forwarded_port: -1,
            last_rotation_at: now,
            consecutive_port_check_failures: 0,
            forced_retry: false,
        }
    }

    /// The forwarded port changes with every tunnel, so a fresh tunnel starts
    /// from a clean slate.
    fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::new(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    Healthy,
    /// A trigger fired; the next check restarts the tunnel.
    NeedsRotation,
    Rotating,
    RotationFailed { forced_retry: bool },
}

// ============================================================================
// Controller
// ============================================================================

pub struct RotationController<S, P> {
    sidecar: S,
    peer: P,
    state: VpnTunnelState,
    phase: TunnelPhase,
    policies: RetryPolicies,
}

impl<S: TunnelSidecar, P: PeerPortClient> RotationController<S, P> {
    pub fn new(sidecar: S, peer: P, now: DateTime<Utc>) -> Self {
        Self {
            sidecar,
            peer,
            state: VpnTunnelState::new(now),
            phase: TunnelPhase::Healthy,
            policies: RetryPolicies::default(),
        }
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_state(mut self, state: VpnTunnelState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &VpnTunnelState {
        &self.state
    }

    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    pub fn should_rotate(&self, settings: &RotationSettings, now: DateTime<Utc>) -> bool {
        let threshold = settings.failure_threshold;
        let too_many_failures =
            threshold > 0 && self.state.consecutive_port_check_failures > threshold;
        // an interval past the calendar's range is never due
        let interval_elapsed = settings.interval > chrono::Duration::zero()
            && self
                .state
                .last_rotation_at
                .checked_add_signed(settings.interval)
                .is_some_and(|due| now >= due);

        too_many_failures || interval_elapsed || self.state.forced_retry
    }

    /// One health check: rotate when due, then test and repair the peer port.
    pub async fn check(
        &mut self,
        settings: &RotationSettings,
        now: DateTime<Utc>,
    ) -> Result<(), VpnError> {
        if self.should_rotate(settings, now) {
            tracing::info!(
                failures = self.state.consecutive_port_check_failures,
                forced_retry = self.state.forced_retry,
                last_rotation = %self.state.last_rotation_at,
                "Rotating VPN tunnel"
            );
            self.phase = TunnelPhase::Rotating;
            if let Err(e) = self.rotate(now).await {
                self.phase = TunnelPhase::RotationFailed {
                    forced_retry: self.state.forced_retry,
                };
                return Err(e);
            }
        }

        let open = self.port_test().await?;
        if open {
            tracing::debug!(port = self.state.forwarded_port, "Peer port is open");
            self.state.consecutive_port_check_failures = 0;
            self.phase = TunnelPhase::Healthy;
            return Ok(());
        }

        self.state.consecutive_port_check_failures =
            self.state.consecutive_port_check_failures.saturating_add(1);
        tracing::warn!(
            failures = self.state.consecutive_port_check_failures,
            threshold = settings.failure_threshold,
            "Peer port is closed"
        );
        self.phase = if self.should_rotate(settings, now) {
            TunnelPhase::NeedsRotation
        } else {
            TunnelPhase::Healthy
        };
        self.update_port_with_retry().await
    }

    async fn rotate(&mut self, now: DateTime<Utc>) -> Result<(), VpnError> {
        if let Err(e) = self.sidecar.request_restart().await {
            self.state.forced_retry = true;
            return Err(VpnError::Restart(e));
        }

        if let Err(e) = self.wait_for_tunnel().await {
            self.state.forced_retry = true;
            return Err(e);
        }

        self.state.reset(now);
        tracing::info!("VPN tunnel is back up");

        self.update_port_with_retry().await
    }

    async fn wait_for_tunnel(&self) -> Result<(), VpnError> {
        let policy = self.policies.tunnel_up;
        for attempt in 1..=policy.attempts {
            match self.sidecar.status().await {
                Ok(TunnelStatus::Running) => return Ok(()),
                Ok(TunnelStatus::Stopped) => {
                    tracing::debug!(attempt, "Tunnel not running yet");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Unable to read tunnel status");
                }
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(VpnError::TunnelDown {
            attempts: policy.attempts,
        })
    }

    async fn port_test(&self) -> Result<bool, VpnError> {
        let policy = self.policies.port_test;
        let mut attempt = 1;
        loop {
            match self.peer.port_test().await {
                Ok(open) => return Ok(open),
                Err(e) if e.is_transport() && attempt < policy.attempts => {
                    tracing::warn!(attempt, error = %e, "Port test failed, retrying");
                    tokio::time::sleep(policy.delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(VpnError::PortTest {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    async fn update_port(&mut self) -> Result<(), VpnError> {
        let port = self.sidecar.forwarded_port().await?;
        if port == 0 {
            return Err(VpnError::PortUnknown);
        }
        if i64::from(port) == self.state.forwarded_port {
            tracing::debug!(port, "Forwarded port unchanged");
            return Ok(());
        }

        self.peer.set_peer_port(port).await?;
        tracing::info!(
            old = self.state.forwarded_port,
            new = port,
            "Pushed forwarded port to download engine"
        );
        self.state.forwarded_port = i64::from(port);
        Ok(())
    }

    async fn update_port_with_retry(&mut self) -> Result<(), VpnError> {
        let policy = self.policies.port_update;
        let mut attempt = 1;
        loop {
            match self.update_port().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.attempts => {
                    tracing::warn!(attempt, error = %e, "Port update failed, retrying");
                    tokio::time::sleep(policy.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(VpnError::PortUpdate {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
            }
        }
    }
}
