//! Rotation controller scenarios against scripted fakes.
//!
//! The controller waits a fixed 3 s between attempts; every test runs on a
//! paused clock so those waits complete instantly.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rss2transmission::transmission::RpcError;
use rss2transmission::vpn::{
    PeerPortClient, RotationController, RotationSettings, SidecarError, TunnelPhase,
    TunnelSidecar, TunnelStatus, VpnError,
};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeSidecar {
    /// Scripted status answers; `Running` once exhausted.
    statuses: Mutex<VecDeque<Result<TunnelStatus, u16>>>,
    /// Forwarded port reported by the sidecar.
    port: Mutex<u16>,
    restart_fails: bool,
    restarts: AtomicUsize,
    status_calls: AtomicUsize,
    port_calls: AtomicUsize,
}

impl FakeSidecar {
    fn with_port(port: u16) -> Self {
        Self {
            port: Mutex::new(port),
            ..Self::default()
        }
    }

    fn script_status(&self, answers: impl IntoIterator<Item = Result<TunnelStatus, u16>>) {
        self.statuses.lock().unwrap().extend(answers);
    }
}

#[async_trait]
impl TunnelSidecar for FakeSidecar {
    async fn status(&self) -> Result<TunnelStatus, SidecarError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match self.statuses.lock().unwrap().pop_front() {
            None => Ok(TunnelStatus::Running),
            Some(Ok(status)) => Ok(status),
            Some(Err(code)) => Err(SidecarError::HttpStatus(code)),
        }
    }

    async fn forwarded_port(&self) -> Result<u16, SidecarError> {
        self.port_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.port.lock().unwrap())
    }

    async fn request_restart(&self) -> Result<(), SidecarError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.restart_fails {
            Err(SidecarError::HttpStatus(599))
        } else {
            Ok(())
        }
    }
}

enum PortAnswer {
    Open(bool),
    Transport,
    Rejected,
}

#[derive(Default)]
struct FakePeer {
    /// Scripted port-test answers; open once exhausted.
    answers: Mutex<VecDeque<PortAnswer>>,
    port_tests: AtomicUsize,
    pushed: Mutex<Vec<u16>>,
}

impl FakePeer {
    fn script(&self, answers: impl IntoIterator<Item = PortAnswer>) {
        self.answers.lock().unwrap().extend(answers);
    }

    fn pushed(&self) -> Vec<u16> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerPortClient for FakePeer {
    async fn port_test(&self) -> Result<bool, RpcError> {
        self.port_tests.fetch_add(1, Ordering::SeqCst);
        match self.answers.lock().unwrap().pop_front() {
            None => Ok(true),
            Some(PortAnswer::Open(open)) => Ok(open),
            Some(PortAnswer::Transport) => Err(RpcError::HttpStatus(502)),
            Some(PortAnswer::Rejected) => Err(RpcError::Rpc("method not allowed".into())),
        }
    }

    async fn set_peer_port(&self, port: u16) -> Result<(), RpcError> {
        self.pushed.lock().unwrap().push(port);
        Ok(())
    }
}

type Controller = RotationController<Arc<FakeSidecar>, Arc<FakePeer>>;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn setup(sidecar: FakeSidecar) -> (Arc<FakeSidecar>, Arc<FakePeer>, Controller) {
    let sidecar = Arc::new(sidecar);
    let peer = Arc::new(FakePeer::default());
    let controller = RotationController::new(Arc::clone(&sidecar), Arc::clone(&peer), at(0));
    (sidecar, peer, controller)
}

fn threshold(n: u32) -> RotationSettings {
    RotationSettings {
        interval: ChronoDuration::zero(),
        failure_threshold: n,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_closed_port_past_threshold_triggers_rotation() {
    let (sidecar, peer, mut controller) = setup(FakeSidecar::with_port(51413));
    let settings = threshold(2);
    peer.script([
        PortAnswer::Open(false),
        PortAnswer::Open(false),
        PortAnswer::Open(false),
    ]);

    for i in 1..=3 {
        controller.check(&settings, at(i)).await.unwrap();
        assert_eq!(controller.state().consecutive_port_check_failures, i as u32);
    }
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(controller.phase(), TunnelPhase::NeedsRotation);
    // first closed report pushes the port, later ones see it unchanged
    assert_eq!(peer.pushed(), vec![51413]);

    controller.check(&settings, at(10)).await.unwrap();
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(controller.phase(), TunnelPhase::Healthy);

    let state = controller.state();
    assert_eq!(state.consecutive_port_check_failures, 0);
    assert_eq!(state.last_rotation_at, at(10));
    assert_eq!(state.forwarded_port, 51413);
    assert!(!state.forced_retry);
    // the reset forgot the port, so it was pushed again after the restart
    assert_eq!(peer.pushed(), vec![51413, 51413]);
}

#[tokio::test(start_paused = true)]
async fn test_open_port_resets_failures() {
    let (_sidecar, peer, mut controller) = setup(FakeSidecar::with_port(40000));
    let settings = threshold(5);
    peer.script([PortAnswer::Open(false), PortAnswer::Open(true)]);

    controller.check(&settings, at(1)).await.unwrap();
    assert_eq!(controller.state().consecutive_port_check_failures, 1);
    controller.check(&settings, at(2)).await.unwrap();
    assert_eq!(controller.state().consecutive_port_check_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_tunnel_never_up_sets_forced_retry() {
    let sidecar = FakeSidecar::with_port(51413);
    sidecar.script_status(std::iter::repeat(Ok(TunnelStatus::Stopped)).take(10));
    let (sidecar, peer, controller) = setup(sidecar);
    let mut controller = controller.with_state({
        let mut s = rss2transmission::vpn::VpnTunnelState::new(at(0));
        s.consecutive_port_check_failures = 9;
        s
    });

    let started = tokio::time::Instant::now();
    let err = controller.check(&threshold(2), at(5)).await.unwrap_err();

    assert!(matches!(err, VpnError::TunnelDown { attempts: 10 }));
    assert_eq!(sidecar.status_calls.load(Ordering::SeqCst), 10);
    assert_eq!(started.elapsed(), Duration::from_secs(27));
    assert!(controller.state().forced_retry);
    assert_eq!(
        controller.phase(),
        TunnelPhase::RotationFailed { forced_retry: true }
    );
    // aborted before the port check
    assert_eq!(peer.port_tests.load(Ordering::SeqCst), 0);

    // forced retry rotates again even though no trigger is configured
    controller.check(&threshold(0), at(100)).await.unwrap();
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 2);
    assert!(!controller.state().forced_retry);
    assert_eq!(controller.state().last_rotation_at, at(100));
}

#[tokio::test(start_paused = true)]
async fn test_status_errors_count_as_down() {
    let sidecar = FakeSidecar::with_port(51413);
    sidecar.script_status([Err(503), Err(503), Ok(TunnelStatus::Running)]);
    let (sidecar, _peer, mut controller) = setup(sidecar);
    controller = controller.with_state({
        let mut s = rss2transmission::vpn::VpnTunnelState::new(at(0));
        s.forced_retry = true;
        s
    });

    controller.check(&threshold(0), at(1)).await.unwrap();
    assert_eq!(sidecar.status_calls.load(Ordering::SeqCst), 3);
    assert_eq!(controller.phase(), TunnelPhase::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_restart_request_failure_sets_forced_retry() {
    let sidecar = FakeSidecar {
        restart_fails: true,
        ..FakeSidecar::with_port(51413)
    };
    let (sidecar, _peer, mut controller) = setup(sidecar);
    let settings = RotationSettings {
        interval: ChronoDuration::hours(1),
        failure_threshold: 0,
    };

    let err = controller.check(&settings, at(3_600)).await.unwrap_err();
    assert!(matches!(err, VpnError::Restart(_)));
    assert!(controller.state().forced_retry);
    assert_eq!(sidecar.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_interval_rotation() {
    let (sidecar, _peer, mut controller) = setup(FakeSidecar::with_port(51413));
    let settings = RotationSettings {
        interval: ChronoDuration::hours(1),
        failure_threshold: 0,
    };

    controller.check(&settings, at(3_599)).await.unwrap();
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 0);

    controller.check(&settings, at(3_600)).await.unwrap();
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(controller.state().last_rotation_at, at(3_600));
}

#[tokio::test(start_paused = true)]
async fn test_interval_past_calendar_range_never_rotates() {
    let (sidecar, _peer, mut controller) = setup(FakeSidecar::with_port(51413));
    let settings = RotationSettings {
        interval: ChronoDuration::weeks(100_000_000),
        failure_threshold: 0,
    };

    controller.check(&settings, at(10)).await.unwrap();
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(controller.phase(), TunnelPhase::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_failure_count_saturates() {
    let (sidecar, peer, controller) = setup(FakeSidecar::with_port(51413));
    let mut controller = controller.with_state({
        let mut s = rss2transmission::vpn::VpnTunnelState::new(at(0));
        s.consecutive_port_check_failures = u32::MAX;
        s
    });
    peer.script([PortAnswer::Open(false)]);

    controller.check(&threshold(0), at(1)).await.unwrap();
    assert_eq!(controller.state().consecutive_port_check_failures, u32::MAX);
    assert_eq!(sidecar.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_forwarded_port_is_not_pushed() {
    let (sidecar, peer, mut controller) = setup(FakeSidecar::with_port(0));
    peer.script([PortAnswer::Open(false)]);

    let err = controller.check(&threshold(3), at(1)).await.unwrap_err();
    match err {
        VpnError::PortUpdate { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, VpnError::PortUnknown));
        }
        other => panic!("Expected PortUpdate, got {:?}", other),
    }
    assert_eq!(sidecar.port_calls.load(Ordering::SeqCst), 3);
    assert!(peer.pushed().is_empty());
    assert_eq!(controller.state().forwarded_port, -1);
    assert_eq!(controller.state().consecutive_port_check_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_port_update_failure_after_rotation_keeps_forced_retry_clear() {
    let (_sidecar, peer, mut controller) = setup(FakeSidecar::with_port(0));
    controller = controller.with_state({
        let mut s = rss2transmission::vpn::VpnTunnelState::new(at(0));
        s.forced_retry = true;
        s
    });

    let err = controller.check(&threshold(0), at(50)).await.unwrap_err();
    assert!(matches!(err, VpnError::PortUpdate { attempts: 3, .. }));
    assert!(!controller.state().forced_retry);
    assert_eq!(controller.state().last_rotation_at, at(50));
    assert_eq!(
        controller.phase(),
        TunnelPhase::RotationFailed { forced_retry: false }
    );
    assert_eq!(peer.port_tests.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_port_test_retries_transport_errors_only() {
    let (_sidecar, peer, mut controller) = setup(FakeSidecar::with_port(51413));
    peer.script([
        PortAnswer::Transport,
        PortAnswer::Transport,
        PortAnswer::Transport,
    ]);

    let err = controller.check(&threshold(2), at(1)).await.unwrap_err();
    assert!(matches!(err, VpnError::PortTest { attempts: 3, .. }));
    assert_eq!(peer.port_tests.load(Ordering::SeqCst), 3);
    // no definitive answer, so no failure is counted
    assert_eq!(controller.state().consecutive_port_check_failures, 0);

    peer.script([PortAnswer::Rejected]);
    let err = controller.check(&threshold(2), at(2)).await.unwrap_err();
    assert!(matches!(err, VpnError::PortTest { attempts: 1, .. }));
    assert_eq!(peer.port_tests.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_port_test_error_then_open() {
    let (_sidecar, peer, mut controller) = setup(FakeSidecar::with_port(51413));
    peer.script([PortAnswer::Transport, PortAnswer::Open(true)]);

    controller.check(&threshold(2), at(1)).await.unwrap();
    assert_eq!(peer.port_tests.load(Ordering::SeqCst), 2);
    assert_eq!(controller.phase(), TunnelPhase::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_changed_forwarded_port_is_pushed() {
    let (sidecar, peer, mut controller) = setup(FakeSidecar::with_port(1111));
    peer.script([PortAnswer::Open(false), PortAnswer::Open(false)]);

    controller.check(&threshold(5), at(1)).await.unwrap();
    *sidecar.port.lock().unwrap() = 2222;
    controller.check(&threshold(5), at(2)).await.unwrap();

    assert_eq!(peer.pushed(), vec![1111, 2222]);
    assert_eq!(controller.state().forwarded_port, 2222);
}
