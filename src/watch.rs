//! Periodic polling.
//!
//! Uses `tokio::select!` to multiplex:
//! - **Signals**: SIGINT/SIGTERM stop the loop between cycles
//! - **Interval tick**: starts a cycle (the first tick fires immediately)
//!
//! A separate task reloads the configuration on SIGHUP and whenever the
//! config file's modification time changes. Each cycle works on the snapshot
//! it took at its start, so a reload never shows up half-way through a cycle.
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::cache::CacheFile;
use crate::config::ConfigHandle;
use crate::feed::FeedSource;
use crate::poll::{run_cycle, CycleContext, CycleOptions, CycleReport};
use crate::transmission::DownloadClient;
use crate::vpn::{PeerPortClient, RotationController, TunnelSidecar};

/// How often the reload listener checks the config file.
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub cycle: CycleOptions,
    /// Time between the starts of two cycles.
    pub sleep: Duration,
}

/// Everything one watch cycle touches.
pub struct Watcher<'a, S, P> {
    pub handle: ConfigHandle,
    pub cache: &'a mut CacheFile,
    pub source: &'a dyn FeedSource,
    pub client: &'a dyn DownloadClient,
    pub rotation: Option<RotationController<S, P>>,
}

impl<S: TunnelSidecar, P: PeerPortClient> Watcher<'_, S, P> {
    /// Poll every `options.sleep` until SIGINT or SIGTERM.
    pub async fn run(&mut self, options: &WatchOptions) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut sigterm = signal(SignalKind::terminate())?;
        #[cfg(unix)]
        let mut sigint = signal(SignalKind::interrupt())?;

        let mut ticker = tokio::time::interval(options.sleep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(sleep_secs = options.sleep.as_secs(), "Watching feeds");

        loop {
            #[cfg(unix)]
            let sigterm_fut = sigterm.recv();
            #[cfg(not(unix))]
            let sigterm_fut = std::future::pending::<Option<()>>();

            #[cfg(unix)]
            let sigint_fut = sigint.recv();
            #[cfg(not(unix))]
            let sigint_fut = async {
                let _ = tokio::signal::ctrl_c().await;
                Some(())
            };

            tokio::select! {
                biased;

                _ = sigterm_fut => {
                    tracing::info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint_fut => {
                    tracing::info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = ticker.tick() => {
                    self.cycle(&options.cycle).await;
                }
            }
        }

        Ok(())
    }

    /// One feed pass followed by one tunnel check. Failures are logged; the
    /// loop carries on with the next cycle.
    pub async fn cycle(&mut self, options: &CycleOptions) -> Option<CycleReport> {
        let config = self.handle.snapshot();

        let mut ctx = CycleContext {
            config: &config,
            cache: &mut *self.cache,
            source: self.source,
            client: self.client,
            prompter: None,
        };
        let report = match run_cycle(&mut ctx, options, Utc::now()).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Unable to save seen cache, will retry next cycle");
                None
            }
        };

        if let Some(controller) = self.rotation.as_mut() {
            if config.gluetun.is_enabled() {
                match config.gluetun.rotation_settings() {
                    Ok(settings) => {
                        if let Err(e) = controller.check(&settings, Utc::now()).await {
                            tracing::warn!(error = %e, phase = ?controller.phase(), "VPN tunnel check failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Invalid rotation settings"),
                }
            }
        }

        report
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reload `handle` when the file's modification time moved since `last`.
/// Returns true when a new snapshot was installed.
pub fn reload_if_changed(handle: &ConfigHandle, last: &mut Option<SystemTime>) -> bool {
    let current = modified(handle.path());
    if current.is_none() || current == *last {
        return false;
    }
    *last = current;
    reload(handle, "file changed")
}

fn reload(handle: &ConfigHandle, reason: &str) -> bool {
    match handle.reload() {
        Ok(()) => {
            tracing::info!(path = %handle.path().display(), reason, "Reloaded configuration");
            true
        }
        Err(e) => {
            tracing::error!(
                path = %handle.path().display(),
                error = %e,
                "Unable to reload configuration, keeping the previous one"
            );
            false
        }
    }
}

/// Spawn the background reload listener.
pub fn spawn_reload_listener(handle: ConfigHandle, poll: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "Unable to listen for SIGHUP");
                None
            }
        };

        let mut last = modified(handle.path());
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            #[cfg(unix)]
            let hup = async {
                match sighup.as_mut() {
                    Some(s) => s.recv().await,
                    None => std::future::pending().await,
                }
            };
            #[cfg(not(unix))]
            let hup = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = hup => {
                    last = modified(handle.path());
                    reload(&handle, "SIGHUP");
                }
                _ = ticker.tick() => {
                    reload_if_changed(&handle, &mut last);
                }
            }
        }
    })
}
