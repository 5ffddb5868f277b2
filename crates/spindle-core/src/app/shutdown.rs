//! ShutdownCoordinator - OS シグナルを 2 段階の停止要求に変換する
//!
//! 1 回目の SIGINT/SIGTERM で graceful トークンを cancel（新規 fetch を止め、
//! 実行中 job の完了を待つ）。2 回目で force トークンを cancel
//! （実行中 handler を打ち切る。job は `running` のまま残り stalled として回収される）。

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Graceful,
    Force,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    graceful: CancellationToken,
    force: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinator without signal handling; drive it with `trigger()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for SIGINT/SIGTERM (ctrl-c off unix) in a background task.
    pub fn install() -> Self {
        let coordinator = Self::new();
        tokio::spawn(listen_signals(coordinator.clone()));
        coordinator
    }

    /// 1 回目は graceful、以降は force
    pub fn trigger(&self) -> ShutdownPhase {
        if self.graceful.is_cancelled() {
            self.force.cancel();
            ShutdownPhase::Force
        } else {
            self.graceful.cancel();
            ShutdownPhase::Graceful
        }
    }

    pub fn graceful(&self) -> CancellationToken {
        self.graceful.clone()
    }

    pub fn force(&self) -> CancellationToken {
        self.force.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.graceful.is_cancelled()
    }
}

fn on_signal(coordinator: &ShutdownCoordinator, name: &str) -> ShutdownPhase {
    let phase = coordinator.trigger();
    match phase {
        ShutdownPhase::Graceful => {
            info!(signal = name, "Received {name}, initiating graceful shutdown");
        }
        ShutdownPhase::Force => {
            warn!(signal = name, "Received {name} again, aborting running jobs");
        }
    }
    phase
}

#[cfg(unix)]
async fn listen_signals(coordinator: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                tracing::error!(error = %err, "Failed to install signal handlers");
                return;
            }
        };

    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        if on_signal(&coordinator, name) == ShutdownPhase::Force {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn listen_signals(coordinator: ShutdownCoordinator) {
    loop {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for ctrl-c");
            return;
        }
        if on_signal(&coordinator, "ctrl-c") == ShutdownPhase::Force {
            break;
        }
    }
}
