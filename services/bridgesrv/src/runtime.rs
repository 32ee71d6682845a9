//! Host loop driving the engine on a fixed tick

use std::time::Duration;

use errors::{BridgeError, BridgeResult};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapters::{RtuMasterAdapter, TcpServerAdapter};
use crate::bridge::{Bridge, BridgeSettings, BridgeStats};
use crate::config::BridgeConfig;
use crate::transport::{NetworkTransport, RestartAction, SerialTransport, SystemClock};

/// Restart action that stops the host loop
///
/// The process then exits with [`BridgeError::WatchdogRestart`] and the
/// supervisor starts it again.
#[derive(Debug)]
pub struct CancelRestart {
    token: CancellationToken,
    requested: Option<Duration>,
}

impl CancelRestart {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            requested: None,
        }
    }

    /// How long the queue was stuck when the restart was requested
    pub fn requested(&self) -> Option<Duration> {
        self.requested
    }
}

impl RestartAction for CancelRestart {
    fn request_restart(&mut self, stuck_for: Duration) {
        self.requested = Some(stuck_for);
        self.token.cancel();
    }
}

/// Open the configured transports and run until shutdown or restart
pub async fn run(config: &BridgeConfig, shutdown: CancellationToken) -> BridgeResult<BridgeStats> {
    let network = TcpServerAdapter::bind(&config.network, shutdown.child_token()).await?;
    let serial = RtuMasterAdapter::open(&config.serial, shutdown.child_token())?;
    run_with(
        network,
        serial,
        config.bridge.settings(),
        config.bridge.tick_interval(),
        shutdown,
    )
    .await
}

/// Run the engine over the given transports
pub async fn run_with<N, S>(
    network: N,
    serial: S,
    settings: BridgeSettings,
    tick: Duration,
    shutdown: CancellationToken,
) -> BridgeResult<BridgeStats>
where
    N: NetworkTransport,
    S: SerialTransport,
{
    let restart = CancelRestart::new(shutdown.clone());
    let mut bridge = Bridge::new(network, serial, restart, SystemClock, settings)?;

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Bridge running, tick {} ms", tick.as_millis());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => bridge.task(),
        }
    }

    let stats = *bridge.stats();
    info!("Bridge stopped: {}", stats);

    match bridge.restart_action().requested() {
        Some(stuck_for) => {
            error!("Exiting for restart");
            Err(BridgeError::WatchdogRestart {
                elapsed_ms: stuck_for.as_millis() as u64,
            })
        },
        None => Ok(stats),
    }
}
