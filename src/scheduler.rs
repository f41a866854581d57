use crate::prelude::*;
use crate::register::Catalog;
use crate::solarman::session::{InverterSession, SessionConfig, SessionState};
use crate::solarman::transport::{Connector, TcpConnector};
use crate::error::SessionError;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONFIGURATION_RETRIES: u32 = 5;

/// Runs one session control loop per enabled inverter and forwards their
/// snapshots to `channels.from_inverter`.
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
    catalog: Arc<Catalog>,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, channels: Channels, catalog: Arc<Catalog>) -> Self {
        Self {
            config,
            channels,
            catalog,
        }
    }

    pub fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        let inverters = self.config.enabled_inverters();

        for inverter in &inverters {
            let session = InverterSession::new(
                TcpConnector::new(inverter),
                SessionConfig::from_inverter(inverter),
                &self.catalog,
            )
            .map_err(|e| anyhow!("inverter {}: {}", inverter.serial(), e))?;
            let session = Arc::new(session);

            handles.push(tokio::spawn(forward_snapshots(
                session.clone(),
                self.channels.clone(),
                shutdown.clone(),
            )));
            handles.push(tokio::spawn(log_configuration(session.clone(), shutdown.clone())));

            let run_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { session.run(run_shutdown).await }));
        }

        info!("Started {} inverter sessions", inverters.len());
        Ok(handles)
    }
}

async fn forward_snapshots<C: Connector + 'static>(
    session: Arc<InverterSession<C>>,
    channels: Channels,
    shutdown: CancellationToken,
) {
    let mut snapshots = session.subscribe_snapshot();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let snapshot = snapshots.borrow_and_update().clone();
        if let Some(snapshot) = snapshot {
            // no subscribers is fine
            let _ = channels
                .from_inverter
                .send(ChannelData::Snapshot(session.serial(), snapshot));
        }
    }
}

/// Read the configuration registers once, after the first connection.
async fn log_configuration<C: Connector + 'static>(session: Arc<InverterSession<C>>, shutdown: CancellationToken) {
    let mut state = session.subscribe_state();
    loop {
        if *state.borrow_and_update() == SessionState::Ready {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    for _ in 0..CONFIGURATION_RETRIES {
        match session.read_configuration().await {
            Ok(values) => {
                info!("logger {}: inverter configuration:", session.serial());
                for (name, value) in values {
                    info!("  {}: {}", name, value);
                }
                return;
            }
            Err(SessionError::PollInProgress) => {}
            Err(e) => {
                warn!("logger {}: could not read configuration: {}", session.serial(), e);
                return;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}
