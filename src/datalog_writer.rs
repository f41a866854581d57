use crate::prelude::*;
use crate::derived::DerivedMetrics;
use crate::solarman::session::DecodedSnapshot;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    lines_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        info!("Successfully opened datalog file with permissions 0644");

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            lines_written: Arc::new(Mutex::new(0)),
        })
    }

    /// Append snapshots from `channels` until `shutdown` fires.
    pub async fn start(&self, channels: Channels, settings: config::Derived, shutdown: CancellationToken) -> Result<()> {
        let mut receiver = channels.from_inverter.subscribe();

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = receiver.recv() => message,
            };

            match message {
                Ok(ChannelData::Snapshot(serial, snapshot)) => {
                    let derived = DerivedMetrics::compute(&snapshot, &settings);
                    if let Err(e) = self.write_snapshot(serial, &snapshot, &derived) {
                        error!("Failed to write snapshot for logger {}: {}", serial, e);
                    }
                }
                Ok(ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("datalog writer lagged, {} snapshots dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("datalog writer exiting");
        Ok(())
    }

    pub fn write_snapshot(&self, serial: u32, snapshot: &DecodedSnapshot, derived: &DerivedMetrics) -> Result<()> {
        let mut json_data = serde_json::Map::new();
        json_data.insert(
            "utc_timestamp".to_string(),
            serde_json::Value::Number(snapshot.timestamp.timestamp().into()),
        );
        json_data.insert("serial".to_string(), serde_json::Value::Number(serial.into()));
        json_data.insert("values".to_string(), serde_json::to_value(&snapshot.values)?);
        if !derived.is_empty() {
            json_data.insert("derived".to_string(), serde_json::to_value(derived)?);
        }

        let json_string = serde_json::to_string(&serde_json::Value::Object(json_data))?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Failed to lock datalog file"))?;
        match writeln!(file, "{}", json_string) {
            Ok(_) => {
                if let Err(e) = file.flush() {
                    error!("Failed to flush datalog file {}: {}", self.path, e);
                    return Err(e.into());
                }

                let mut lines_written = self
                    .lines_written
                    .lock()
                    .map_err(|_| anyhow!("Failed to lock line counter"))?;
                *lines_written += 1;
                debug!("Snapshots stored in datalog file: {}", *lines_written);

                Ok(())
            }
            Err(e) => {
                error!("Failed to write to datalog file {}: {}", self.path, e);
                Err(e.into())
            }
        }
    }
}
