use crate::prelude::*;
use crate::solarman::session::DecodedSnapshot;

use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ChannelData {
    /// A fresh snapshot from the logger with this serial.
    Snapshot(u32, Arc<DecodedSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_inverter: broadcast::Sender<ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_inverter: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
