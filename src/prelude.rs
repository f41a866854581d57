pub use crate::channels::{ChannelData, Channels};
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::options::Options;

pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::broadcast;
