use crate::prelude::*;
use crate::catalog;
use crate::error::{ModbusError, PlanError, SessionError, TransportError};
use crate::planner::{ReadBlock, RegisterPlanner, DEFAULT_MAX_BLOCK_SIZE};
use crate::register::Catalog;
use crate::solarman::backoff::Backoff;
use crate::solarman::decoder::V5FrameDecoder;
use crate::solarman::frame::{FrameCodec, V5Frame};
use crate::solarman::modbus::{ReadFunction, ReadRequest};
use crate::solarman::transport::Connector;
use crate::value::{Value, ValueDecoder};

use {
    bytes::BytesMut,
    chrono::{DateTime, Utc},
    serde::Serialize,
    std::collections::{BTreeMap, HashMap},
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::{Arc, Mutex as StdMutex, PoisonError},
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::sync::{watch, Mutex},
    tokio::time::{Instant, MissedTickBehavior},
    tokio_util::codec::Decoder,
    tokio_util::sync::CancellationToken,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Polling,
    /// Connected, but the last cycle could not be decoded.
    Faulted(String),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Ready | Self::Polling | Self::Faulted(_))
    }
}

/// One complete poll cycle. Never modified after it is published.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecodedSnapshot {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, Value>,
}

impl DecodedSnapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_type: Option<String>,
    pub firmware: Option<String>,
}

impl DeviceInfo {
    pub fn from_values(values: &BTreeMap<String, Value>) -> Self {
        let firmware: Option<Vec<i64>> = catalog::FIRMWARE
            .iter()
            .map(|name| values.get(*name).and_then(Value::as_integer))
            .collect();

        Self {
            device_type: values.get(catalog::DEVICE_TYPE).map(|v| v.to_string()),
            firmware: firmware.map(|parts| {
                parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".")
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub connects: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub device_exceptions: u64,
    pub frames_discarded: u64,
    pub acks_sent: u64,
}

impl PollStats {
    pub fn print_summary(&self, serial: u32) {
        info!("Poll statistics for logger {}:", serial);
        info!("  Connections established: {}", self.connects);
        info!("  Poll cycles ok: {}", self.cycles_ok);
        info!("  Poll cycles failed: {}", self.cycles_failed);
        info!("  Device exceptions: {}", self.device_exceptions);
        info!("  Frames discarded: {}", self.frames_discarded);
        info!("  Unsolicited frames acknowledged: {}", self.acks_sent);
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub serial: u32,
    pub slave_id: u8,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_block_size: u16,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl SessionConfig {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            slave_id: 1,
            poll_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }

    pub fn from_inverter(inverter: &config::Inverter) -> Self {
        Self {
            serial: inverter.serial(),
            slave_id: inverter.slave_id(),
            poll_interval: inverter.poll_interval(),
            read_timeout: inverter.read_timeout(),
            write_timeout: inverter.write_timeout(),
            max_block_size: inverter.max_block_size(),
            backoff_initial: inverter.backoff_initial(),
            backoff_max: inverter.backoff_max(),
        }
    }
}

struct Link<S> {
    stream: S,
    buf: BytesMut,
    decoder: V5FrameDecoder,
    sequence: u8,
}

impl<S> Link<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            decoder: V5FrameDecoder::new(),
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

struct Plan {
    function: ReadFunction,
    blocks: Vec<ReadBlock>,
}

/// One logger connection and everything polled over it.
///
/// All methods take `&self`; share the session in an `Arc` to poll and
/// `close()` from different tasks. Reads on the connection are serialised by
/// the link mutex, which doubles as the poll-in-progress guard.
pub struct InverterSession<C: Connector> {
    connector: C,
    config: SessionConfig,
    codec: FrameCodec,
    plans: HashMap<String, Plan>,
    link: Mutex<Option<Link<C::Stream>>>,
    state: watch::Sender<SessionState>,
    snapshot: watch::Sender<Option<Arc<DecodedSnapshot>>>,
    device_info: watch::Sender<Option<DeviceInfo>>,
    device_info_read: AtomicBool,
    cancel: StdMutex<CancellationToken>,
    stats: StdMutex<PollStats>,
}

impl<C: Connector> InverterSession<C> {
    /// Plans every register set of `catalog` up front; the plans live as
    /// long as the session.
    pub fn new(connector: C, config: SessionConfig, catalog: &Catalog) -> Result<Self, PlanError> {
        let mut plans = HashMap::new();
        for set in &catalog.sets {
            let blocks = RegisterPlanner::plan(&set.registers, config.max_block_size)?;
            debug!(
                "logger {}: register set {} planned as {} reads {:?}",
                config.serial,
                set.name,
                blocks.len(),
                blocks.iter().map(|b| (b.start, b.count)).collect::<Vec<_>>()
            );
            plans.insert(
                set.name.clone(),
                Plan {
                    function: set.function,
                    blocks,
                },
            );
        }

        Ok(Self {
            connector,
            codec: FrameCodec::new(config.serial),
            config,
            plans,
            link: Mutex::new(None),
            state: watch::channel(SessionState::Disconnected).0,
            snapshot: watch::channel(None).0,
            device_info: watch::channel(None).0,
            device_info_read: AtomicBool::new(false),
            cancel: StdMutex::new(CancellationToken::new()),
            stats: StdMutex::new(PollStats::default()),
        })
    }

    pub fn serial(&self) -> u32 {
        self.config.serial
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Option<Arc<DecodedSnapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Option<Arc<DecodedSnapshot>>> {
        self.snapshot.subscribe()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.borrow().clone()
    }

    pub fn stats(&self) -> PollStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of reads one cycle of `set` takes.
    pub fn planned_reads(&self, set: &str) -> Option<usize> {
        self.plans.get(set).map(|p| p.blocks.len())
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut guard = self.link.lock().await;
        *guard = None;

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        self.set_state(SessionState::Connecting);
        info!("logger {}: connecting to {}", self.config.serial, self.connector.peer());

        let result = tokio::select! {
            _ = token.cancelled() => Err(TransportError::Cancelled),
            r = self.connector.connect() => r,
        };

        match result {
            Ok(stream) => {
                // fresh link, fresh sequence counter
                *guard = Some(Link::new(stream));
                self.update_stats(|s| s.connects += 1);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Drop the connection. Any read or write in flight fails with
    /// `TransportError::Cancelled`. `connect()` may be called again later.
    pub fn close(&self) {
        self.token().cancel();
        if let Ok(mut guard) = self.link.try_lock() {
            *guard = None;
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Run one poll cycle over the polling set and publish the result.
    ///
    /// Either every block is read and a new snapshot replaces the old one,
    /// or the old snapshot stays. A block the device rejects with an
    /// exception keeps its previous values while the rest update.
    pub async fn poll(&self) -> Result<Arc<DecodedSnapshot>, SessionError> {
        let mut guard = self.link.try_lock().map_err(|_| SessionError::PollInProgress)?;
        let previous = self.snapshot();

        let outcome = match guard.as_mut() {
            None => Err(TransportError::NotConnected.into()),
            Some(link) => {
                self.set_state(SessionState::Polling);
                self.read_set(link, Catalog::POLLING, previous.as_deref()).await
            }
        };
        let values = match outcome {
            Ok(values) => values,
            Err(e) => return Err(self.fail(&mut guard, e)),
        };

        let snapshot = Arc::new(DecodedSnapshot {
            timestamp: Utc::now(),
            values,
        });
        self.snapshot.send_replace(Some(snapshot.clone()));
        self.update_stats(|s| s.cycles_ok += 1);
        self.set_state(SessionState::Ready);
        debug!("logger {}: polled {} values", self.config.serial, snapshot.values.len());

        if self.plans.contains_key(Catalog::DEVICE_INFO) && !self.device_info_read.swap(true, Ordering::SeqCst) {
            if let Some(link) = guard.as_mut() {
                match self.read_set(link, Catalog::DEVICE_INFO, None).await {
                    Ok(values) => {
                        let info = DeviceInfo::from_values(&values);
                        info!(
                            "logger {}: device type {}, firmware {}",
                            self.config.serial,
                            info.device_type.as_deref().unwrap_or("unknown"),
                            info.firmware.as_deref().unwrap_or("unknown")
                        );
                        self.device_info.send_replace(Some(info));
                    }
                    // the snapshot stands, but a broken link must not outlive the cycle
                    Err(e) if e.requires_reconnect() => self.disconnect(&mut guard, &e),
                    Err(e) => debug!("logger {}: could not read device info: {}", self.config.serial, e),
                }
            }
        }

        Ok(snapshot)
    }

    /// Read the configuration set once. Blocks the device rejects are left out.
    pub async fn read_configuration(&self) -> Result<BTreeMap<String, Value>, SessionError> {
        let mut guard = self.link.try_lock().map_err(|_| SessionError::PollInProgress)?;

        let outcome = match guard.as_mut() {
            None => Err(TransportError::NotConnected.into()),
            Some(link) => {
                self.set_state(SessionState::Polling);
                self.read_set(link, Catalog::CONFIGURATION, None).await
            }
        };
        match outcome {
            Ok(values) => {
                self.set_state(SessionState::Ready);
                Ok(values)
            }
            Err(e) => Err(self.fail(&mut guard, e)),
        }
    }

    /// Connect, poll every `poll_interval` and reconnect with backoff until
    /// `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.state().is_connected() {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = self.connect() => r,
                };
                if let Err(e) = result {
                    error!("logger {}: {}", self.config.serial, e);
                    if self.wait_to_reconnect(&mut backoff, &shutdown).await {
                        continue;
                    }
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // failures are logged and reflected in the state by poll()
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.poll() => r,
            };
            match result {
                Ok(_) => backoff.reset(),
                Err(e) if e.requires_reconnect() => {
                    if !self.wait_to_reconnect(&mut backoff, &shutdown).await {
                        break;
                    }
                }
                Err(_) => {}
            }
        }

        info!("logger {}: shutting down", self.config.serial);
        self.close();
        self.stats().print_summary(self.config.serial);
    }

    /// Sleep out the next backoff delay. `false` when shutdown came first.
    async fn wait_to_reconnect(&self, backoff: &mut Backoff, shutdown: &CancellationToken) -> bool {
        let delay = backoff.next_delay();
        info!("logger {}: reconnecting in {:?}", self.config.serial, delay);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn read_set(
        &self,
        link: &mut Link<C::Stream>,
        set: &str,
        previous: Option<&DecodedSnapshot>,
    ) -> Result<BTreeMap<String, Value>, SessionError> {
        let mut values = BTreeMap::new();
        let plan = match self.plans.get(set) {
            Some(plan) => plan,
            None => return Ok(values),
        };
        let token = self.token();

        for block in &plan.blocks {
            match self.read_block(link, &token, plan.function, block).await {
                Ok(decoded) => values.extend(decoded),
                Err(SessionError::Modbus(ModbusError::DeviceException(code))) => {
                    warn!(
                        "logger {}: device exception {:#04x} reading {} registers at {}, keeping previous values",
                        self.config.serial, code, block.count, block.start
                    );
                    self.update_stats(|s| s.device_exceptions += 1);
                    if let Some(previous) = previous {
                        for spec in &block.registers {
                            if let Some(value) = previous.get(&spec.name) {
                                values.insert(spec.name.clone(), value.clone());
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(values)
    }

    async fn read_block(
        &self,
        link: &mut Link<C::Stream>,
        token: &CancellationToken,
        function: ReadFunction,
        block: &ReadBlock,
    ) -> Result<BTreeMap<String, Value>, SessionError> {
        let request = ReadRequest::new(self.config.slave_id, function, block.start, block.count);
        let sequence = link.next_sequence();
        let frame = self.codec.wrap_request(u16::from(sequence), &request.encode());

        self.write(link, token, &frame).await?;
        let response = self.read_response(link, token, sequence).await?;
        let modbus = self.codec.unwrap_response(&response)?;
        let words = request.decode_response(modbus)?;

        let expected_len = 5 + 2 * usize::from(block.count);
        if modbus.len() > expected_len {
            debug!(
                "logger {}: ignoring {} bytes after modbus crc",
                self.config.serial,
                modbus.len() - expected_len
            );
        }

        Ok(ValueDecoder::decode(block, &words)?)
    }

    async fn write(
        &self,
        link: &mut Link<C::Stream>,
        token: &CancellationToken,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let limit = self.config.write_timeout;
        let stream = &mut link.stream;
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };

        tokio::select! {
            _ = token.cancelled() => Err(TransportError::Cancelled),
            r = tokio::time::timeout(limit, write) => match r {
                Ok(r) => Ok(r?),
                Err(_) => Err(TransportError::Timeout("write", limit)),
            },
        }
    }

    /// Read until the frame answering `sequence` arrives, acknowledging
    /// unsolicited logger frames and discarding stale responses on the way.
    async fn read_response(
        &self,
        link: &mut Link<C::Stream>,
        token: &CancellationToken,
        sequence: u8,
    ) -> Result<V5Frame, SessionError> {
        let deadline = Instant::now() + self.config.read_timeout;

        loop {
            while let Some(bytes) = link.decoder.decode(&mut link.buf)? {
                let frame = self.codec.decode(&bytes)?;

                if let Some(ack) = self.codec.acknowledge(&frame, Utc::now().timestamp() as u32) {
                    debug!(
                        "logger {}: acknowledging unsolicited frame {:#06x}",
                        self.config.serial, frame.control
                    );
                    self.write(link, token, &ack).await?;
                    self.update_stats(|s| s.acks_sent += 1);
                    continue;
                }

                if frame.sequence_low() != sequence {
                    debug!(
                        "logger {}: discarding frame with sequence {:#06x}, waiting for {:#04x}",
                        self.config.serial, frame.sequence, sequence
                    );
                    self.update_stats(|s| s.frames_discarded += 1);
                    continue;
                }

                return Ok(frame);
            }

            let read = tokio::select! {
                _ = token.cancelled() => return Err(TransportError::Cancelled.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TransportError::Timeout("read", self.config.read_timeout).into())
                }
                r = link.stream.read_buf(&mut link.buf) => r.map_err(TransportError::from)?,
            };
            if read == 0 {
                return Err(TransportError::Closed.into());
            }
        }
    }

    /// Record a failed cycle and move to the state the error calls for.
    fn fail(&self, link: &mut Option<Link<C::Stream>>, err: SessionError) -> SessionError {
        self.update_stats(|s| s.cycles_failed += 1);
        if err.requires_reconnect() {
            self.disconnect(link, &err);
        } else {
            error!("logger {}: {}", self.config.serial, err);
            self.set_state(SessionState::Faulted(err.to_string()));
        }
        err
    }

    fn disconnect(&self, link: &mut Option<Link<C::Stream>>, err: &SessionError) {
        warn!("logger {}: {}, dropping connection", self.config.serial, err);
        *link = None;
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&self, new: SessionState) {
        let old = self.state.send_replace(new.clone());
        if old == new {
            return;
        }
        if old == SessionState::Polling || new == SessionState::Polling {
            debug!("logger {}: {:?} -> {:?}", self.config.serial, old, new);
        } else {
            info!("logger {}: {:?} -> {:?}", self.config.serial, old, new);
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut PollStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterSet, RegisterSpec, ValueKind};
    use crate::solarman::modbus::encode_read_response;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    const SERIAL: u32 = 12345678;

    /// Answers every read with zeroed registers.
    struct ZeroLogger;

    #[async_trait]
    impl Connector for ZeroLogger {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, TransportError> {
            let (client, mut server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let codec = FrameCodec::new(SERIAL);
                let mut decoder = V5FrameDecoder::new();
                let mut buf = BytesMut::new();
                loop {
                    while let Ok(Some(bytes)) = decoder.decode(&mut buf) {
                        let Ok((sequence, modbus)) = codec.unwrap_request(&bytes) else { continue };
                        let Ok(request) = ReadRequest::decode(&modbus) else { continue };
                        let words = vec![0u16; usize::from(request.count)];
                        let reply = codec.wrap_response(
                            sequence,
                            &encode_read_response(request.slave_id, request.function, &words),
                        );
                        if server.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                    match server.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
            Ok(client)
        }

        fn peer(&self) -> String {
            "zero-logger".to_string()
        }
    }

    #[tokio::test]
    async fn decode_error_faults_but_keeps_link() {
        let catalog = Catalog {
            sets: vec![RegisterSet::new(
                Catalog::POLLING,
                ReadFunction::ReadHolding,
                vec![RegisterSpec::new("Battery SOC", 10, ValueKind::Unsigned)],
            )],
        };
        let mut session = InverterSession::new(ZeroLogger, SessionConfig::new(SERIAL), &catalog).unwrap();
        let good = session.plans[Catalog::POLLING].blocks.clone();

        // a block that does not cover its register
        session.plans.get_mut(Catalog::POLLING).unwrap().blocks = vec![ReadBlock {
            start: 10,
            count: 1,
            registers: vec![RegisterSpec::new("Battery SOC", 5, ValueKind::Unsigned)],
        }];

        session.connect().await.unwrap();
        let err = session.poll().await.unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        assert!(matches!(session.state(), SessionState::Faulted(_)));
        assert!(session.link.try_lock().unwrap().is_some());
        assert!(session.snapshot().is_none());
        assert_eq!(session.stats().cycles_failed, 1);

        // polling is allowed again from Faulted, over the same connection
        session.plans.get_mut(Catalog::POLLING).unwrap().blocks = good;
        let snapshot = session.poll().await.unwrap();
        assert_eq!(snapshot.get("Battery SOC"), Some(&Value::Integer(0)));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.stats().connects, 1);
    }

    #[test]
    fn device_info_from_values() {
        let values: BTreeMap<String, Value> = [
            (catalog::DEVICE_TYPE.to_string(), Value::Label("Single-phase Hybrid".to_string())),
            (catalog::FIRMWARE[0].to_string(), Value::Integer(2)),
            (catalog::FIRMWARE[1].to_string(), Value::Integer(0)),
            (catalog::FIRMWARE[2].to_string(), Value::Integer(17)),
        ]
        .into_iter()
        .collect();

        let info = DeviceInfo::from_values(&values);
        assert_eq!(info.device_type.as_deref(), Some("Single-phase Hybrid"));
        assert_eq!(info.firmware.as_deref(), Some("2.0.17"));
    }

    #[test]
    fn firmware_needs_every_part() {
        let values: BTreeMap<String, Value> = [(catalog::FIRMWARE[0].to_string(), Value::Integer(2))]
            .into_iter()
            .collect();
        assert_eq!(DeviceInfo::from_values(&values), DeviceInfo::default());
    }

    #[test]
    fn faulted_counts_as_connected() {
        assert!(SessionState::Faulted("x".to_string()).is_connected());
        assert!(SessionState::Polling.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
    }
}
