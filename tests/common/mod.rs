#![allow(dead_code)]

use solarman_bridge::error::TransportError;
use solarman_bridge::register::{Catalog, RegisterSet, RegisterSpec, ValueKind, WordOrder};
use solarman_bridge::solarman::decoder::V5FrameDecoder;
use solarman_bridge::solarman::frame::{ControlCode, FrameCodec, V5Frame};
use solarman_bridge::solarman::modbus::{encode_exception_response, encode_read_response, ReadFunction, ReadRequest};
use solarman_bridge::solarman::session::SessionConfig;
use solarman_bridge::solarman::transport::Connector;

use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;

pub const SERIAL: u32 = 2_712_345_678;
pub const SLAVE_ID: u8 = 1;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the fake logger does with the next request it receives.
#[derive(Clone, Debug)]
pub enum Reply {
    Normal,
    Exception(u8),
    /// Read the request and never answer.
    Silence,
    /// Close the connection instead of answering.
    Hangup,
    /// Answer with a broken Modbus CRC.
    CorruptCrc,
    /// Send a response for an older sequence first, then the right one.
    StaleFirst,
    /// Send a heartbeat before the answer.
    HeartbeatFirst,
}

#[derive(Default)]
struct LoggerState {
    registers: HashMap<u16, u16>,
    script: VecDeque<Reply>,
    requests: Vec<(u16, ReadFunction, u16, u16)>,
    frames_from_client: Vec<u16>,
}

/// Plays the logger side of a session over an in-memory duplex pipe.
#[derive(Clone, Default)]
pub struct FakeLogger {
    state: Arc<Mutex<LoggerState>>,
}

impl FakeLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub fn set_registers(&self, values: &[(u16, u16)]) {
        for (address, value) in values {
            self.set_register(*address, *value);
        }
    }

    /// Queue replies for the following requests. Once the queue is empty
    /// every request gets `Reply::Normal`.
    pub fn script(&self, replies: &[Reply]) {
        self.state.lock().unwrap().script.extend(replies.iter().cloned());
    }

    /// `(sequence, function, start, count)` of every request seen so far.
    pub fn requests(&self) -> Vec<(u16, ReadFunction, u16, u16)> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Control codes of every frame the client sent.
    pub fn frames_from_client(&self) -> Vec<u16> {
        self.state.lock().unwrap().frames_from_client.clone()
    }

    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(self, mut stream: S) {
        let codec = FrameCodec::new(SERIAL);
        let mut decoder = V5FrameDecoder::new();
        let mut buf = BytesMut::new();

        loop {
            while let Ok(Some(bytes)) = decoder.decode(&mut buf) {
                let frame = match codec.decode(&bytes) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                self.state.lock().unwrap().frames_from_client.push(frame.control);

                let (sequence, modbus) = match codec.unwrap_request(&bytes) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let request = match ReadRequest::decode(&modbus) {
                    Ok(r) => r,
                    Err(_) => continue,
                };

                let reply = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .requests
                        .push((sequence, request.function, request.start, request.count));
                    state.script.pop_front().unwrap_or(Reply::Normal)
                };

                let normal = codec.wrap_response(sequence, &self.words_for(&request));
                let out = match reply {
                    Reply::Normal => normal,
                    Reply::Exception(code) => {
                        codec.wrap_response(sequence, &encode_exception_response(SLAVE_ID, request.function, code))
                    }
                    Reply::Silence => continue,
                    Reply::Hangup => return,
                    Reply::CorruptCrc => {
                        let mut modbus = self.words_for(&request);
                        let last = modbus.len() - 1;
                        modbus[last] ^= 0xFF;
                        codec.wrap_response(sequence, &modbus)
                    }
                    Reply::StaleFirst => {
                        let mut out = codec.wrap_response(sequence.wrapping_sub(1), &self.words_for(&request));
                        out.extend(normal);
                        out
                    }
                    Reply::HeartbeatFirst => {
                        let mut out = V5Frame::new(ControlCode::Heartbeat, 0x0100, SERIAL, vec![0x00]).encode();
                        out.extend(normal);
                        out
                    }
                };

                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }

            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    fn words_for(&self, request: &ReadRequest) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let words: Vec<u16> = (request.start..request.start + request.count)
            .map(|a| state.registers.get(&a).copied().unwrap_or(0))
            .collect();
        encode_read_response(SLAVE_ID, request.function, &words)
    }
}

/// Hands out in-memory streams served by a `FakeLogger`.
#[derive(Clone)]
pub struct DuplexConnector {
    pub logger: FakeLogger,
    failures: Arc<AtomicUsize>,
    connects: Arc<Mutex<Vec<tokio::time::Instant>>>,
}

impl DuplexConnector {
    pub fn new(logger: FakeLogger) -> Self {
        Self {
            logger,
            failures: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// Time between consecutive connection attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        let times = self.connects.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream, TransportError> {
        self.connects.lock().unwrap().push(tokio::time::Instant::now());
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransportError::Connect {
                addr: self.peer(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let (client, server) = tokio::io::duplex(8192);
        tokio::spawn(self.logger.clone().serve(server));
        Ok(client)
    }

    fn peer(&self) -> String {
        "fake-logger".to_string()
    }
}

pub struct Factory;

impl Factory {
    pub fn session_config() -> SessionConfig {
        SessionConfig {
            slave_id: SLAVE_ID,
            poll_interval: Duration::from_millis(50),
            read_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_millis(300),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            ..SessionConfig::new(SERIAL)
        }
    }

    /// Two polling registers next to each other, one read.
    pub fn small_catalog() -> Catalog {
        Catalog {
            sets: vec![RegisterSet::new(
                Catalog::POLLING,
                ReadFunction::ReadHolding,
                vec![
                    RegisterSpec::new("Battery SOC", 3, ValueKind::Unsigned),
                    RegisterSpec::new("Battery Voltage", 4, ValueKind::scaled(100)),
                ],
            )],
        }
    }

    /// A polling set that needs two reads with a block size of 10, plus
    /// device info and configuration sets.
    pub fn split_catalog() -> Catalog {
        Catalog {
            sets: vec![
                RegisterSet::new(
                    Catalog::POLLING,
                    ReadFunction::ReadHolding,
                    vec![
                        RegisterSpec::new("Grid Power", 0, ValueKind::Signed),
                        RegisterSpec::new("Total PV Energy", 2, ValueKind::scaled(10)).double(WordOrder::LowFirst),
                        RegisterSpec::new("Battery SOC", 40, ValueKind::Unsigned),
                    ],
                ),
                RegisterSet::new(
                    Catalog::DEVICE_INFO,
                    ReadFunction::ReadInput,
                    vec![
                        RegisterSpec::new("Device Type", 100, ValueKind::labels(&[(3, "Single-phase Hybrid")])),
                        RegisterSpec::new("Firmware Major", 101, ValueKind::Unsigned),
                        RegisterSpec::new("Firmware Minor", 102, ValueKind::Unsigned),
                        RegisterSpec::new("Firmware Patch", 103, ValueKind::Unsigned),
                    ],
                ),
                RegisterSet::new(
                    Catalog::CONFIGURATION,
                    ReadFunction::ReadHolding,
                    vec![RegisterSpec::new(
                        "Work mode",
                        142,
                        ValueKind::labels(&[(0, "Selling first"), (1, "Zero export to load")]),
                    )],
                ),
            ],
        }
    }

    pub fn split_session_config() -> SessionConfig {
        SessionConfig {
            max_block_size: 10,
            ..Self::session_config()
        }
    }
}

/// Poll `condition` every few milliseconds until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
