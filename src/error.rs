use thiserror::Error;

/// Problems with the Solarman V5 envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("missing start/end delimiter")]
    BadDelimiter,
    #[error("length mismatch: header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: got {got:#04x}, expected {expected:#04x}")]
    ChecksumMismatch { got: u8, expected: u8 },
    #[error("logger serial mismatch: got {got}, expected {expected}")]
    SerialMismatch { got: u32, expected: u32 },
    #[error("unexpected control code {0:#06x}")]
    UnexpectedControlCode(u16),
    #[error("unexpected frame type {0:#04x}")]
    UnexpectedFrameType(u8),
}

/// Problems with the Modbus RTU frame tunnelled inside a V5 payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    #[error("short frame: need {needed} bytes, have {actual}")]
    ShortFrame { needed: usize, actual: usize },
    #[error("crc mismatch: got {got:#06x}, expected {expected:#06x}")]
    CrcMismatch { got: u16, expected: u16 },
    #[error("slave id mismatch: got {got}, expected {expected}")]
    SlaveIdMismatch { got: u8, expected: u8 },
    #[error("unexpected function code {got:#04x}, expected {expected:#04x}")]
    UnexpectedFunctionCode { got: u8, expected: u8 },
    #[error("register count mismatch: got {actual}, expected {expected}")]
    CountMismatch { expected: u16, actual: u16 },
    #[error("device exception {0:#04x}")]
    DeviceException(u8),
}

impl ModbusError {
    pub fn is_device_exception(&self) -> bool {
        matches!(self, Self::DeviceException(_))
    }
}

/// Planner/response inconsistency. Retrying cannot fix these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("register {name} needs word offset {offset} but block has {available} words")]
    MissingWord {
        name: String,
        offset: usize,
        available: usize,
    },
    #[error("register {name} at {address} lies before block start {start}")]
    OutsideBlock { name: String, address: u16, start: u16 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, std::time::Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("connection cancelled")]
    Cancelled,
    #[error("receive buffer overflow ({0} bytes)")]
    BufferOverflow(usize),
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("max block size must be at least 1")]
    ZeroBlockSize,
    #[error("register {name} is {width} words wide, more than the block size {max}")]
    WiderThanBlock { name: String, width: u16, max: u16 },
    #[error("register {name} at {address} runs past the end of the address space")]
    AddressOverflow { name: String, address: u16 },
    #[error("register {name} overlaps a previous block and does not fit in it")]
    Straddles { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("register set {set}: duplicate register name {name}")]
    DuplicateName { set: String, name: String },
    #[error("register {name}: width must be 1 or 2, got {width}")]
    BadWidth { name: String, width: u16 },
    #[error("register {name}: divisor must not be zero")]
    ZeroDivisor { name: String },
    #[error("register {name}: address {address} + width runs past 65535")]
    AddressOverflow { name: String, address: u16 },
}

/// Everything a poll cycle can fail with, classified for the session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Modbus(#[from] ModbusError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("a poll is already in progress")]
    PollInProgress,
}

impl SessionError {
    /// Failures after which the link is suspect and must be re-established.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Frame(_) => true,
            Self::Modbus(e) => !e.is_device_exception(),
            Self::Decode(_) | Self::Plan(_) | Self::PollInProgress => false,
        }
    }
}
