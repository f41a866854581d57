use crate::error::FrameError;

use nom::{
    number::complete::{le_u16, le_u32, u8 as byte},
    sequence::tuple,
    IResult,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const START: u8 = 0xA5;
pub const END: u8 = 0x15;

/// start + length + control + sequence + serial
pub const HEADER_LEN: usize = 11;
/// header + checksum + end, i.e. a frame with an empty payload
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 2;

/// Payload frame type for tunnelled Modbus traffic.
pub const FRAME_TYPE_INVERTER: u8 = 0x02;

// frame type, sensor type (u16), total working time, power on time, offset time
const REQUEST_PREFIX_LEN: usize = 15;
// frame type, status, the same three time fields
const RESPONSE_PREFIX_LEN: usize = 14;

const ACK_OFFSET: u16 = 0x3000;

// {{{ ControlCode
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlCode {
    Request = 0x4510,
    Response = 0x1510,
    // sent by the logger on its own
    Hello = 0x4110,
    DataReport = 0x4210,
    WifiInfo = 0x4310,
    Heartbeat = 0x4710,
    Report = 0x4810,
}

impl ControlCode {
    pub fn is_unsolicited(self) -> bool {
        !matches!(self, Self::Request | Self::Response)
    }

    /// Control code of the reply the logger expects for an unsolicited frame.
    pub fn ack(self) -> u16 {
        u16::from(self) - ACK_OFFSET
    }
}
// }}}

/// Sum of every byte between the start delimiter and the checksum, mod 256.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

// {{{ V5Frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct V5Frame {
    pub control: u16,
    pub sequence: u16,
    pub serial: u32,
    pub payload: Vec<u8>,
}

impl V5Frame {
    pub fn new(control: ControlCode, sequence: u16, serial: u32, payload: Vec<u8>) -> Self {
        Self {
            control: control.into(),
            sequence,
            serial,
            payload,
        }
    }

    pub fn control_code(&self) -> Option<ControlCode> {
        ControlCode::try_from(self.control).ok()
    }

    /// Low byte of the sequence field; the only part the client owns.
    pub fn sequence_low(&self) -> u8 {
        self.sequence as u8
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        r.push(START);
        r.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        r.extend_from_slice(&self.control.to_le_bytes());
        r.extend_from_slice(&self.sequence.to_le_bytes());
        r.extend_from_slice(&self.serial.to_le_bytes());
        r.extend_from_slice(&self.payload);
        r.push(checksum(&r[1..]));
        r.push(END);
        r
    }
} // }}}

fn header(input: &[u8]) -> IResult<&[u8], (u8, u16, u16, u16, u32)> {
    tuple((byte, le_u16, le_u16, le_u16, le_u32))(input)
}

/// Encodes and validates V5 envelopes for one logger.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    serial: u32,
}

impl FrameCodec {
    pub fn new(serial: u32) -> Self {
        Self { serial }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn encode(&self, sequence: u16, payload: &[u8]) -> Vec<u8> {
        V5Frame::new(ControlCode::Request, sequence, self.serial, payload.to_vec()).encode()
    }

    /// Validate a complete frame in this order: size, delimiters, length,
    /// checksum, serial. The payload is untouched until all of them pass.
    pub fn decode(&self, bytes: &[u8]) -> Result<V5Frame, FrameError> {
        let len = bytes.len();
        if len < MIN_FRAME_LEN {
            return Err(FrameError::TooShort(len));
        }
        if bytes[0] != START || bytes[len - 1] != END {
            return Err(FrameError::BadDelimiter);
        }

        let (_, (_, declared, control, sequence, serial)) =
            header(bytes).map_err(|_| FrameError::TooShort(len))?;
        let declared = usize::from(declared);
        let actual = len - MIN_FRAME_LEN;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let expected = checksum(&bytes[1..len - 2]);
        let got = bytes[len - 2];
        if got != expected {
            return Err(FrameError::ChecksumMismatch { got, expected });
        }

        if serial != self.serial {
            return Err(FrameError::SerialMismatch {
                got: serial,
                expected: self.serial,
            });
        }

        Ok(V5Frame {
            control,
            sequence,
            serial,
            payload: bytes[HEADER_LEN..len - 2].to_vec(),
        })
    }

    /// Wrap a Modbus RTU frame in a request envelope.
    pub fn wrap_request(&self, sequence: u16, modbus: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(REQUEST_PREFIX_LEN + modbus.len());
        payload.push(FRAME_TYPE_INVERTER);
        payload.extend_from_slice(&[0; REQUEST_PREFIX_LEN - 1]);
        payload.extend_from_slice(modbus);
        self.encode(sequence, &payload)
    }

    /// The Modbus RTU frame carried by a response envelope.
    pub fn unwrap_response<'a>(&self, frame: &'a V5Frame) -> Result<&'a [u8], FrameError> {
        if frame.control_code() != Some(ControlCode::Response) {
            return Err(FrameError::UnexpectedControlCode(frame.control));
        }
        if frame.payload.len() < RESPONSE_PREFIX_LEN {
            return Err(FrameError::TooShort(HEADER_LEN + frame.payload.len() + 2));
        }
        if frame.payload[0] != FRAME_TYPE_INVERTER {
            return Err(FrameError::UnexpectedFrameType(frame.payload[0]));
        }
        Ok(&frame.payload[RESPONSE_PREFIX_LEN..])
    }

    /// Build a response envelope around `modbus`, as the logger would.
    pub fn wrap_response(&self, sequence: u16, modbus: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(RESPONSE_PREFIX_LEN + modbus.len());
        payload.push(FRAME_TYPE_INVERTER);
        payload.push(0x01); // status
        payload.extend_from_slice(&[0; RESPONSE_PREFIX_LEN - 2]);
        payload.extend_from_slice(modbus);
        V5Frame::new(ControlCode::Response, sequence, self.serial, payload).encode()
    }

    /// Acknowledgement for an unsolicited logger frame, `None` for anything
    /// that needs no reply.
    pub fn acknowledge(&self, frame: &V5Frame, now: u32) -> Option<Vec<u8>> {
        let code = frame.control_code().filter(|c| c.is_unsolicited())?;

        let mut payload = Vec::with_capacity(10);
        payload.push(frame.payload.first().copied().unwrap_or(0));
        payload.push(0x01);
        payload.extend_from_slice(&now.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());

        Some(
            V5Frame {
                control: code.ack(),
                sequence: frame.sequence,
                serial: self.serial,
                payload,
            }
            .encode(),
        )
    }

    /// The offset of the Modbus frame inside a whole response frame.
    pub const fn response_modbus_offset() -> usize {
        HEADER_LEN + RESPONSE_PREFIX_LEN
    }

    /// Parse a request envelope the way the logger would. Returns the
    /// sequence and the Modbus RTU frame.
    pub fn unwrap_request(&self, bytes: &[u8]) -> Result<(u16, Vec<u8>), FrameError> {
        let frame = self.decode(bytes)?;
        if frame.control_code() != Some(ControlCode::Request) {
            return Err(FrameError::UnexpectedControlCode(frame.control));
        }
        if frame.payload.len() < REQUEST_PREFIX_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if frame.payload[0] != FRAME_TYPE_INVERTER {
            return Err(FrameError::UnexpectedFrameType(frame.payload[0]));
        }
        Ok((frame.sequence, frame.payload[REQUEST_PREFIX_LEN..].to_vec()))
    }
}
