use crate::error::ModbusError;

use nom::{
    multi::count,
    number::complete::{be_u16, u8 as byte},
    sequence::tuple,
    IResult,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

// {{{ ReadFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReadFunction {
    ReadHolding = 0x03,
    ReadInput = 0x04,
}
// }}}

pub fn crc(data: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(data).to_le_bytes()
}

fn check_crc(body: &[u8], trailer: &[u8]) -> Result<(), ModbusError> {
    let expected = u16::from_le_bytes(crc(body));
    let got = u16::from_le_bytes([trailer[0], trailer[1]]);
    if got != expected {
        return Err(ModbusError::CrcMismatch { got, expected });
    }
    Ok(())
}

fn short(needed: usize, actual: usize) -> Result<(), ModbusError> {
    if actual < needed {
        return Err(ModbusError::ShortFrame { needed, actual });
    }
    Ok(())
}

fn header(input: &[u8]) -> IResult<&[u8], (u8, u8, u8)> {
    tuple((byte, byte, byte))(input)
}

fn words(input: &[u8], n: usize) -> IResult<&[u8], Vec<u16>> {
    count(be_u16, n)(input)
}

/// A "read registers" request (function 0x03 or 0x04).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadRequest {
    pub slave_id: u8,
    pub function: ReadFunction,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn new(slave_id: u8, function: ReadFunction, start: u16, count: u16) -> Self {
        Self {
            slave_id,
            function,
            start,
            count,
        }
    }

    /// `slave | fc | start (BE) | count (BE) | crc (LE)`
    pub fn encode(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(8);
        r.push(self.slave_id);
        r.push(self.function.into());
        r.extend_from_slice(&self.start.to_be_bytes());
        r.extend_from_slice(&self.count.to_be_bytes());
        let crc = crc(&r);
        r.extend_from_slice(&crc);
        r
    }

    /// Parse a request frame. Used by the fake logger in tests and by anything
    /// that sits on the other end of the wire.
    pub fn decode(frame: &[u8]) -> Result<Self, ModbusError> {
        short(8, frame.len())?;
        check_crc(&frame[..6], &frame[6..8])?;
        let function = ReadFunction::try_from(frame[1]).map_err(|_| ModbusError::UnexpectedFunctionCode {
            got: frame[1],
            expected: ReadFunction::ReadHolding.into(),
        })?;
        Ok(Self {
            slave_id: frame[0],
            function,
            start: u16::from_be_bytes([frame[2], frame[3]]),
            count: u16::from_be_bytes([frame[4], frame[5]]),
        })
    }

    /// Validate a response to this request and return its register words.
    ///
    /// Bytes after the CRC are ignored; some loggers pad their frames.
    pub fn decode_response(&self, frame: &[u8]) -> Result<Vec<u16>, ModbusError> {
        short(5, frame.len())?;
        let (_, (slave_id, function, third)) =
            header(frame).map_err(|_| ModbusError::ShortFrame { needed: 3, actual: frame.len() })?;

        if function & EXCEPTION_FLAG != 0 {
            check_crc(&frame[..3], &frame[3..5])?;
            self.check_header(slave_id, function & !EXCEPTION_FLAG)?;
            return Err(ModbusError::DeviceException(third));
        }

        let byte_count = usize::from(third);
        let body_len = 3 + byte_count;
        short(body_len + 2, frame.len())?;
        check_crc(&frame[..body_len], &frame[body_len..body_len + 2])?;
        self.check_header(slave_id, function)?;

        if byte_count % 2 != 0 || byte_count / 2 != usize::from(self.count) {
            return Err(ModbusError::CountMismatch {
                expected: self.count,
                actual: (byte_count / 2) as u16,
            });
        }

        let (_, words) = words(&frame[3..body_len], byte_count / 2).map_err(|_| ModbusError::ShortFrame {
            needed: body_len,
            actual: frame.len(),
        })?;
        Ok(words)
    }

    fn check_header(&self, slave_id: u8, function: u8) -> Result<(), ModbusError> {
        if slave_id != self.slave_id {
            return Err(ModbusError::SlaveIdMismatch {
                got: slave_id,
                expected: self.slave_id,
            });
        }
        let expected: u8 = self.function.into();
        if function != expected {
            return Err(ModbusError::UnexpectedFunctionCode { got: function, expected });
        }
        Ok(())
    }
}

/// Build a normal read response. The session never sends these; the fake
/// logger used in tests does.
pub fn encode_read_response(slave_id: u8, function: ReadFunction, words: &[u16]) -> Vec<u8> {
    let mut r = Vec::with_capacity(5 + words.len() * 2);
    r.push(slave_id);
    r.push(function.into());
    r.push((words.len() * 2) as u8);
    for word in words {
        r.extend_from_slice(&word.to_be_bytes());
    }
    let crc = crc(&r);
    r.extend_from_slice(&crc);
    r
}

pub fn encode_exception_response(slave_id: u8, function: ReadFunction, code: u8) -> Vec<u8> {
    let mut r = vec![slave_id, u8::from(function) | EXCEPTION_FLAG, code];
    let crc = crc(&r);
    r.extend_from_slice(&crc);
    r
}
