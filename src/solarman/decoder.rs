use crate::error::TransportError;
use crate::solarman::frame::{MIN_FRAME_LEN, START};

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use tokio_util::codec::Decoder;

pub const MAX_BUFFER_SIZE: usize = 65536;

/// Splits a logger byte stream into whole V5 frames.
///
/// Only the start byte and the length field are looked at here; everything
/// else is checked by `FrameCodec::decode` so that malformed frames surface
/// as frame errors instead of being skipped silently.
#[derive(Default)]
pub struct V5FrameDecoder;

impl V5FrameDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for V5FrameDecoder {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > MAX_BUFFER_SIZE {
            return Err(TransportError::BufferOverflow(src.len()));
        }

        match src.iter().position(|b| *b == START) {
            Some(0) => {}
            Some(n) => {
                debug!("skipping {} bytes before frame start", n);
                src.advance(n);
            }
            None => {
                if !src.is_empty() {
                    debug!("skipping {} bytes with no frame start", src.len());
                    src.clear();
                }
                return Ok(None);
            }
        }

        if src.len() < 3 {
            return Ok(None);
        }

        let frame_len = MIN_FRAME_LEN + usize::from(u16::from_le_bytes([src[1], src[2]]));
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solarman::frame::{ControlCode, V5Frame};

    fn frame(sequence: u16) -> Vec<u8> {
        V5Frame::new(ControlCode::Response, sequence, 42, vec![0x02; 16]).encode()
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut decoder = V5FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(1));
        buf.extend_from_slice(&frame(2));

        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), frame(1).as_slice());
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), frame(2).as_slice());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let mut decoder = V5FrameDecoder::new();
        let whole = frame(1);
        let mut buf = BytesMut::from(&whole[..10]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&whole[10..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), whole.as_slice());
    }

    #[test]
    fn skips_leading_garbage() {
        let mut decoder = V5FrameDecoder::new();
        let mut buf = BytesMut::from(&[0x00, 0x11, 0x22][..]);
        buf.extend_from_slice(&frame(3));
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), frame(3).as_slice());

        let mut buf = BytesMut::from(&[0x00, 0x11][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn refuses_oversized_buffer() {
        let mut decoder = V5FrameDecoder::new();
        let mut buf = BytesMut::from(&vec![START; MAX_BUFFER_SIZE + 1][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(TransportError::BufferOverflow(_))
        ));
    }
}
