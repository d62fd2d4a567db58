//! In-memory frame encoding and incremental decoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::FrameError;

/// Splits messages into length-prefixed frames.
pub struct FrameEncoder {
    frame_size: usize,
}

impl FrameEncoder {
    /// Fails when `frame_size` is zero.
    pub fn new(frame_size: usize) -> Result<Self, FrameError> {
        if frame_size == 0 {
            return Err(FrameError::ZeroFrameSize);
        }
        Ok(Self { frame_size })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encodes one message: consecutive frames of at most `frame_size`
    /// payload bytes, then a zero-length terminator.
    pub fn encode(&self, message: &[u8]) -> Bytes {
        let frames = message.len() / self.frame_size + 2;
        let mut out = BytesMut::with_capacity(message.len() + frames * 4);
        for chunk in message.chunks(self.frame_size) {
            out.put_u32(chunk.len() as u32);
            out.put_slice(chunk);
        }
        out.put_u32(0);
        out.freeze()
    }
}

/// Reassembles messages from a stream of raw bytes.
///
/// Feed arbitrary chunks through [`push`](Self::push); each completed
/// message is returned as soon as its zero-length terminator arrives. Call
/// [`finish`](Self::finish) at end of stream to surface trailing-data
/// errors.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    parts: Vec<Bytes>,
    strict_empty: bool,
    seen_message: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`new`](Self::new), but an entirely empty stream is an error at
    /// [`finish`](Self::finish).
    pub fn strict() -> Self {
        Self {
            strict_empty: true,
            ..Self::default()
        }
    }

    /// Consumes raw bytes, returning any messages completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        loop {
            if self.buf.len() < 4 {
                return messages;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if self.buf.len() < 4 + len {
                return messages;
            }
            let _ = self.buf.split_to(4);
            let payload = self.buf.split_to(len).freeze();
            if len == 0 {
                messages.push(self.take_message());
            } else {
                self.parts.push(payload);
            }
        }
    }

    fn take_message(&mut self) -> Bytes {
        self.seen_message = true;
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts.pop().unwrap_or_default(),
            _ => {
                let total = self.parts.iter().map(Bytes::len).sum();
                let mut out = BytesMut::with_capacity(total);
                for part in self.parts.drain(..) {
                    out.extend_from_slice(&part);
                }
                out.freeze()
            }
        }
    }

    /// Signals end of stream. Errors if bytes or payload frames are left
    /// without a terminator, or if nothing arrived in strict-empty mode.
    pub fn finish(self) -> Result<(), FrameError> {
        if !self.buf.is_empty() || !self.parts.is_empty() {
            return Err(FrameError::UnexpectedEnd);
        }
        if self.strict_empty && !self.seen_message {
            return Err(FrameError::EmptyStream);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> (Vec<Bytes>, Result<(), FrameError>) {
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        for chunk in chunks {
            messages.extend(decoder.push(chunk));
        }
        (messages, decoder.finish())
    }

    #[test]
    fn encodes_with_wide_frames() {
        let encoder = FrameEncoder::new(64).unwrap();
        assert_eq!(
            &encoder.encode(&[0, 1])[..],
            &[0, 0, 0, 2, 0, 1, 0, 0, 0, 0]
        );
        assert_eq!(&encoder.encode(&[2])[..], &[0, 0, 0, 1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn encodes_with_short_frames() {
        let encoder = FrameEncoder::new(2).unwrap();
        assert_eq!(
            &encoder.encode(&[0, 1, 2])[..],
            &[0, 0, 0, 2, 0, 1, 0, 0, 0, 1, 2, 0, 0, 0, 0]
        );
        assert_eq!(&encoder.encode(&[2])[..], &[0, 0, 0, 1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        assert!(matches!(
            FrameEncoder::new(0),
            Err(FrameError::ZeroFrameSize)
        ));
    }

    #[test]
    fn decoder_recovers_messages() {
        let encoder = FrameEncoder::new(64).unwrap();
        let wire: Vec<u8> = [encoder.encode(&[0, 1]), encoder.encode(&[2])]
            .iter()
            .flat_map(|b| b.to_vec())
            .collect();
        let (messages, fin) = decode_all(&[&wire]);
        assert_eq!(messages, vec![Bytes::from_static(&[0, 1]), Bytes::from_static(&[2])]);
        fin.unwrap();
    }

    #[test]
    fn roundtrip_across_frame_sizes() {
        let message: Vec<u8> = (0..=255).collect();
        for frame_size in [1, 2, 3, 7, 64, 255, 256, 1024] {
            let encoder = FrameEncoder::new(frame_size).unwrap();
            let wire = encoder.encode(&message);
            let mut decoder = FrameDecoder::new();
            let messages = decoder.push(&wire);
            assert_eq!(messages, vec![Bytes::from(message.clone())], "size {frame_size}");
            decoder.finish().unwrap();
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let encoder = FrameEncoder::new(3).unwrap();
        let wire = encoder.encode(b"hello world");
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        for byte in wire.iter() {
            messages.extend(decoder.push(&[*byte]));
        }
        assert_eq!(messages, vec![Bytes::from_static(b"hello world")]);
        decoder.finish().unwrap();
    }

    #[test]
    fn empty_message_roundtrip() {
        let encoder = FrameEncoder::new(8).unwrap();
        let wire = encoder.encode(&[]);
        assert_eq!(&wire[..], &[0, 0, 0, 0]);
        let (messages, fin) = decode_all(&[&wire]);
        assert_eq!(messages, vec![Bytes::new()]);
        fin.unwrap();
    }

    #[test]
    fn trailing_data_errors() {
        // A payload frame with no terminator.
        let (messages, fin) = decode_all(&[&[0, 0, 0, 1, 7]]);
        assert!(messages.is_empty());
        assert!(matches!(fin, Err(FrameError::UnexpectedEnd)));

        // A partial length prefix.
        let (_, fin) = decode_all(&[&[0, 0]]);
        assert!(matches!(fin, Err(FrameError::UnexpectedEnd)));
    }

    #[test]
    fn strict_mode_rejects_empty_stream() {
        let decoder = FrameDecoder::strict();
        assert!(matches!(decoder.finish(), Err(FrameError::EmptyStream)));

        let mut decoder = FrameDecoder::strict();
        decoder.push(&[0, 0, 0, 0]);
        decoder.finish().unwrap();
    }
}
