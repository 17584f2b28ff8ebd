use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DagsError;
use crate::protocol::message::Envelope;

/// Refuse frames larger than this; a length prefix beyond it is treated as
/// a corrupt stream, not a big message.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LEN_BYTES: usize = 4;

/// Framing: u32 big-endian body length, one byte holding the zlib level the
/// body was compressed with (0 = stored raw), then the body. The body is a
/// JSON [`Envelope`].
#[derive(Debug)]
pub struct WireCodec {
    /// zlib level applied to outgoing frames, 0-9
    pub outbound_level: u32,
    max_frame: usize,
}

impl WireCodec {
    pub fn new(outbound_level: u32) -> Self {
        Self {
            outbound_level: outbound_level.min(9),
            max_frame: MAX_FRAME_BYTES,
        }
    }

    #[cfg(test)]
    fn with_max_frame(outbound_level: u32, max_frame: usize) -> Self {
        Self {
            outbound_level,
            max_frame,
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Encoder<Envelope> for WireCodec {
    type Error = DagsError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let raw = serde_json::to_vec(&item)?;
        let (level, body) = if self.outbound_level > 0 {
            let mut enc = ZlibEncoder::new(
                Vec::with_capacity(raw.len() / 2),
                Compression::new(self.outbound_level),
            );
            enc.write_all(&raw)?;
            (self.outbound_level as u8, enc.finish()?)
        } else {
            (0u8, raw)
        };

        let len = body.len() + 1;
        if len > self.max_frame {
            return Err(DagsError::Protocol(format!(
                "outgoing frame of {len} bytes exceeds limit {}",
                self.max_frame
            )));
        }
        dst.reserve(LEN_BYTES + len);
        dst.put_u32(len as u32);
        dst.put_u8(level);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Envelope;
    type Error = DagsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_BYTES {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&src[..LEN_BYTES]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            return Err(DagsError::Protocol("empty frame".to_string()));
        }
        if len > self.max_frame {
            return Err(DagsError::Protocol(format!(
                "incoming frame of {len} bytes exceeds limit {}",
                self.max_frame
            )));
        }
        if src.len() < LEN_BYTES + len {
            src.reserve(LEN_BYTES + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_BYTES);
        let level = src[0];
        let body = src[1..len].to_vec();
        src.advance(len);

        let raw = if level > 0 {
            let mut dec = ZlibDecoder::new(body.as_slice());
            let mut out = Vec::with_capacity(body.len() * 2);
            dec.read_to_end(&mut out)
                .map_err(|e| DagsError::Protocol(format!("zlib inflate failed: {e}")))?;
            out
        } else {
            body
        };
        let envelope = serde_json::from_slice(&raw)?;
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Body, RequestKind};
    use crate::protocol::wire;

    fn envelope() -> Envelope {
        Envelope {
            client_id: 1,
            kind: RequestKind::State,
            code: wire::NO_ERROR,
            app_name: "onemax".to_string(),
            version: "0.1.0".to_string(),
            compression: 0,
            group_id: None,
            generation: None,
            body: Body::text("x".repeat(2048)),
        }
    }

    #[test]
    fn round_trip_uncompressed() {
        let mut codec = WireCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(envelope(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, envelope());
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trip_compressed() {
        let mut codec = WireCodec::new(6);
        let mut buf = BytesMut::new();
        codec.encode(envelope(), &mut buf).unwrap();
        // 2 KiB of a single repeated byte must shrink under zlib
        assert!(buf.len() < 2048);
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, envelope());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = WireCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(envelope(), &mut buf).unwrap();

        let tail = buf.split_off(buf.len() / 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.unsplit(tail);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = WireCodec::with_max_frame(0, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 1024]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn garbage_body_rejected() {
        let mut codec = WireCodec::new(0);
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(0);
        buf.extend_from_slice(b"{{{");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = WireCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(envelope(), &mut buf).unwrap();
        codec.encode(envelope(), &mut buf).unwrap();
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
