use crate::core::errors::ClientError;
use crate::core::kernel::codec::WsCodec;
use crate::gateway::protocol::GatewayPayload;
use flate2::read::ZlibDecoder;
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Read;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

/// Sync-flush marker ending every complete message on a zlib-stream
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const INFLATE_CHUNK: usize = 16 * 1024;

/// JSON frame codec with optional transport compression.
///
/// In stream mode one inflate context lives for the whole connection and
/// binary frames are buffered until the sync-flush suffix arrives. Otherwise
/// every binary frame is a self-contained zlib payload.
pub struct GatewayCodec {
    stream: bool,
    inflater: Decompress,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for GatewayCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCodec")
            .field("stream", &self.stream)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl GatewayCodec {
    pub fn new(stream: bool) -> Self {
        Self {
            stream,
            inflater: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    pub const fn is_stream(&self) -> bool {
        self.stream
    }

    fn inflate_frame(data: &[u8]) -> Result<String, ClientError> {
        let mut text = String::new();
        ZlibDecoder::new(data)
            .read_to_string(&mut text)
            .map_err(|e| ClientError::ProtocolError(format!("zlib decode failed: {}", e)))?;
        Ok(text)
    }

    fn inflate_stream(&mut self, data: &[u8]) -> Result<Option<String>, ClientError> {
        self.buffer.extend_from_slice(data);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            trace!(buffered = self.buffer.len(), "Awaiting zlib flush");
            return Ok(None);
        }

        let input = std::mem::take(&mut self.buffer);
        let mut out = Vec::with_capacity(input.len() * 4);
        let mut offset = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
            }
            let in_before = self.inflater.total_in();
            let out_before = out.len();

            let result =
                self.inflater
                    .decompress_vec(&input[offset..], &mut out, FlushDecompress::Sync);
            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    self.inflater.reset(true);
                    return Err(ClientError::ProtocolError(format!(
                        "zlib-stream decode failed: {}",
                        e
                    )));
                }
            };
            offset += (self.inflater.total_in() - in_before) as usize;

            let consumed_all = offset >= input.len();
            if status == Status::StreamEnd || (consumed_all && out.len() < out.capacity()) {
                break;
            }
            if self.inflater.total_in() == in_before && out.len() == out_before {
                if consumed_all {
                    break;
                }
                self.inflater.reset(true);
                return Err(ClientError::ProtocolError(
                    "zlib-stream made no progress".to_string(),
                ));
            }
        }

        String::from_utf8(out)
            .map(Some)
            .map_err(|e| ClientError::ProtocolError(format!("Inflated frame is not UTF-8: {}", e)))
    }

    fn parse(text: &str) -> Result<GatewayPayload, ClientError> {
        trace!("Frame: {}", text);
        serde_json::from_str(text)
            .map_err(|e| ClientError::ProtocolError(format!("Malformed frame: {}", e)))
    }
}

impl WsCodec for GatewayCodec {
    type Message = GatewayPayload;

    fn encode_message(&self, message: &GatewayPayload) -> Result<Message, ClientError> {
        Ok(Message::Text(serde_json::to_string(message)?))
    }

    fn decode_message(&mut self, message: Message) -> Result<Option<GatewayPayload>, ClientError> {
        match message {
            Message::Text(text) => Self::parse(&text).map(Some),
            Message::Binary(data) => {
                let text = if self.stream {
                    match self.inflate_stream(&data)? {
                        Some(text) => text,
                        None => return Ok(None),
                    }
                } else {
                    Self::inflate_frame(&data)?
                };
                Self::parse(&text).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.inflater.reset(true);
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::OpCode;
    use flate2::write::ZlibEncoder;
    use flate2::{Compress, Compression, FlushCompress};
    use std::io::Write;

    fn zlib(text: &str) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    /// Compress messages the way a zlib-stream server does: one context,
    /// each message ending in a sync flush.
    fn zlib_stream(messages: &[&str]) -> Vec<Vec<u8>> {
        let mut compress = Compress::new(Compression::default(), true);
        messages
            .iter()
            .map(|m| {
                let mut out = Vec::with_capacity(m.len() + 64);
                compress
                    .compress_vec(m.as_bytes(), &mut out, FlushCompress::Sync)
                    .unwrap();
                out
            })
            .collect()
    }

    #[test]
    fn test_text_frame() {
        let mut codec = GatewayCodec::new(false);
        let payload = codec
            .decode_message(Message::Text(r#"{"op":11}"#.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::HeartbeatAck));
    }

    #[test]
    fn test_independent_binary_frames() {
        let mut codec = GatewayCodec::new(false);
        let frame = zlib(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        let payload = codec
            .decode_message(Message::Binary(frame))
            .unwrap()
            .unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::Hello));
    }

    #[test]
    fn test_stream_shares_context_and_buffers_partials() {
        let mut codec = GatewayCodec::new(true);
        let frames = zlib_stream(&[
            r#"{"op":10,"d":{"heartbeat_interval":1000}}"#,
            r#"{"op":0,"s":1,"t":"RESUMED","d":{}}"#,
        ]);
        assert!(frames.iter().all(|f| f.ends_with(&ZLIB_SUFFIX)));

        let first = codec
            .decode_message(Message::Binary(frames[0].clone()))
            .unwrap()
            .unwrap();
        assert_eq!(first.opcode(), Some(OpCode::Hello));

        let (head, tail) = frames[1].split_at(frames[1].len() / 2);
        assert!(codec
            .decode_message(Message::Binary(head.to_vec()))
            .unwrap()
            .is_none());
        let second = codec
            .decode_message(Message::Binary(tail.to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(second.t.as_deref(), Some("RESUMED"));
        assert_eq!(second.s, Some(1));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let mut codec = GatewayCodec::new(false);
        assert!(matches!(
            codec.decode_message(Message::Binary(vec![1, 2, 3])),
            Err(ClientError::ProtocolError(_))
        ));
        assert!(matches!(
            codec.decode_message(Message::Text("not json".to_string())),
            Err(ClientError::ProtocolError(_))
        ));
    }
}
