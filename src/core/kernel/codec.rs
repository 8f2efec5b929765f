use crate::core::errors::ClientError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting between raw WebSocket frames and protocol
/// messages.
///
/// Decoding takes `&mut self` because a codec may carry per-connection
/// state (a streaming decompressor, for instance). Call `reset` whenever a
/// new connection is opened.
pub trait WsCodec: Send + 'static {
    /// The protocol message type, used in both directions
    type Message: Send;

    /// Encode a message into a WebSocket frame
    fn encode_message(&self, message: &Self::Message) -> Result<Message, ClientError>;

    /// Decode a data frame into a message
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Frame ignored, or buffered until more data arrives
    /// - `Err(error)` - Failed to decode the frame
    fn decode_message(&mut self, message: Message) -> Result<Option<Self::Message>, ClientError>;

    /// Drop any per-connection state
    fn reset(&mut self) {}
}
