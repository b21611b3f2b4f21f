//! Tokio codec for newline-delimited JSON bridge messages

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::BridgeMessage;

/// Maximum size of a single encoded message.
///
/// Large enough for a PEM private key plus JSON overhead; anything bigger
/// is treated as a hostile or broken peer.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Codec for encoding/decoding bridge messages, one JSON object per line
#[derive(Debug, Default)]
pub struct BridgeCodec;

impl BridgeCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for BridgeCodec {
    /// A decoded message, or the parse error for a malformed line.
    ///
    /// Malformed lines come back as items rather than decode errors:
    /// `Framed` fuses its stream after `decode` returns `Err`, and one
    /// bad line must not take down the connection. `Err` from `decode`
    /// means the stream itself is unusable (oversized frame).
    type Item = Result<BridgeMessage, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::MessageTooLarge {
                        size: src.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                return Ok(None); // Need more data
            };

            if pos > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::MessageTooLarge {
                    size: pos,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            let line = src.split_to(pos + 1);
            let line = &line[..pos];
            let line = match line.last() {
                Some(b'\r') => &line[..pos - 1],
                _ => line,
            };

            // Tolerate blank lines between messages
            if line.is_empty() {
                continue;
            }

            return Ok(Some(
                serde_json::from_slice(line).map_err(ProtocolError::Malformed),
            ));
        }
    }
}

impl Encoder<BridgeMessage> for BridgeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: BridgeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&message)?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_message(codec: &mut BridgeCodec, src: &mut BytesMut) -> BridgeMessage {
        codec
            .decode(src)
            .unwrap()
            .expect("expected a complete line")
            .expect("expected a well-formed message")
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(BridgeMessage::Disconnect, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"type\":\"disconnect\"}\n");
    }

    #[test]
    fn test_decode_two_messages_one_buffer() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"type\":\"data\",\"data\":\"ls\"}\n{\"type\":\"disconnect\"}\n"[..],
        );
        assert_eq!(
            decode_message(&mut codec, &mut buf),
            BridgeMessage::Data {
                data: "ls".to_string()
            }
        );
        assert_eq!(
            decode_message(&mut codec, &mut buf),
            BridgeMessage::Disconnect
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"dis"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"connect\"}\n");
        assert_eq!(
            decode_message(&mut codec, &mut buf),
            BridgeMessage::Disconnect
        );
    }

    #[test]
    fn test_decode_crlf_and_blank_lines() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::from(&b"\r\n{\"type\":\"disconnect\"}\r\n"[..]);
        assert_eq!(
            decode_message(&mut codec, &mut buf),
            BridgeMessage::Disconnect
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_yields_item_not_error() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"type\":\"disconnect\"}\n"[..]);

        // The bad line surfaces as an item, not as a decode error, so a
        // Framed stream over this codec does not get fused by it
        let item = codec
            .decode(&mut buf)
            .unwrap()
            .expect("bad line should still yield an item");
        assert!(matches!(item, Err(ProtocolError::Malformed(_))));

        // The bad line was consumed; the next message still decodes
        assert_eq!(
            decode_message(&mut codec, &mut buf),
            BridgeMessage::Disconnect
        );
    }

    #[test]
    fn test_oversized_unterminated_line_rejected() {
        let mut codec = BridgeCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_MESSAGE_SIZE + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_oversized_terminated_line_rejected() {
        let mut codec = BridgeCodec::new();
        let mut payload = vec![b'x'; MAX_MESSAGE_SIZE + 1];
        payload.push(b'\n');
        payload.extend_from_slice(b"{\"type\":\"disconnect\"}\n");

        let mut buf = BytesMut::from(payload.as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
