//! Length-prefixed framing for sync messages.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use super::SessionId;

/// Hard cap on a single frame body.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Errors at the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A frame announced or produced more than [`MAX_FRAME_SIZE`] bytes.
    #[error("frame of {0} bytes exceeds the 10 MiB limit")]
    Oversize(usize),
    /// The frame body did not decode as a message.
    #[error("malformed message body")]
    Malformed(#[from] postcard::Error),
    /// The underlying stream failed or the length prefix was truncated.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One sync protocol message. Each stream carries at most two of these per
/// direction before it is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// SHA-256 fingerprint of the sender's serialized replica state.
    Fingerprint {
        /// Identifies this logical sync attempt across both peers.
        session: SessionId,
        /// The state fingerprint.
        hash: [u8; 32],
    },
    /// Explicit request for the receiver's full state.
    StateRequest {
        /// Identifies this logical sync attempt across both peers.
        session: SessionId,
    },
    /// A serialized [`ReplicaState`](crate::ReplicaState).
    State {
        /// Identifies this logical sync attempt across both peers.
        session: SessionId,
        /// Postcard-encoded replica state.
        state: Vec<u8>,
    },
}

impl Message {
    /// The session id carried by any message variant.
    pub fn session(&self) -> &SessionId {
        match self {
            Message::Fingerprint { session, .. } => session,
            Message::StateRequest { session } => session,
            Message::State { session, .. } => session,
        }
    }
}

/// Frames messages as a 4-byte big-endian length followed by the postcard
/// body.
#[derive(Debug, Default)]
pub struct SyncCodec;

impl Decoder for SyncCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let prefix: [u8; 4] = src[..4].try_into().expect("slice is 4 bytes");
        let frame_len = u32::from_be_bytes(prefix) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::Oversize(frame_len));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        let message = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(message))
    }
}

impl Encoder<Message> for SyncCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = postcard::to_stdvec(&item)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::Oversize(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(u32::try_from(body.len()).expect("already bounded"));
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[tokio::test]
    async fn messages_round_trip_through_a_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, SyncCodec);
        let mut reader = FramedRead::new(server, SyncCodec);

        let session = SessionId::generate();
        writer
            .send(Message::Fingerprint {
                session: session.clone(),
                hash: [7; 32],
            })
            .await
            .unwrap();
        writer
            .send(Message::State {
                session: session.clone(),
                state: vec![1, 2, 3],
            })
            .await
            .unwrap();

        match reader.next().await.unwrap().unwrap() {
            Message::Fingerprint { hash, .. } => assert_eq!(hash, [7; 32]),
            other => panic!("unexpected message: {other:?}"),
        }
        match reader.next().await.unwrap().unwrap() {
            Message::State { state, .. } => assert_eq!(state, vec![1, 2, 3]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn oversize_length_prefix_is_rejected() {
        let mut codec = SyncCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0; 16]);
        match codec.decode(&mut buf) {
            Err(CodecError::Oversize(len)) => assert_eq!(len, MAX_FRAME_SIZE + 1),
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_body_waits_for_more_data() {
        let mut codec = SyncCodec;
        let mut full = BytesMut::new();
        codec
            .encode(
                Message::StateRequest {
                    session: SessionId::generate(),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn garbage_body_is_a_malformed_frame() {
        let mut codec = SyncCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }
}
