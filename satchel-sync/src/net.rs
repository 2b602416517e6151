//! Pairwise sync over a bidirectional byte stream.
//!
//! Both sides run at most one round trip: the initiator opens with its state
//! fingerprint; the responder answers with either its own fingerprint (states
//! equal, nothing to do) or its full state, which the initiator merges. A
//! responder that receives a state merges it and acknowledges with its
//! post-merge fingerprint. There is no recursion and no nested request.

use std::time::Duration;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::replica::ReplicaState;

pub mod codec;

use self::codec::{CodecError, Message, SyncCodec};

/// Hard wall-clock deadline for a single sync stream.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifier of one logical sync attempt, carried by every message of the
/// attempt and used for deduplication and log correlation.
///
/// Format: `<unix-nanos>-<8 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh session id from the wall clock and 4 random bytes.
    pub fn generate() -> Self {
        use rand::Rng;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let random: [u8; 4] = rand::thread_rng().gen();
        SessionId(format!("{nanos}-{}", hex::encode(random)))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access to replica state for the sync layer, decoupling it from the engine.
pub trait StateProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Exports the current replica state.
    fn state(&self) -> ReplicaState;

    /// Merges a remote state into the local replica and re-projects it.
    fn apply_state(&self, state: ReplicaState) -> anyhow::Result<()>;

    /// SHA-256 fingerprint of the current serialized state.
    fn state_hash(&self) -> [u8; 32];
}

/// What a completed exchange did on this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Fingerprints matched; no state moved.
    Unchanged,
    /// A remote state was merged into the local replica.
    Applied,
    /// The local state was sent for the other side to merge.
    Sent,
}

/// Errors on the initiating side of a sync stream.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The 30-second stream deadline expired.
    #[error("sync stream timed out")]
    Timeout,
    /// Framing or transport failure.
    #[error("sync stream failed")]
    Codec(#[from] CodecError),
    /// The peer closed the stream before replying.
    #[error("peer closed the stream before replying")]
    ClosedEarly,
    /// The received state payload did not deserialize.
    #[error("malformed state payload")]
    State(#[source] postcard::Error),
    /// Merging the received state failed locally.
    #[error("failed to apply received state")]
    Apply(#[source] anyhow::Error),
}

/// Errors on the accepting side of a sync stream.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The 30-second stream deadline expired.
    #[error("sync stream timed out")]
    Timeout,
    /// Framing or transport failure.
    #[error("sync stream failed")]
    Codec(#[from] CodecError),
    /// The received state payload did not deserialize.
    #[error("malformed state payload")]
    State(#[source] postcard::Error),
    /// Merging the received state failed locally.
    #[error("failed to apply received state")]
    Apply(#[source] anyhow::Error),
}

fn encode_state(state: &ReplicaState) -> Vec<u8> {
    postcard::to_stdvec(state).expect("replica state serialization is infallible")
}

/// Runs the initiator side of one sync attempt over `stream`.
///
/// Sends our fingerprint, then handles exactly one reply. The whole exchange
/// is bounded by [`STREAM_TIMEOUT`].
pub async fn run_initiator<S>(
    stream: S,
    provider: &dyn StateProvider,
    session: SessionId,
) -> Result<SyncOutcome, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(STREAM_TIMEOUT, initiate(stream, provider, session))
        .await
        .map_err(|_| ConnectError::Timeout)?
}

async fn initiate<S>(
    stream: S,
    provider: &dyn StateProvider,
    session: SessionId,
) -> Result<SyncOutcome, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, SyncCodec);
    let mut writer = FramedWrite::new(writer, SyncCodec);

    let ours = provider.state_hash();
    writer
        .send(Message::Fingerprint {
            session: session.clone(),
            hash: ours,
        })
        .await?;

    let reply = match reader.next().await {
        Some(msg) => msg?,
        None => return Err(ConnectError::ClosedEarly),
    };

    match reply {
        Message::Fingerprint { hash, .. } => {
            if hash == ours {
                debug!(%session, "sync[dial]: fingerprints equal, nothing to do");
            } else {
                // The responder only echoes a fingerprint when it considered
                // the states equal; nothing further to do on this stream.
                debug!(%session, "sync[dial]: fingerprint reply differs, done");
            }
            Ok(SyncOutcome::Unchanged)
        }
        Message::State { state, .. } => {
            let state: ReplicaState =
                postcard::from_bytes(&state).map_err(ConnectError::State)?;
            provider.apply_state(state).map_err(ConnectError::Apply)?;
            debug!(%session, "sync[dial]: merged remote state");
            Ok(SyncOutcome::Applied)
        }
        Message::StateRequest { .. } => {
            let state = encode_state(&provider.state());
            writer.send(Message::State { session, state }).await?;
            Ok(SyncOutcome::Sent)
        }
    }
}

/// Runs the responder side of one incoming sync stream.
///
/// Reads one message, replies once, and is done. Bounded by
/// [`STREAM_TIMEOUT`].
pub async fn run_responder<S>(
    stream: S,
    provider: &dyn StateProvider,
) -> Result<SyncOutcome, AcceptError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(STREAM_TIMEOUT, respond(stream, provider))
        .await
        .map_err(|_| AcceptError::Timeout)?
}

async fn respond<S>(stream: S, provider: &dyn StateProvider) -> Result<SyncOutcome, AcceptError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, SyncCodec);
    let mut writer = FramedWrite::new(writer, SyncCodec);

    let message = match reader.next().await {
        Some(msg) => msg?,
        // The peer opened and closed without sending; treat as a no-op.
        None => return Ok(SyncOutcome::Unchanged),
    };
    let session = message.session().clone();

    match message {
        Message::Fingerprint { hash: theirs, .. } => {
            let ours = provider.state_hash();
            if ours == theirs {
                debug!(%session, "sync[accept]: fingerprints equal");
                writer
                    .send(Message::Fingerprint {
                        session,
                        hash: ours,
                    })
                    .await?;
                Ok(SyncOutcome::Unchanged)
            } else {
                debug!(%session, "sync[accept]: fingerprints differ, sending state");
                let state = encode_state(&provider.state());
                writer.send(Message::State { session, state }).await?;
                Ok(SyncOutcome::Sent)
            }
        }
        Message::StateRequest { .. } => {
            let state = encode_state(&provider.state());
            writer.send(Message::State { session, state }).await?;
            Ok(SyncOutcome::Sent)
        }
        Message::State { state, .. } => {
            let state: ReplicaState =
                postcard::from_bytes(&state).map_err(AcceptError::State)?;
            provider.apply_state(state).map_err(AcceptError::Apply)?;
            debug!(%session, "sync[accept]: merged remote state");
            writer
                .send(Message::Fingerprint {
                    session,
                    hash: provider.state_hash(),
                })
                .await?;
            Ok(SyncOutcome::Applied)
        }
    }
}
