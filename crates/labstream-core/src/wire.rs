//! Messages exchanged on the discovery channel and the data plane.
//!
//! Discovery messages travel as one JSON document per UDP datagram.
//! Data-plane frames travel over TCP as a big-endian `u32` length
//! followed by a JSON body.

use crate::{
    error::{Error, Result},
    info::{Sample, StreamInfo},
    predicate::Predicate,
};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single data-plane frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on a discovery datagram.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    /// Periodic advertisement of a stream, without extended metadata.
    Announce { stream: StreamInfo },
    /// Request for every stream matching `predicate`.
    Query {
        id: u64,
        session_id: String,
        predicate: Predicate,
    },
    /// Reply to a query, sent to the querying socket.
    Answer { id: u64, stream: StreamInfo },
}

impl DiscoveryMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(Error::protocol(format!(
                "discovery message of {} bytes exceeds the datagram limit",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of an inlet: its protocol version and the stream it
    /// expects to reach.
    Hello { version: u32, uid: String },
    /// Outlet acceptance, carrying the full stream description.
    Welcome { version: u32, info: StreamInfo },
    Reject { reason: String },
    Samples { samples: Vec<Sample> },
    Probe { id: u64, t0: f64 },
    ProbeReply { id: u64, t0: f64, t1: f64, t2: f64 },
    /// The outlet is shutting down.
    End,
}

/// Reads one frame. Returns `None` when the peer closed the connection
/// at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("frame of {len} bytes exceeds the limit")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame of {} bytes exceeds the limit",
            body.len()
        )));
    }
    let len = u32::try_from(body.len()).map_err(|_| Error::protocol("frame too large"))?;

    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
