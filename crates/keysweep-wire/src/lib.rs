#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Wire protocol between the controller and nodes.
//!
//! Frame format: 4-byte big-endian payload length, then the payload: an ASCII
//! decimal message tag, and for kinds that carry data a `|` followed by the
//! body. Ranges serialize as `start-end`; checkpoint lists are
//! colon-separated. The payload is text so a captured frame reads directly in
//! a packet dump.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use keysweep_core::fingerprint::TargetFingerprint;
use keysweep_core::types::{IndexRange, NodeId};

/// Upper bound on a single payload. Frames here are at most a checkpoint list,
/// so anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("malformed {kind} payload: {detail}")]
    Malformed { kind: &'static str, detail: String },
}

/// A failed receive or send. Both variants take the same recovery path
/// (the peer's session is failed and its range reclaimed); the split exists
/// so logs can tell a corrupt peer from a dead one.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Work handed to a node: the range, the target, and how often to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub node: NodeId,
    pub checkpoint_interval: i64,
    pub range: IndexRange,
    pub target: TargetFingerprint,
}

/// Sub-ranges a node has exhausted since its previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    pub node: NodeId,
    pub completed: Vec<IndexRange>,
}

/// A node's claim that `index` verifies against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundReport {
    pub node: NodeId,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Node asks for work. No payload.
    Request,
    /// Controller assigns a range.
    Assign(Assignment),
    /// Node reports exhausted sub-ranges.
    Checkpoint(CheckpointReport),
    /// Node reports the winning index.
    Found(FoundReport),
    /// Controller orders immediate termination.
    Stop,
    /// Controller acknowledges a checkpoint; keep working.
    Continue,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Request => 0,
            Message::Assign(_) => 1,
            Message::Checkpoint(_) => 2,
            Message::Found(_) => 3,
            Message::Stop => 4,
            Message::Continue => 5,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Request => "REQUEST",
            Message::Assign(_) => "ASSIGN",
            Message::Checkpoint(_) => "CHECKPOINT",
            Message::Found(_) => "FOUND",
            Message::Stop => "STOP",
            Message::Continue => "CONTINUE",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.tag().to_string();
        match self {
            Message::Request | Message::Stop | Message::Continue => {}
            Message::Assign(a) => {
                out.push('|');
                out.push_str(&format!(
                    "{},{},{},{},{}",
                    a.node, a.checkpoint_interval, a.range, a.target.hashed_value, a.target.salt
                ));
            }
            Message::Checkpoint(cp) => {
                out.push('|');
                out.push_str(&cp.node.to_string());
                for r in &cp.completed {
                    out.push(':');
                    out.push_str(&r.to_string());
                }
            }
            Message::Found(f) => {
                out.push('|');
                out.push_str(&format!("{},{}", f.node, f.index));
            }
        }
        out.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
        let (tag, body) = match text.split_once('|') {
            Some((tag, body)) => (tag, Some(body)),
            None => (text, None),
        };

        match tag {
            "0" => expect_empty("REQUEST", body).map(|_| Message::Request),
            "1" => decode_assign(required("ASSIGN", body)?).map(Message::Assign),
            "2" => decode_checkpoint(required("CHECKPOINT", body)?).map(Message::Checkpoint),
            "3" => decode_found(required("FOUND", body)?).map(Message::Found),
            "4" => expect_empty("STOP", body).map(|_| Message::Stop),
            "5" => expect_empty("CONTINUE", body).map(|_| Message::Continue),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

fn expect_empty(kind: &'static str, body: Option<&str>) -> Result<(), ProtocolError> {
    match body {
        None | Some("") => Ok(()),
        Some(extra) => Err(ProtocolError::Malformed {
            kind,
            detail: format!("unexpected body {extra:?}"),
        }),
    }
}

fn required<'a>(kind: &'static str, body: Option<&'a str>) -> Result<&'a str, ProtocolError> {
    body.ok_or(ProtocolError::Malformed {
        kind,
        detail: "missing body".to_string(),
    })
}

fn malformed(kind: &'static str, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        kind,
        detail: detail.into(),
    }
}

fn parse_node(kind: &'static str, field: &str) -> Result<NodeId, ProtocolError> {
    field
        .parse::<u32>()
        .map(NodeId)
        .map_err(|_| malformed(kind, format!("bad node id {field:?}")))
}

fn parse_i64(kind: &'static str, name: &str, field: &str) -> Result<i64, ProtocolError> {
    field
        .parse::<i64>()
        .map_err(|_| malformed(kind, format!("bad {name} {field:?}")))
}

fn parse_range(kind: &'static str, field: &str) -> Result<IndexRange, ProtocolError> {
    let (start, end) = field
        .split_once('-')
        .ok_or_else(|| malformed(kind, format!("bad range {field:?}")))?;
    let start = parse_i64(kind, "range start", start)?;
    let end = parse_i64(kind, "range end", end)?;
    IndexRange::new(start, end).map_err(|e| malformed(kind, e.to_string()))
}

fn decode_assign(body: &str) -> Result<Assignment, ProtocolError> {
    const KIND: &str = "ASSIGN";
    let mut fields = body.splitn(5, ',');
    let mut next = |name: &str| {
        fields
            .next()
            .ok_or_else(|| malformed(KIND, format!("missing {name}")))
    };

    let node = parse_node(KIND, next("node id")?)?;
    let checkpoint_interval = parse_i64(KIND, "checkpoint interval", next("checkpoint interval")?)?;
    if checkpoint_interval <= 0 {
        return Err(malformed(
            KIND,
            format!("non-positive checkpoint interval {checkpoint_interval}"),
        ));
    }
    let range = parse_range(KIND, next("range")?)?;
    let hashed_value = next("hashed value")?.to_string();
    let salt = next("salt")?.to_string();
    if hashed_value.is_empty() {
        return Err(malformed(KIND, "empty hashed value"));
    }

    Ok(Assignment {
        node,
        checkpoint_interval,
        range,
        target: TargetFingerprint { hashed_value, salt },
    })
}

fn decode_checkpoint(body: &str) -> Result<CheckpointReport, ProtocolError> {
    const KIND: &str = "CHECKPOINT";
    let mut parts = body.split(':');
    let node = parse_node(
        KIND,
        parts.next().ok_or_else(|| malformed(KIND, "missing node id"))?,
    )?;
    let mut completed = Vec::new();
    for part in parts {
        completed.push(parse_range(KIND, part)?);
    }
    Ok(CheckpointReport { node, completed })
}

fn decode_found(body: &str) -> Result<FoundReport, ProtocolError> {
    const KIND: &str = "FOUND";
    let (node, index) = body
        .split_once(',')
        .ok_or_else(|| malformed(KIND, "expected node,index"))?;
    Ok(FoundReport {
        node: parse_node(KIND, node)?,
        index: parse_i64(KIND, "winning index", index)?,
    })
}

/// Reads one length-prefixed message, looping until the prefix and payload
/// are fully read. A short read surfaces as `ConnectionLost`.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, WireError> {
    let len = r.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Message::decode(&payload)?)
}

/// Writes one length-prefixed message and flushes it.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &Message,
) -> Result<(), WireError> {
    let payload = msg.encode();
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    debug_assert!(len <= MAX_FRAME_LEN);
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}
