use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame. Listings of very large directories
/// stay well below this; anything bigger is a protocol violation.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Token which authenticates the calling node to a named peer.
///
/// `node_auth` is `UPPER_HEX(SHA512/224(caller_name ++ callee_secret))`,
/// so it proves knowledge of the callee's secret without ever putting
/// the secret on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeToken {
    pub node_name: String,
    pub node_auth: String,
}

/// The request envelope. Field order is the wire order
/// (`TARGET=0, TOKEN=1`, with `CTRL=2` and `DATA=3` inside the call).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Name of the addressed node.
    pub target: String,
    /// The caller's auth token.
    pub token: NodeToken,
    /// The invoked method and its arguments.
    pub call: Call,
}

/// The two methods of the RPC surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    /// Liveness and fingerprint probe.
    Ping,
    /// A file operation, described by the control variant, with an
    /// opaque payload (write contents).
    Data { ctrl: Ctrl, data: Vec<u8> },
}

/// Typed control information for a data request. Each variant carries
/// exactly the fields its operation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Ctrl {
    /// List one or more directories.
    Dir {
        path: String,
        pattern: String,
        recursive: bool,
        checksums: bool,
    },
    /// Read up to `size` bytes at `offset`.
    Read {
        path: String,
        offset: u64,
        size: u64,
    },
    /// Write the request payload at `offset`.
    Write { path: String, offset: u64 },
    /// A file or directory operation relative to `path`.
    ItemOp { path: String, op: ItemOp },
}

/// File and directory operations which either succeed or fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOp {
    /// Rename `name` to `new_name` within the same directory. Both
    /// operands are file names, not paths.
    Rename { name: String, new_name: String },
    /// Delete a file or directory recursively. A name containing `*`
    /// is a glob relative to the request directory.
    Delete { name: String },
    /// Create a directory (and any missing parents).
    Mkdir { name: String },
}

impl ItemOp {
    /// The primary operand of the operation.
    pub fn name(&self) -> &str {
        match self {
            ItemOp::Rename { name, .. } => name,
            ItemOp::Delete { name } => name,
            ItemOp::Mkdir { name } => name,
        }
    }
}

/// A successful reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to `Ping`.
    Pong(Vec<String>),
    /// Encoded result payload of a data request.
    Data(Vec<u8>),
}

/// A failed reply. Token failures are typed; handler failures carry
/// the handler's error text verbatim and are classified by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum WireError {
    #[error("Unknown target node")]
    UnknownTarget,
    #[error("Invalid node token")]
    InvalidToken,
    #[error("{0}")]
    Handler(String),
}

pub type WireResult = Result<Reply, WireError>;

/// Write a length-prefixed frame.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read a length-prefixed frame.
pub async fn read_frame<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}
