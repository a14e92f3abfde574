//! Framing and path handling shared by the client and the server
//!
//! Every message travels as one frame: a fixed 12-byte header followed by a
//! bincode payload. Reading and writing are generic over `Read`/`Write` so the
//! same code drives `TcpStream`s and in-memory buffers in tests.

use crate::error::{RbError, Result};
use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};

/// One decoded frame header plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub kind: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_final(&self) -> bool {
        self.flags & crate::protocol::flags::FINAL != 0
    }
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(RbError::InvalidRequest(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (12 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | FLAGS (1) | LENGTH (4)
pub fn build_frame_header(kind: u8, flags: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    header[6] = kind;
    header[7] = flags;
    header[8..12].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (version, kind, flags, payload_length)
///
/// Only the magic is checked here; version policy belongs to message decoding
/// so a peer speaking an older version still gets a structured answer.
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u16, u8, u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(RbError::InvalidRequest("invalid magic in frame header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    let kind = header[6];
    let flags = header[7];
    let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    Ok((version, kind, flags, payload_len))
}

/// Write one frame and flush. Header and payload go out in a single write.
pub fn write_frame<W: Write>(w: &mut W, kind: u8, flags: u8, payload: &[u8]) -> Result<()> {
    validate_frame_size(payload.len())?;
    let header = build_frame_header(kind, flags, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    w.write_all(&buf).map_err(map_io)?;
    w.flush().map_err(map_io)?;
    Ok(())
}

/// Read exactly one frame.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).map_err(map_io)?;
    let (version, kind, flags, len) = parse_frame_header(&header)?;
    validate_frame_size(len as usize)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).map_err(map_io)?;
    Ok(Frame {
        version,
        kind,
        flags,
        payload,
    })
}

fn map_io(e: std::io::Error) -> RbError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            RbError::ConnectionClosed(e.to_string())
        }
        _ => RbError::Io(e),
    }
}

/// Normalize a client-supplied path into a relative key.
///
/// A leading `/` and `.` components are dropped; `..` anywhere is forbidden;
/// an empty result, a trailing separator or a NUL byte is malformed. The key
/// always uses `/` as separator.
pub fn normalize_rel(p: &str) -> Result<String> {
    if p.contains('\0') {
        return Err(RbError::MalformedPath(format!("{p:?}: contains NUL byte")));
    }
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(p).components() {
        match component {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::ParentDir => {
                return Err(RbError::ForbiddenPath(format!("{p}: parent directory reference")));
            }
            Component::Prefix(_) => {
                return Err(RbError::ForbiddenPath(format!("{p}: drive prefix")));
            }
        }
    }
    if parts.is_empty() || p.ends_with('/') {
        return Err(RbError::MalformedPath(format!("{p:?}: empty filename")));
    }
    Ok(parts.join("/"))
}

/// Join a normalized key under `root`.
pub fn resolve_under_root(root: &Path, key: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in key.split('/') {
        out.push(part);
    }
    out
}

/// Relative key of `path` below `root`, `/`-separated. None if outside root.
pub fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// Disable Nagle: every exchange is a small request waiting on a reply
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}
