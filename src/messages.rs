//! Typed requests and responses carried inside frames
//!
//! The frame header carries the message type and the FINAL flag; the bincode
//! payload carries everything else.

use crate::error::{RbError, Result, WireError};
use crate::protocol::{flags, MsgType, PROTOCOL_VERSION};
use crate::protocol_core::{read_frame, write_frame, Frame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Durable description of one file's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub checksum: u32,
    pub size: u64,
    /// Unix seconds
    pub last_write_time: i64,
    /// Nanosecond part of the mtime
    #[serde(default)]
    pub mtime_nanos: u32,
}

impl FileMetadata {
    /// Same size and exact same mtime as `other`.
    pub fn same_stat(&self, other: &FileMetadata) -> bool {
        self.size == other.size
            && self.last_write_time == other.last_write_time
            && self.mtime_nanos == other.mtime_nanos
    }
}

/// A slice of a file, or just a path for REMOVE/ABORT/RESTORE requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSegment {
    pub path: String,
    pub segment_id: u64,
    pub data: Vec<u8>,
    /// Present only on the last segment of an upload.
    pub metadata: Option<FileMetadata>,
}

impl FileSegment {
    pub fn path_only(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user: String,
    pub pass: String,
}

/// Server view returned by PROBE: normalized path -> metadata.
pub type FileMap = BTreeMap<String, FileMetadata>;

#[derive(Serialize, Deserialize)]
struct RequestBody {
    token: String,
    auth: Option<AuthRequest>,
    segment: Option<FileSegment>,
}

#[derive(Serialize, Deserialize)]
struct ResponseBody {
    success: bool,
    error: Option<WireError>,
    token: Option<String>,
    files: Option<FileMap>,
    segment: Option<FileSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub protover: u16,
    pub kind: MsgType,
    pub is_final: bool,
    pub token: String,
    pub auth: Option<AuthRequest>,
    pub segment: Option<FileSegment>,
}

impl Request {
    pub fn new(kind: MsgType) -> Self {
        Self {
            protover: PROTOCOL_VERSION,
            kind,
            is_final: false,
            token: String::new(),
            auth: None,
            segment: None,
        }
    }

    pub fn auth(user: &str, pass: &str) -> Self {
        Self {
            auth: Some(AuthRequest {
                user: user.to_string(),
                pass: pass.to_string(),
            }),
            ..Self::new(MsgType::Auth)
        }
    }

    pub fn upload(segment: FileSegment) -> Self {
        Self {
            segment: Some(segment),
            ..Self::new(MsgType::Upload)
        }
    }

    pub fn remove(path: &str) -> Self {
        Self {
            segment: Some(FileSegment::path_only(path)),
            ..Self::new(MsgType::Remove)
        }
    }

    pub fn abort(path: &str) -> Self {
        Self {
            segment: Some(FileSegment::path_only(path)),
            ..Self::new(MsgType::Abort)
        }
    }

    pub fn probe() -> Self {
        Self::new(MsgType::Probe)
    }

    pub fn restore(path: &str, segment_id: u64) -> Self {
        Self {
            segment: Some(FileSegment {
                segment_id,
                ..FileSegment::path_only(path)
            }),
            ..Self::new(MsgType::Restore)
        }
    }

    pub fn nop() -> Self {
        Self::new(MsgType::Nop)
    }

    /// Mark the request as the last one on its connection.
    pub fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let body = RequestBody {
            token: self.token.clone(),
            auth: self.auth.clone(),
            segment: self.segment.clone(),
        };
        let payload = bincode::serialize(&body)?;
        write_frame(w, self.kind.as_u8(), final_flag(self.is_final), &payload)
    }

    /// Decode a request from a frame that was already read.
    ///
    /// Versions below the supported one are rejected; newer ones are accepted.
    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.version < PROTOCOL_VERSION {
            return Err(RbError::ProtocolVersionMismatch(format!(
                "client speaks version {}, server requires at least {}",
                frame.version, PROTOCOL_VERSION
            )));
        }
        let kind = MsgType::from_u8(frame.kind).ok_or_else(|| {
            RbError::InvalidRequest(format!("unknown message type {}", frame.kind))
        })?;
        let body: RequestBody = bincode::deserialize(&frame.payload)
            .map_err(|e| RbError::InvalidRequest(format!("undecodable {kind} body: {e}")))?;
        Ok(Self {
            protover: frame.version,
            kind,
            is_final: frame.is_final(),
            token: body.token,
            auth: body.auth,
            segment: body.segment,
        })
    }

    /// Segment body, or InvalidRequest if the message has none.
    pub fn require_segment(&self) -> Result<&FileSegment> {
        self.segment
            .as_ref()
            .ok_or_else(|| RbError::InvalidRequest(format!("{} without a file body", self.kind)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub protover: u16,
    pub kind: MsgType,
    pub is_final: bool,
    pub success: bool,
    pub error: Option<WireError>,
    pub token: Option<String>,
    pub files: Option<FileMap>,
    pub segment: Option<FileSegment>,
}

impl Response {
    pub fn ok(kind: MsgType) -> Self {
        Self {
            protover: PROTOCOL_VERSION,
            kind,
            is_final: false,
            success: true,
            error: None,
            token: None,
            files: None,
            segment: None,
        }
    }

    pub fn failure(kind: MsgType, err: &RbError) -> Self {
        Self {
            success: false,
            error: Some(err.to_wire()),
            ..Self::ok(kind)
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let body = ResponseBody {
            success: self.success,
            error: self.error.clone(),
            token: self.token.clone(),
            files: self.files.clone(),
            segment: self.segment.clone(),
        };
        let payload = bincode::serialize(&body)?;
        write_frame(w, self.kind.as_u8(), final_flag(self.is_final), &payload)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let frame = read_frame(r)?;
        if frame.version < PROTOCOL_VERSION {
            return Err(RbError::ProtocolVersionMismatch(format!(
                "server speaks version {}, client requires at least {}",
                frame.version, PROTOCOL_VERSION
            )));
        }
        let kind = MsgType::from_u8(frame.kind).ok_or_else(|| {
            RbError::ProtocolTypeMismatch(format!("unknown response type {}", frame.kind))
        })?;
        let body: ResponseBody = bincode::deserialize(&frame.payload)?;
        Ok(Self {
            protover: frame.version,
            kind,
            is_final: frame.is_final(),
            success: body.success,
            error: body.error,
            token: body.token,
            files: body.files,
            segment: body.segment,
        })
    }

    /// Turn an unsuccessful or mismatched response into the matching error.
    pub fn check(self, expected: MsgType) -> Result<Self> {
        if !self.success {
            return Err(match self.error {
                Some(err) => RbError::from_wire(err),
                None => RbError::Internal(format!("{} failed without detail", self.kind)),
            });
        }
        if self.kind != expected {
            return Err(RbError::ProtocolTypeMismatch(format!(
                "expected {expected} response, got {}",
                self.kind
            )));
        }
        Ok(self)
    }
}

fn final_flag(is_final: bool) -> u8 {
    if is_final {
        flags::FINAL
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol_core::build_frame_header;
    use std::io::Cursor;

    #[test]
    fn final_upload_request_keeps_metadata_and_flag() {
        let req = Request::upload(FileSegment {
            path: "a.txt".into(),
            segment_id: 0,
            data: b"hello".to_vec(),
            metadata: Some(FileMetadata {
                checksum: 0x3610_a686,
                size: 5,
                last_write_time: 1_700_000_000,
                mtime_nanos: 0,
            }),
        })
        .into_final();

        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frame.kind, MsgType::Upload.as_u8());
        assert!(frame.is_final());
        assert_eq!(Request::decode(&frame).unwrap(), req);
    }

    #[test]
    fn old_protocol_version_is_rejected() {
        let frame = Frame {
            version: PROTOCOL_VERSION - 1,
            kind: MsgType::Nop.as_u8(),
            flags: 0,
            payload: Vec::new(),
        };
        assert!(matches!(
            Request::decode(&frame),
            Err(RbError::ProtocolVersionMismatch(_))
        ));
    }

    #[test]
    fn newer_protocol_version_is_accepted() {
        let mut buf = Vec::new();
        Request::nop().write_to(&mut buf).unwrap();
        buf[4..6].copy_from_slice(&(PROTOCOL_VERSION + 1).to_le_bytes());
        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        let req = Request::decode(&frame).unwrap();
        assert_eq!(req.protover, PROTOCOL_VERSION + 1);
    }

    #[test]
    fn unknown_type_is_invalid_request() {
        let buf = build_frame_header(42, 0, 0).to_vec();
        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        assert!(matches!(
            Request::decode(&frame),
            Err(RbError::InvalidRequest(_))
        ));
    }

    #[test]
    fn failure_response_raises_typed_error() {
        let resp = Response::failure(MsgType::Upload, &RbError::WrongSegment("got 4".into()));
        let mut buf = Vec::new();
        resp.write_to(&mut buf).unwrap();
        let back = Response::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.error.as_ref().map(|e| e.code), Some(ErrorCode::WrongSegment));
        assert!(matches!(
            back.check(MsgType::Upload),
            Err(RbError::WrongSegment(_))
        ));
    }

    #[test]
    fn type_mismatch_is_detected() {
        let resp = Response::ok(MsgType::Nop);
        assert!(matches!(
            resp.check(MsgType::Probe),
            Err(RbError::ProtocolTypeMismatch(_))
        ));
    }

    #[test]
    fn file_list_response_carries_file_map() {
        let mut files = FileMap::new();
        files.insert(
            "docs/a.txt".into(),
            FileMetadata {
                checksum: 7,
                size: 5,
                last_write_time: 10,
                mtime_nanos: 0,
            },
        );
        let resp = Response {
            files: Some(files.clone()),
            ..Response::ok(MsgType::Probe)
        };
        let mut buf = Vec::new();
        resp.write_to(&mut buf).unwrap();
        let back = Response::read_from(&mut Cursor::new(buf))
            .unwrap()
            .check(MsgType::Probe)
            .unwrap();
        assert_eq!(back.files, Some(files));
    }

    #[test]
    fn missing_body_is_invalid_request() {
        assert!(matches!(
            Request::probe().require_segment(),
            Err(RbError::InvalidRequest(_))
        ));
    }
}
