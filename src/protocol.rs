//! Shared protocol constants for the rbackup framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"RBKP";
pub const PROTOCOL_VERSION: u16 = 3;

/// Header layout: MAGIC (4) | VERSION (2) | TYPE (1) | FLAGS (1) | LENGTH (4)
pub const HEADER_LEN: usize = 12;

// Maximum frame payload size (4MB) - one segment plus envelope, prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Files travel in fixed 1 MiB segments, one RPC each
pub const SEGMENT_SIZE: u64 = 1_048_576;

/// Client-side read granularity inside a segment; the abort flag is polled once per chunk
pub const READ_CHUNK_SIZE: usize = 2048;

/// Header flag bits
pub mod flags {
    /// Connection is torn down after this exchange
    pub const FINAL: u8 = 0b0000_0001;
}

/// Message type discriminants (keep numeric values stable, they are on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Auth = 1,
    Upload = 2,
    Remove = 3,
    Abort = 4,
    Probe = 5,
    Restore = 6,
    Nop = 7,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Auth),
            2 => Some(Self::Upload),
            3 => Some(Self::Remove),
            4 => Some(Self::Abort),
            5 => Some(Self::Probe),
            6 => Some(Self::Restore),
            7 => Some(Self::Nop),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::Upload => "UPLOAD",
            Self::Remove => "REMOVE",
            Self::Abort => "ABORT",
            Self::Probe => "PROBE",
            Self::Restore => "RESTORE",
            Self::Nop => "NOP",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of segments a file of `size` bytes is split into. Empty files still send one.
pub fn num_segments(size: u64) -> u64 {
    size.div_ceil(SEGMENT_SIZE).max(1)
}

/// Length of segment `index` for a file of `size` bytes
pub fn segment_len(size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(SEGMENT_SIZE);
    if start >= size {
        return 0;
    }
    (size - start).min(SEGMENT_SIZE)
}

// Centralized timeout defaults, overridable through config
pub mod timeouts {
    // Deadline for one request/response exchange (ms)
    pub const RPC_MS: u64 = 30_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Pooled connections idle longer than this are reaped (ms)
    pub const POOL_IDLE_MS: u64 = 60_000;

    // Reaper wake-up interval (ms)
    pub const REAP_INTERVAL_MS: u64 = 10_000;

    // Server closes a session that sends nothing for this long (ms)
    pub const SESSION_IDLE_MS: u64 = 120_000;
}
