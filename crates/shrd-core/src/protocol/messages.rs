//! Shared device protocol constants, command codes, and the message header.
//!
//! Every message on the wire, request or response, starts with the same
//! fixed 10-byte header:
//!
//! ```text
//! [cmd:1][flags:1][devnum:2][id:2][len:4]
//! ```
//!
//! All multi-byte integers are big-endian.  The high bit of `cmd` is the
//! COMP marker: when set, the payload is compressed and `flags` holds
//! `(algorithm << 5) | offset` instead of the command-specific flags.

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version exchanged on CONNECT.  A mismatch is rejected with BADVERS.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Protocol release exchanged on CONNECT.  Mismatched releases interoperate.
pub const PROTOCOL_RELEASE: u8 = 0x00;

/// Total size of the message header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Upper bound on a single payload; anything larger is treated as a framing error.
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Marker bit on the command byte: the payload is compressed.
pub const COMP_MARKER: u8 = 0x80;

/// Payloads (after the uncompressed prefix) shorter than this are sent as-is.
pub const MIN_COMPRESS_LEN: usize = 512;

/// Largest uncompressed prefix that fits in the 5-bit offset field.
pub const MAX_COMPRESS_OFFSET: usize = 31;

/// Default TCP port of the shared device server.
pub const DEFAULT_PORT: u16 = 3990;

/// Size of the sense data returned by SENSE.
pub const SENSE_SIZE: usize = 32;

/// START/RESUME flag: reply BUSY instead of waiting when the device is owned.
pub const START_NOWAIT: u8 = 0x01;

// ── Request commands ──────────────────────────────────────────────────────────

/// Request opcodes, sent in the low 7 bits of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Disconnect = 0x02,
    Start = 0x03,
    End = 0x04,
    Resume = 0x05,
    Suspend = 0x06,
    Reserve = 0x07,
    Release = 0x08,
    Read = 0x09,
    Write = 0x0A,
    Sense = 0x0B,
    Query = 0x0C,
    Compress = 0x0D,
}

impl TryFrom<u8> for Command {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value & !COMP_MARKER {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Disconnect),
            0x03 => Ok(Command::Start),
            0x04 => Ok(Command::End),
            0x05 => Ok(Command::Resume),
            0x06 => Ok(Command::Suspend),
            0x07 => Ok(Command::Reserve),
            0x08 => Ok(Command::Release),
            0x09 => Ok(Command::Read),
            0x0A => Ok(Command::Write),
            0x0B => Ok(Command::Sense),
            0x0C => Ok(Command::Query),
            0x0D => Ok(Command::Compress),
            _ => Err(()),
        }
    }
}

impl Command {
    /// Short upper-case name used in trace and log output.
    pub fn name(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Disconnect => "DISCONNECT",
            Command::Start => "START",
            Command::End => "END",
            Command::Resume => "RESUME",
            Command::Suspend => "SUSPEND",
            Command::Reserve => "RESERVE",
            Command::Release => "RELEASE",
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::Sense => "SENSE",
            Command::Query => "QUERY",
            Command::Compress => "COMPRESS",
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Response codes, sent in the command byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    /// Request rejected; the sub-status is in the flags byte.
    Error = 0x01,
    /// Device-level I/O failure; sense must be fetched with SENSE.
    IoError = 0x02,
    /// START/RESUME declined because NOWAIT was requested.
    Busy = 0x04,
}

/// Modifier bit on an OK reply to START/RESUME: an invalidation list is attached.
pub const PURGE_FLAG: u8 = 0x08;

const RESPONSE_CODE_MASK: u8 = 0x07;

impl ResponseCode {
    /// Extracts the response code from a reply command byte, ignoring the
    /// PURGE and COMP modifier bits.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value & RESPONSE_CODE_MASK {
            0x00 => Some(ResponseCode::Ok),
            0x01 => Some(ResponseCode::Error),
            0x02 => Some(ResponseCode::IoError),
            0x04 => Some(ResponseCode::Busy),
            _ => None,
        }
    }
}

/// Sub-status carried in the flags byte of an ERROR reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorStatus {
    Invalid = 0x01,
    BadVersion = 0x02,
    NotInitialized = 0x03,
    NotConnected = 0x04,
    NotAvailable = 0x05,
    NoMemory = 0x06,
    NotActive = 0x07,
    NoDevice = 0x08,
    Connect = 0x09,
}

impl TryFrom<u8> for ErrorStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(ErrorStatus::Invalid),
            0x02 => Ok(ErrorStatus::BadVersion),
            0x03 => Ok(ErrorStatus::NotInitialized),
            0x04 => Ok(ErrorStatus::NotConnected),
            0x05 => Ok(ErrorStatus::NotAvailable),
            0x06 => Ok(ErrorStatus::NoMemory),
            0x07 => Ok(ErrorStatus::NotActive),
            0x08 => Ok(ErrorStatus::NoDevice),
            0x09 => Ok(ErrorStatus::Connect),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorStatus::Invalid => "INVALID",
            ErrorStatus::BadVersion => "BADVERS",
            ErrorStatus::NotInitialized => "NOTINIT",
            ErrorStatus::NotConnected => "NOTCONN",
            ErrorStatus::NotAvailable => "NOTAVAIL",
            ErrorStatus::NoMemory => "NOMEM",
            ErrorStatus::NotActive => "NOTACTIVE",
            ErrorStatus::NoDevice => "NODEVICE",
            ErrorStatus::Connect => "ECONNECT",
        };
        f.write_str(name)
    }
}

// ── QUERY selectors ───────────────────────────────────────────────────────────

/// Selects which device attribute a QUERY returns (carried in the flags byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QuerySelector {
    /// Number of used tracks/blocks, as a 4-byte integer.
    Used = 0x01,
    /// Raw device characteristics bytes.
    DeviceCharacteristics = 0x02,
    /// Raw device identifier bytes.
    DeviceId = 0x03,
    /// 12-byte device serial number.
    SerialNumber = 0x04,
    /// CKD cylinder count, as a 4-byte integer.
    CkdCylinders = 0x05,
    /// FBA origin block, as a 4-byte integer.
    FbaOrigin = 0x06,
    /// FBA block count, as a 4-byte integer.
    FbaBlockCount = 0x07,
    /// FBA block size, as a 4-byte integer.
    FbaBlockSize = 0x08,
}

impl TryFrom<u8> for QuerySelector {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(QuerySelector::Used),
            0x02 => Ok(QuerySelector::DeviceCharacteristics),
            0x03 => Ok(QuerySelector::DeviceId),
            0x04 => Ok(QuerySelector::SerialNumber),
            0x05 => Ok(QuerySelector::CkdCylinders),
            0x06 => Ok(QuerySelector::FbaOrigin),
            0x07 => Ok(QuerySelector::FbaBlockCount),
            0x08 => Ok(QuerySelector::FbaBlockSize),
            _ => Err(()),
        }
    }
}

// ── Compression ───────────────────────────────────────────────────────────────

/// Payload compression algorithms known to the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    Zlib = 0x01,
    /// Reserved on the wire; never advertised by this implementation.
    Bzip2 = 0x02,
}

impl CompressionAlgorithm {
    /// Bit for this algorithm in a COMPRESS capability mask.
    pub fn mask_bit(self) -> u8 {
        1 << (self as u8 - 1)
    }
}

impl TryFrom<u8> for CompressionAlgorithm {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(CompressionAlgorithm::Zlib),
            0x02 => Ok(CompressionAlgorithm::Bzip2),
            _ => Err(()),
        }
    }
}

/// Capability mask of algorithms this build can encode and decode.
pub const SUPPORTED_ALGORITHMS: u8 = 0x01;

/// Packs a COMPRESS request/response flags byte.
pub fn compress_flags(mask: u8, level: u8) -> u8 {
    ((mask & 0x0F) << 4) | (level & 0x0F)
}

/// Unpacks a COMPRESS flags byte into `(mask, level)`.
pub fn split_compress_flags(flags: u8) -> (u8, u8) {
    (flags >> 4, flags & 0x0F)
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed header prepended to every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Command (request) or response byte, including any modifier bits.
    pub cmd: u8,
    /// Command-specific flags, error sub-status, or compression descriptor.
    pub flags: u8,
    /// Device number the message refers to.
    pub devnum: u16,
    /// Session identity; zero on the first CONNECT.
    pub id: u16,
    /// Payload length in bytes, not including this header.
    pub length: u32,
}

impl Header {
    /// Builds a request header for `command`.
    pub fn request(command: Command, flags: u8, devnum: u16, id: u16) -> Self {
        Self {
            cmd: command as u8,
            flags,
            devnum,
            id,
            length: 0,
        }
    }

    /// Builds a reply header with the given response code.
    pub fn response(code: ResponseCode, flags: u8, devnum: u16, id: u16) -> Self {
        Self {
            cmd: code as u8,
            flags,
            devnum,
            id,
            length: 0,
        }
    }

    /// Returns `true` when the COMP marker is set.
    pub fn is_compressed(&self) -> bool {
        self.cmd & COMP_MARKER != 0
    }

    /// Interprets the command byte as a request opcode.
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.cmd).ok()
    }

    /// Interprets the command byte as a response code.
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_byte(self.cmd)
    }

    /// Returns `true` when a START/RESUME reply carries an invalidation list.
    pub fn has_purge(&self) -> bool {
        self.cmd & PURGE_FLAG != 0
    }
}
