//! Binary packet codec.
//!
//! Every packet is a fixed 12-byte header followed by an argument section:
//!
//! ```text
//! +-----------+-------------------+---------------------+---------------------+
//! | magic (4) | type (4 bytes BE) | arg length (4, BE)  | args, NUL-separated |
//! +-----------+-------------------+---------------------+---------------------+
//! ```
//!
//! The magic is `\0REQ` for client-to-server packets and `\0RES` for
//! server-to-client packets. Each packet type has a fixed number of arguments;
//! only the last one may contain NUL bytes, which is how opaque payloads travel
//! unescaped.
//!
//! [`decode`] is a pure, restartable parse: handed an accumulating buffer it
//! either consumes exactly one packet or reports [`Decoded::NeedMoreData`], so
//! partial and merged TCP reads are handled by the caller simply buffering.

use crate::{Priority, ProtocolError};

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 12;

/// Largest argument section accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Header fields
// ---------------------------------------------------------------------------

/// Direction tag at the start of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Client (or worker) to server: `\0REQ`.
    Request,
    /// Server to client (or worker): `\0RES`.
    Response,
}

impl Magic {
    /// Returns the four header bytes for this direction.
    pub const fn tag(self) -> &'static [u8; 4] {
        match self {
            Magic::Request => b"\0REQ",
            Magic::Response => b"\0RES",
        }
    }

    fn from_tag(tag: &[u8; 4]) -> Option<Self> {
        match tag {
            b"\0REQ" => Some(Magic::Request),
            b"\0RES" => Some(Magic::Response),
            _ => None,
        }
    }
}

/// Packet types understood by the client side of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    SubmitJob = 7,
    JobCreated = 8,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    /// Every known packet type, in code order.
    pub const ALL: [PacketType; 18] = [
        PacketType::SubmitJob,
        PacketType::JobCreated,
        PacketType::WorkStatus,
        PacketType::WorkComplete,
        PacketType::WorkFail,
        PacketType::GetStatus,
        PacketType::EchoReq,
        PacketType::EchoRes,
        PacketType::SubmitJobBg,
        PacketType::Error,
        PacketType::StatusRes,
        PacketType::SubmitJobHigh,
        PacketType::WorkException,
        PacketType::WorkData,
        PacketType::WorkWarning,
        PacketType::SubmitJobHighBg,
        PacketType::SubmitJobLow,
        PacketType::SubmitJobLowBg,
    ];

    /// Returns the numeric code written in the header.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Looks a packet type up by its header code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// Number of arguments the packet carries.
    pub const fn arity(self) -> usize {
        match self {
            PacketType::JobCreated
            | PacketType::WorkFail
            | PacketType::GetStatus
            | PacketType::EchoReq
            | PacketType::EchoRes => 1,
            PacketType::WorkComplete
            | PacketType::Error
            | PacketType::WorkException
            | PacketType::WorkData
            | PacketType::WorkWarning => 2,
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg
            | PacketType::WorkStatus => 3,
            PacketType::StatusRes => 5,
        }
    }

    /// Protocol name of the packet type (e.g. `"SUBMIT_JOB_BG"`).
    pub const fn name(self) -> &'static str {
        match self {
            PacketType::SubmitJob => "SUBMIT_JOB",
            PacketType::JobCreated => "JOB_CREATED",
            PacketType::WorkStatus => "WORK_STATUS",
            PacketType::WorkComplete => "WORK_COMPLETE",
            PacketType::WorkFail => "WORK_FAIL",
            PacketType::GetStatus => "GET_STATUS",
            PacketType::EchoReq => "ECHO_REQ",
            PacketType::EchoRes => "ECHO_RES",
            PacketType::SubmitJobBg => "SUBMIT_JOB_BG",
            PacketType::Error => "ERROR",
            PacketType::StatusRes => "STATUS_RES",
            PacketType::SubmitJobHigh => "SUBMIT_JOB_HIGH",
            PacketType::WorkException => "WORK_EXCEPTION",
            PacketType::WorkData => "WORK_DATA",
            PacketType::WorkWarning => "WORK_WARNING",
            PacketType::SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            PacketType::SubmitJobLow => "SUBMIT_JOB_LOW",
            PacketType::SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
        }
    }

    /// Selects the submit variant for a background flag and priority.
    pub const fn submit(background: bool, priority: Priority) -> Self {
        match (background, priority) {
            (false, Priority::Low) => PacketType::SubmitJobLow,
            (false, Priority::Normal) => PacketType::SubmitJob,
            (false, Priority::High) => PacketType::SubmitJobHigh,
            (true, Priority::Low) => PacketType::SubmitJobLowBg,
            (true, Priority::Normal) => PacketType::SubmitJobBg,
            (true, Priority::High) => PacketType::SubmitJobHighBg,
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One decoded or to-be-encoded packet.
///
/// Construction validates the argument count and that no argument but the
/// last contains a NUL, so every `Packet` encodes to bytes that decode back
/// to an equal `Packet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    magic: Magic,
    kind: PacketType,
    args: Vec<Vec<u8>>,
}

impl Packet {
    /// Creates a packet after validating its arguments against `kind`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ArgumentCount`] if the argument count is wrong,
    /// [`ProtocolError::EmbeddedNul`] if a non-final argument contains NUL,
    /// [`ProtocolError::PacketTooLarge`] if the argument section cannot be
    /// described by the 32-bit length field.
    pub fn new(magic: Magic, kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        if args.len() != kind.arity() {
            return Err(ProtocolError::ArgumentCount {
                packet: kind.name(),
                expected: kind.arity(),
                found: args.len(),
            });
        }
        let last = args.len().saturating_sub(1);
        if let Some(index) = args[..last].iter().position(|arg| arg.contains(&0)) {
            return Err(ProtocolError::EmbeddedNul {
                packet: kind.name(),
                index,
            });
        }
        let packet = Self { magic, kind, args };
        let size = packet.body_len();
        if u32::try_from(size).is_err() {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: u32::MAX as usize,
            });
        }
        Ok(packet)
    }

    /// Creates a client-to-server packet.
    pub fn request(kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        Self::new(Magic::Request, kind, args)
    }

    /// Creates a server-to-client packet.
    pub fn response(kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        Self::new(Magic::Response, kind, args)
    }

    /// Request or response direction.
    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// Packet type from the header.
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// All arguments in wire order.
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Returns argument `index`, or `None` past the end.
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(Vec::as_slice)
    }

    /// Consumes the packet and returns its arguments.
    pub fn into_args(self) -> Vec<Vec<u8>> {
        self.args
    }

    fn body_len(&self) -> usize {
        let separators = self.args.len().saturating_sub(1);
        self.args.iter().map(Vec::len).sum::<usize>() + separators
    }

    /// Encodes header and arguments into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(self.magic.tag());
        out.extend_from_slice(&self.kind.code().to_be_bytes());
        // Fits: checked in `new`.
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(arg);
        }
        out
    }
}

/// Encodes a packet in one step.
///
/// # Errors
///
/// See [`Packet::new`].
pub fn encode(magic: Magic, kind: PacketType, args: Vec<Vec<u8>>) -> Result<Vec<u8>, ProtocolError> {
    Packet::new(magic, kind, args).map(|packet| packet.encode())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Outcome of one [`decode`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole packet was parsed from the front of the buffer.
    Packet {
        packet: Packet,
        /// Bytes the caller must drop from the front of its buffer.
        consumed: usize,
    },
    /// The buffer ends inside a packet; read more bytes and retry.
    NeedMoreData,
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parses one packet from the front of `buf`.
///
/// Never consumes a partial packet. The header is validated as soon as it is
/// complete, so a bad magic or unknown type is reported without waiting for
/// the argument section.
///
/// # Errors
///
/// Any [`ProtocolError`] other than `UnexpectedPacket`; the stream cannot be
/// resynchronised afterwards.
pub fn decode(buf: &[u8], max_packet_size: usize) -> Result<Decoded, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMoreData);
    }

    let tag = [buf[0], buf[1], buf[2], buf[3]];
    let magic = Magic::from_tag(&tag).ok_or(ProtocolError::BadMagic { found: tag })?;
    let code = read_u32(&buf[4..8]);
    let kind = PacketType::from_code(code).ok_or(ProtocolError::UnknownPacketType { code })?;
    let size = read_u32(&buf[8..12]) as usize;
    if size > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size,
            max: max_packet_size,
        });
    }

    let total = HEADER_LEN + size;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let args = split_arguments(kind, &buf[HEADER_LEN..total])?;
    Ok(Decoded::Packet {
        packet: Packet { magic, kind, args },
        consumed: total,
    })
}

fn split_arguments(kind: PacketType, body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let args: Vec<Vec<u8>> = body
        .splitn(kind.arity(), |byte| *byte == 0)
        .map(<[u8]>::to_vec)
        .collect();
    if args.len() != kind.arity() {
        return Err(ProtocolError::ArgumentCount {
            packet: kind.name(),
            expected: kind.arity(),
            found: args.len(),
        });
    }
    Ok(args)
}
