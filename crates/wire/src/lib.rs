//! megane Wire Protocol
//!
//! This crate defines the binary messages sent from the server to viewer
//! clients, and the text commands clients send back. Both the server and any
//! Rust-side client MUST depend on this crate so the layout has one owner.
//!
//! # Message Framing
//!
//! Every binary message starts with an 8-byte header:
//!
//! ```text
//! magic "MEGN" (4) | msg_type u8 | flags u8 | reserved u16 (zero)
//! ```
//!
//! - **Snapshot** (`msg_type = 0`): full topology, sent once per connection
//!   and once per reconfigure.
//! - **Frame** (`msg_type = 1`): positions only, one trajectory timestep.
//! - **Metadata** (`msg_type = 2`): frame count, timestep, atom count.
//!
//! All multi-byte integers and floats are little-endian. Every `u8` array is
//! zero-padded to the next 4-byte boundary so that clients can view the
//! following fields as aligned typed arrays.
//!
//! # Control Channel
//!
//! See [`command`] for the JSON command vocabulary.

#![deny(unsafe_code)]

pub mod command;
mod decode;
mod encode;

use thiserror::Error;

pub use command::{ClientCommand, ParsedCommand, parse_command};
pub use decode::{Frame, Message, decode_frame, decode_header, decode_message, decode_metadata, decode_snapshot};
pub use encode::{encode_frame, encode_metadata, encode_snapshot, encoded_snapshot_len, snapshot_flags};

// ============================================================================
// Constants
// ============================================================================

/// Literal magic at the start of every message.
pub const MAGIC: [u8; 4] = *b"MEGN";

/// Size of the common message header.
pub const HEADER_LEN: usize = 8;

/// Size of the fixed part of the Metadata payload.
pub const METADATA_FIXED_LEN: usize = 12;

/// Number of floats in a periodic cell (row-major 3x3).
pub const CELL_FLOATS: usize = 9;

/// Round `len` up to the next multiple of 4.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

// ============================================================================
// Message Kind
// ============================================================================

/// The `msg_type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Snapshot = 0,
    Frame = 1,
    Metadata = 2,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Snapshot),
            1 => Some(Self::Frame),
            2 => Some(Self::Metadata),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Frame => "frame",
            Self::Metadata => "metadata",
        }
    }
}

// ============================================================================
// Snapshot Flags
// ============================================================================

/// Flag bits carried by a Snapshot header.
///
/// Flags are derived from the structure at encode time, never supplied by
/// the caller. Bits other than [`SnapshotFlags::BOND_ORDERS`] and
/// [`SnapshotFlags::CELL`] are reserved and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotFlags(u8);

impl SnapshotFlags {
    /// Bond orders follow the bond list.
    pub const BOND_ORDERS: u8 = 0b0000_0001;
    /// A 3x3 cell follows the bond orders (or the bonds).
    pub const CELL: u8 = 0b0000_0010;

    const KNOWN: u8 = Self::BOND_ORDERS | Self::CELL;

    pub fn new(bond_orders: bool, cell: bool) -> Self {
        let mut bits = 0;
        if bond_orders {
            bits |= Self::BOND_ORDERS;
        }
        if cell {
            bits |= Self::CELL;
        }
        Self(bits)
    }

    /// Parse received flag bits, rejecting reserved bits.
    pub fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        if bits & !Self::KNOWN != 0 {
            return Err(DecodeError::ReservedFlags(bits));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_bond_orders(self) -> bool {
        self.0 & Self::BOND_ORDERS != 0
    }

    pub fn has_cell(self) -> bool {
        self.0 & Self::CELL != 0
    }
}

// ============================================================================
// Header
// ============================================================================

/// Decoded common header.
///
/// `flags` is kept raw here; only Snapshot interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub flags: u8,
}

// ============================================================================
// Metadata
// ============================================================================

/// Trajectory description sent after every Snapshot.
///
/// `source_names` is for display only. When it is empty the payload is the
/// fixed 12 bytes; otherwise an extended tail follows:
/// `n_names u32`, then per name `len u32 | utf8 bytes | zero-pad to 4`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub n_frames: u32,
    pub timestep_ps: f32,
    pub n_atoms: u32,
    pub source_names: Vec<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Precondition violations detected while encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("positions hold {positions} floats, expected {expected} for {n_atoms} atoms")]
    PositionCountMismatch {
        positions: usize,
        n_atoms: usize,
        expected: usize,
    },

    #[error("bond array has odd length {len}")]
    OddBondArray { len: usize },

    #[error("bond {bond} references atom {index}, but there are only {n_atoms} atoms")]
    BondIndexOutOfRange { bond: usize, index: u32, n_atoms: usize },

    #[error("{orders} bond orders given for {bonds} bonds")]
    BondOrderCountMismatch { orders: usize, bonds: usize },

    #[error("frame has {len} coordinates, not a multiple of 3")]
    FramePositionsNotTriples { len: usize },

    #[error("{field} = {value} does not fit in u32")]
    CountOverflow { field: &'static str, value: usize },
}

/// Failures while decoding a received buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer truncated reading {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("expected {expected} message, found {found}")]
    UnexpectedMessageType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("reserved snapshot flag bits set: {0:#010b}")]
    ReservedFlags(u8),

    #[error("declared length of {field} overflows")]
    LengthOverflow { field: &'static str },

    #[error("bond {bond} references atom {index}, but there are only {n_atoms} atoms")]
    BondIndexOutOfRange { bond: usize, index: u32, n_atoms: usize },

    #[error("source name {0} is not valid UTF-8")]
    InvalidUtf8(usize),
}

// ============================================================================
// Tests
// ============================================================================
