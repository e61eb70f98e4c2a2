//! Decoders matching the layout the viewer client reads.
//!
//! Every read is bounds-checked against the buffer before any indexing, so a
//! truncated or hostile buffer yields a [`DecodeError`], never a panic.

use megane_model::{NO_CELL, Structure};

use crate::{
    CELL_FLOATS, DecodeError, HEADER_LEN, Header, MAGIC, MessageKind, Metadata, SnapshotFlags,
    padded_len,
};

// ============================================================================
// Decoded Types
// ============================================================================

/// A decoded Frame message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_id: u32,
    /// Flat `n_atoms * 3` floats.
    pub positions: Vec<f32>,
}

impl Frame {
    pub fn n_atoms(&self) -> usize {
        self.positions.len() / 3
    }
}

/// Any decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Snapshot(Structure),
    Frame(Frame),
    Metadata(Metadata),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Snapshot(_) => MessageKind::Snapshot,
            Self::Frame(_) => MessageKind::Frame,
            Self::Metadata(_) => MessageKind::Metadata,
        }
    }
}

// ============================================================================
// Byte Reader
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len().saturating_sub(self.pos);
        if len > available {
            return Err(DecodeError::Truncated {
                field,
                needed: len,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(field, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f32s(&mut self, field: &'static str, count: usize) -> Result<Vec<f32>, DecodeError> {
        let len = count
            .checked_mul(4)
            .ok_or(DecodeError::LengthOverflow { field })?;
        let bytes = self.take(field, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn u32s(&mut self, field: &'static str, count: usize) -> Result<Vec<u32>, DecodeError> {
        let len = count
            .checked_mul(4)
            .ok_or(DecodeError::LengthOverflow { field })?;
        let bytes = self.take(field, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Read `len` bytes and skip the zero padding up to the next 4-byte
    /// boundary of the payload.
    fn bytes_padded(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        let bytes = self.take(field, len)?;
        let pad = padded_len(len) - len;
        self.take(field, pad)?;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

fn count(field: &'static str, value: u32, per_item: usize) -> Result<usize, DecodeError> {
    (value as usize)
        .checked_mul(per_item)
        .ok_or(DecodeError::LengthOverflow { field })
}

// ============================================================================
// Header
// ============================================================================

/// Decode and check the common 8-byte header.
///
/// The reserved bytes are not checked so that later protocol revisions can
/// use them without breaking older decoders.
pub fn decode_header(bytes: &[u8]) -> Result<Header, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            field: "header",
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let kind = MessageKind::from_u8(bytes[4]).ok_or(DecodeError::UnknownMessageType(bytes[4]))?;
    Ok(Header {
        kind,
        flags: bytes[5],
    })
}

fn expect_kind(bytes: &[u8], expected: MessageKind) -> Result<Header, DecodeError> {
    let header = decode_header(bytes)?;
    if header.kind != expected {
        return Err(DecodeError::UnexpectedMessageType {
            expected: expected.as_str(),
            found: header.kind.as_str(),
        });
    }
    Ok(header)
}

// ============================================================================
// Snapshot
// ============================================================================

/// Decode a Snapshot message into a Structure.
///
/// Absent bond orders decode as an empty vector; an absent cell decodes as
/// the all-zero sentinel.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Structure, DecodeError> {
    let header = expect_kind(bytes, MessageKind::Snapshot)?;
    let flags = SnapshotFlags::from_bits(header.flags)?;

    let mut r = Reader::new(bytes, HEADER_LEN);
    let n_atoms = r.u32("n_atoms")?;
    let n_bonds = r.u32("n_bonds")?;

    let positions = r.f32s("positions", count("positions", n_atoms, 3)?)?;
    let elements = r.bytes_padded("elements", n_atoms as usize)?.to_vec();
    let bonds = r.u32s("bonds", count("bonds", n_bonds, 2)?)?;

    let bond_orders = if flags.has_bond_orders() {
        r.bytes_padded("bond_orders", n_bonds as usize)?.to_vec()
    } else {
        Vec::new()
    };

    let cell = if flags.has_cell() {
        let values = r.f32s("cell", CELL_FLOATS)?;
        let mut cell = NO_CELL;
        cell.copy_from_slice(&values);
        cell
    } else {
        NO_CELL
    };

    for (i, &index) in bonds.iter().enumerate() {
        if index >= n_atoms {
            return Err(DecodeError::BondIndexOutOfRange {
                bond: i / 2,
                index,
                n_atoms: n_atoms as usize,
            });
        }
    }

    Ok(Structure {
        positions,
        elements,
        bonds,
        bond_orders,
        cell,
    })
}

// ============================================================================
// Frame
// ============================================================================

/// Decode a Frame message.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    expect_kind(bytes, MessageKind::Frame)?;

    let mut r = Reader::new(bytes, HEADER_LEN);
    let frame_id = r.u32("frame_id")?;
    let n_atoms = r.u32("n_atoms")?;
    let positions = r.f32s("positions", count("positions", n_atoms, 3)?)?;

    Ok(Frame {
        frame_id,
        positions,
    })
}

// ============================================================================
// Metadata
// ============================================================================

/// Decode a Metadata message, reading the extended name tail if present.
pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata, DecodeError> {
    expect_kind(bytes, MessageKind::Metadata)?;

    let mut r = Reader::new(bytes, HEADER_LEN);
    let n_frames = r.u32("n_frames")?;
    let timestep_ps = f32::from_bits(r.u32("timestep_ps")?);
    let n_atoms = r.u32("n_atoms")?;

    let mut source_names = Vec::new();
    if r.remaining() > 0 {
        let n_names = r.u32("n_names")?;
        for i in 0..n_names as usize {
            let len = r.u32("name_len")? as usize;
            let raw = r.bytes_padded("name", len)?;
            let name = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(i))?;
            source_names.push(name.to_string());
        }
    }

    Ok(Metadata {
        n_frames,
        timestep_ps,
        n_atoms,
        source_names,
    })
}

// ============================================================================
// Any Message
// ============================================================================

/// Decode whichever message the header announces.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    match decode_header(bytes)?.kind {
        MessageKind::Snapshot => decode_snapshot(bytes).map(Message::Snapshot),
        MessageKind::Frame => decode_frame(bytes).map(Message::Frame),
        MessageKind::Metadata => decode_metadata(bytes).map(Message::Metadata),
    }
}

// ============================================================================
// Tests
// ============================================================================
