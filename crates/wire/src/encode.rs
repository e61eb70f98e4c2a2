//! Encoders for Snapshot, Frame and Metadata messages.
//!
//! Every encoder validates its input first and returns an [`EncodeError`]
//! instead of emitting a buffer a client would misread. Output buffers are
//! sized exactly up front.

use megane_model::Structure;

use crate::{
    CELL_FLOATS, EncodeError, HEADER_LEN, MAGIC, METADATA_FIXED_LEN, MessageKind, Metadata,
    SnapshotFlags, padded_len,
};

// ============================================================================
// Byte Writer
// ============================================================================

/// Little-endian append-only writer.
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn header(&mut self, kind: MessageKind, flags: u8) {
        self.buf.extend_from_slice(&MAGIC);
        self.buf.push(kind.as_u8());
        self.buf.push(flags);
        self.buf.extend_from_slice(&[0, 0]);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn f32s(&mut self, values: &[f32]) {
        for value in values {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write bytes, then zero-fill up to the next 4-byte boundary.
    fn bytes_padded(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        let pad = padded_len(bytes.len()) - bytes.len();
        self.buf.resize(self.buf.len() + pad, 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn to_u32(field: &'static str, value: usize) -> Result<u32, EncodeError> {
    u32::try_from(value).map_err(|_| EncodeError::CountOverflow { field, value })
}

// ============================================================================
// Snapshot
// ============================================================================

/// Flags a Snapshot of `structure` carries.
pub fn snapshot_flags(structure: &Structure) -> SnapshotFlags {
    SnapshotFlags::new(structure.has_bond_orders(), structure.has_cell())
}

/// Exact byte length of the encoded Snapshot, header included.
pub fn encoded_snapshot_len(structure: &Structure) -> usize {
    let n_atoms = structure.n_atoms();
    let n_bonds = structure.n_bonds();
    let flags = snapshot_flags(structure);

    let mut len = HEADER_LEN + 8;
    len += n_atoms * 3 * 4;
    len += padded_len(n_atoms);
    len += n_bonds * 2 * 4;
    if flags.has_bond_orders() {
        len += padded_len(n_bonds);
    }
    if flags.has_cell() {
        len += CELL_FLOATS * 4;
    }
    len
}

fn validate_structure(structure: &Structure) -> Result<(), EncodeError> {
    let n_atoms = structure.n_atoms();

    let expected = n_atoms * 3;
    if structure.positions.len() != expected {
        return Err(EncodeError::PositionCountMismatch {
            positions: structure.positions.len(),
            n_atoms,
            expected,
        });
    }

    if structure.bonds.len() % 2 != 0 {
        return Err(EncodeError::OddBondArray {
            len: structure.bonds.len(),
        });
    }

    let n_bonds = structure.n_bonds();
    if structure.has_bond_orders() && structure.bond_orders.len() != n_bonds {
        return Err(EncodeError::BondOrderCountMismatch {
            orders: structure.bond_orders.len(),
            bonds: n_bonds,
        });
    }

    for (bond, (a, b)) in structure.bond_pairs().enumerate() {
        for index in [a, b] {
            if index as usize >= n_atoms {
                return Err(EncodeError::BondIndexOutOfRange {
                    bond,
                    index,
                    n_atoms,
                });
            }
        }
    }

    Ok(())
}

/// Encode a full-topology Snapshot message.
///
/// Bond pairs are emitted as `(min, max)` whatever order the structure
/// stores them in.
pub fn encode_snapshot(structure: &Structure) -> Result<Vec<u8>, EncodeError> {
    validate_structure(structure)?;

    let n_atoms = to_u32("n_atoms", structure.n_atoms())?;
    let n_bonds = to_u32("n_bonds", structure.n_bonds())?;
    let flags = snapshot_flags(structure);

    let mut w = Writer::with_capacity(encoded_snapshot_len(structure));
    w.header(MessageKind::Snapshot, flags.bits());
    w.u32(n_atoms);
    w.u32(n_bonds);
    w.f32s(&structure.positions);
    w.bytes_padded(&structure.elements);
    for (a, b) in structure.bond_pairs() {
        w.u32(a.min(b));
        w.u32(a.max(b));
    }
    if flags.has_bond_orders() {
        w.bytes_padded(&structure.bond_orders);
    }
    if flags.has_cell() {
        w.f32s(&structure.cell);
    }

    Ok(w.finish())
}

// ============================================================================
// Frame
// ============================================================================

/// Encode one trajectory frame.
///
/// `positions` is flat `n_atoms * 3` floats; the atom count is derived from it.
pub fn encode_frame(frame_id: u32, positions: &[f32]) -> Result<Vec<u8>, EncodeError> {
    if positions.len() % 3 != 0 {
        return Err(EncodeError::FramePositionsNotTriples {
            len: positions.len(),
        });
    }
    let n_atoms = to_u32("n_atoms", positions.len() / 3)?;

    let mut w = Writer::with_capacity(HEADER_LEN + 8 + positions.len() * 4);
    w.header(MessageKind::Frame, 0);
    w.u32(frame_id);
    w.u32(n_atoms);
    w.f32s(positions);

    Ok(w.finish())
}

// ============================================================================
// Metadata
// ============================================================================

/// Encode a Metadata message, with the extended name tail when
/// `source_names` is non-empty.
pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>, EncodeError> {
    let tail_len = if metadata.source_names.is_empty() {
        0
    } else {
        4 + metadata
            .source_names
            .iter()
            .map(|name| 4 + padded_len(name.len()))
            .sum::<usize>()
    };

    let mut w = Writer::with_capacity(HEADER_LEN + METADATA_FIXED_LEN + tail_len);
    w.header(MessageKind::Metadata, 0);
    w.u32(metadata.n_frames);
    w.f32s(&[metadata.timestep_ps]);
    w.u32(metadata.n_atoms);

    if !metadata.source_names.is_empty() {
        w.u32(to_u32("n_names", metadata.source_names.len())?);
        for name in &metadata.source_names {
            w.u32(to_u32("name_len", name.len())?);
            w.bytes_padded(name.as_bytes());
        }
    }

    Ok(w.finish())
}

// ============================================================================
// Tests
// ============================================================================
