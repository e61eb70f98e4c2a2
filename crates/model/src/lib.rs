//! megane Molecular Model
//!
//! This crate contains the in-memory representation of a loaded molecule and
//! its trajectory. It is what the external loaders (PDB, GRO, XYZ, XTC) hand
//! to the streaming core.
//!
//! # Architecture Constraints
//!
//! The model MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Parse chemical file formats
//! - Depend on the wire layout
//!
//! Encoding into bytes is owned by `megane-wire`; serving is owned by
//! `megane-server`.

#![deny(unsafe_code)]

use thiserror::Error;

// ============================================================================
// Type Aliases
// ============================================================================

/// Index of an atom within a Structure.
pub type AtomIndex = u32;

/// Atomic number (element code), one byte per atom.
pub type ElementCode = u8;

/// Row-major 3x3 periodic cell matrix.
pub type CellMatrix = [f32; 9];

/// All-zero cell: the sentinel for "no periodic cell".
pub const NO_CELL: CellMatrix = [0.0; 9];

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building model types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("trajectory atom count must be positive")]
    ZeroAtoms,

    #[error("frame data length {len} is not a multiple of {stride} (n_atoms * 3)")]
    RaggedFrameData { len: usize, stride: usize },

    #[error("frame {frame} has {len} coordinates, expected {expected}")]
    FrameLengthMismatch {
        frame: usize,
        len: usize,
        expected: usize,
    },
}

// ============================================================================
// Structure
// ============================================================================

/// One loaded molecule.
///
/// `positions` is flat `[x0, y0, z0, x1, y1, z1, ...]` in angstrom, `bonds` is
/// flat `[a0, b0, a1, b1, ...]`. `bond_orders` is either empty or holds one
/// entry per bond. A `cell` of all zeros means the structure has no periodic
/// cell.
///
/// Fields are public so loaders can fill them directly; the wire encoder
/// re-checks every invariant before emitting bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub positions: Vec<f32>,
    pub elements: Vec<ElementCode>,
    pub bonds: Vec<AtomIndex>,
    pub bond_orders: Vec<u8>,
    pub cell: CellMatrix,
}

impl Structure {
    /// Build a structure, storing every bond pair as `(min, max)`.
    pub fn new(
        positions: Vec<f32>,
        elements: Vec<ElementCode>,
        bonds: Vec<AtomIndex>,
        bond_orders: Vec<u8>,
        cell: CellMatrix,
    ) -> Self {
        let mut structure = Self {
            positions,
            elements,
            bonds,
            bond_orders,
            cell,
        };
        structure.canonicalize_bonds();
        structure
    }

    /// Structure without bonds or cell (e.g. a bare XYZ frame).
    pub fn from_atoms(positions: Vec<f32>, elements: Vec<ElementCode>) -> Self {
        Self::new(positions, elements, Vec::new(), Vec::new(), NO_CELL)
    }

    /// Number of atoms (one element code per atom).
    pub fn n_atoms(&self) -> usize {
        self.elements.len()
    }

    /// Number of complete bond pairs.
    pub fn n_bonds(&self) -> usize {
        self.bonds.len() / 2
    }

    pub fn has_bond_orders(&self) -> bool {
        !self.bond_orders.is_empty()
    }

    /// True iff the cell has at least one non-zero entry.
    pub fn has_cell(&self) -> bool {
        self.cell.iter().any(|&v| v != 0.0)
    }

    /// The cell matrix, or `None` for the all-zero sentinel.
    pub fn cell_or_none(&self) -> Option<&CellMatrix> {
        self.has_cell().then_some(&self.cell)
    }

    /// Iterate bond pairs as `(a, b)`. A trailing odd index is skipped.
    pub fn bond_pairs(&self) -> impl Iterator<Item = (AtomIndex, AtomIndex)> + '_ {
        self.bonds.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }

    /// Rewrite each bond pair as `(min, max)`.
    pub fn canonicalize_bonds(&mut self) {
        for pair in self.bonds.chunks_exact_mut(2) {
            if pair[0] > pair[1] {
                pair.swap(0, 1);
            }
        }
    }
}

// ============================================================================
// Trajectory
// ============================================================================

/// A sequence of frames sharing a Structure's topology.
///
/// Implementations are shared between connection tasks, so they must be
/// `Send + Sync`. `frame` returns a fresh buffer on every call; callers may
/// keep it past the next fetch.
pub trait Trajectory: Send + Sync {
    /// Number of frames (F).
    fn n_frames(&self) -> usize;

    /// Atoms per frame. Must equal the Structure's atom count.
    fn n_atoms(&self) -> usize;

    /// Time between consecutive frames in picoseconds.
    fn timestep_ps(&self) -> f32;

    /// Positions of frame `index` as flat `n_atoms * 3` floats, or `None` if
    /// `index >= n_frames()`.
    fn frame(&self, index: usize) -> Option<Vec<f32>>;
}

/// Trajectory held fully in memory as concatenated frame data.
///
/// This is the shape produced by multi-model PDB files and multi-frame XYZ
/// files, as well as by XTC readers that decode everything up front.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryTrajectory {
    n_atoms: usize,
    timestep_ps: f32,
    /// `n_frames * n_atoms * 3` floats.
    frame_data: Vec<f32>,
}

impl InMemoryTrajectory {
    /// Wrap concatenated frame data.
    pub fn new(n_atoms: usize, timestep_ps: f32, frame_data: Vec<f32>) -> Result<Self, ModelError> {
        if n_atoms == 0 {
            return Err(ModelError::ZeroAtoms);
        }
        let stride = n_atoms * 3;
        if frame_data.len() % stride != 0 {
            return Err(ModelError::RaggedFrameData {
                len: frame_data.len(),
                stride,
            });
        }
        Ok(Self {
            n_atoms,
            timestep_ps,
            frame_data,
        })
    }

    /// Build from individual frames; every frame must have the same length.
    pub fn from_frames(timestep_ps: f32, frames: Vec<Vec<f32>>) -> Result<Self, ModelError> {
        let Some(first) = frames.first() else {
            return Err(ModelError::ZeroAtoms);
        };
        let expected = first.len();
        if expected == 0 || expected % 3 != 0 {
            return Err(ModelError::RaggedFrameData {
                len: expected,
                stride: 3,
            });
        }
        let mut frame_data = Vec::with_capacity(expected * frames.len());
        for (frame, positions) in frames.iter().enumerate() {
            if positions.len() != expected {
                return Err(ModelError::FrameLengthMismatch {
                    frame,
                    len: positions.len(),
                    expected,
                });
            }
            frame_data.extend_from_slice(positions);
        }
        Self::new(expected / 3, timestep_ps, frame_data)
    }

    fn stride(&self) -> usize {
        self.n_atoms * 3
    }
}

impl Trajectory for InMemoryTrajectory {
    fn n_frames(&self) -> usize {
        self.frame_data.len() / self.stride()
    }

    fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    fn timestep_ps(&self) -> f32 {
        self.timestep_ps
    }

    fn frame(&self, index: usize) -> Option<Vec<f32>> {
        let stride = self.stride();
        let start = index.checked_mul(stride)?;
        let end = start.checked_add(stride)?;
        self.frame_data.get(start..end).map(<[f32]>::to_vec)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> Structure {
        Structure::new(
            vec![0.0, 0.0, 0.0, 0.96, 0.0, 0.0, -0.24, 0.93, 0.0],
            vec![8, 1, 1],
            vec![1, 0, 2, 0],
            vec![1, 1],
            NO_CELL,
        )
    }

    #[test]
    fn test_new_canonicalizes_bond_pairs() {
        let s = water();
        let pairs: Vec<_> = s.bond_pairs().collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn test_counts() {
        let s = water();
        assert_eq!(s.n_atoms(), 3);
        assert_eq!(s.n_bonds(), 2);
        assert!(s.has_bond_orders());
    }

    #[test]
    fn test_zero_cell_is_absent() {
        let mut s = water();
        assert!(!s.has_cell());
        assert!(s.cell_or_none().is_none());

        s.cell[8] = 30.0;
        assert!(s.has_cell());
        assert_eq!(s.cell_or_none().map(|c| c[8]), Some(30.0));
    }

    #[test]
    fn test_negative_zero_cell_is_absent() {
        let mut s = water();
        s.cell = [-0.0; 9];
        assert!(!s.has_cell());
    }

    #[test]
    fn test_from_atoms_has_no_topology() {
        let s = Structure::from_atoms(vec![1.0, 2.0, 3.0], vec![6]);
        assert_eq!(s.n_bonds(), 0);
        assert!(!s.has_bond_orders());
        assert!(!s.has_cell());
    }

    #[test]
    fn test_in_memory_trajectory_frames() {
        let data: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let traj = InMemoryTrajectory::new(3, 2.0, data).unwrap();

        assert_eq!(traj.n_frames(), 2);
        assert_eq!(traj.n_atoms(), 3);
        assert_eq!(traj.timestep_ps(), 2.0);
        assert_eq!(traj.frame(1).unwrap()[0], 9.0);
        assert!(traj.frame(2).is_none());
        assert!(traj.frame(usize::MAX).is_none());
    }

    #[test]
    fn test_frame_is_independent_buffer() {
        let traj = InMemoryTrajectory::new(1, 1.0, vec![1.0, 2.0, 3.0]).unwrap();
        let mut a = traj.frame(0).unwrap();
        a[0] = 99.0;
        assert_eq!(traj.frame(0).unwrap()[0], 1.0);
    }

    #[test]
    fn test_ragged_frame_data_rejected() {
        let result = InMemoryTrajectory::new(2, 1.0, vec![0.0; 7]);
        assert_eq!(
            result,
            Err(ModelError::RaggedFrameData { len: 7, stride: 6 })
        );
        assert_eq!(
            InMemoryTrajectory::new(0, 1.0, vec![]),
            Err(ModelError::ZeroAtoms)
        );
    }

    #[test]
    fn test_from_frames() {
        let traj =
            InMemoryTrajectory::from_frames(0.5, vec![vec![0.0; 6], vec![1.0; 6], vec![2.0; 6]])
                .unwrap();
        assert_eq!(traj.n_frames(), 3);
        assert_eq!(traj.n_atoms(), 2);
        assert_eq!(traj.frame(2).unwrap(), vec![2.0; 6]);

        let mismatch = InMemoryTrajectory::from_frames(0.5, vec![vec![0.0; 6], vec![0.0; 3]]);
        assert!(matches!(
            mismatch,
            Err(ModelError::FrameLengthMismatch { frame: 1, .. })
        ));
    }
}
