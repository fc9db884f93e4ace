//! Per-subject records: voxel matrices and their event streams.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;

use crate::stream::EventStream;

/// One subject's training data: the voxel response matrix plus the stream of
/// behavioral events addressing it. Voxel counts differ between subjects.
pub struct SubjectRecord {
    pub id: u32,
    voxels: Array2<f32>,
    pub stream: Box<dyn EventStream>,
}

impl SubjectRecord {
    pub fn new(id: u32, voxels: Array2<f32>, stream: Box<dyn EventStream>) -> Self {
        Self { id, voxels, stream }
    }

    /// Load the voxel matrix from `<data_path>/voxels/subj<NN>.npy`.
    pub fn from_npy(id: u32, data_path: &Path, stream: Box<dyn EventStream>) -> Result<Self> {
        let path = data_path.join(format!("voxels/subj{:02}.npy", id));
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open voxel matrix {:?}", path))?;
        let voxels = Array2::<f32>::read_npy(file)
            .with_context(|| format!("failed to parse voxel matrix {:?}", path))?;
        Ok(Self::new(id, voxels, stream))
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.ncols()
    }

    pub fn num_samples(&self) -> usize {
        self.voxels.nrows()
    }

    /// Copy one voxel row into `out`. A row index past the end is a
    /// programmer error (behavioral files disagree with the voxel matrix).
    pub fn copy_row(&self, row: usize, out: &mut Vec<f32>) -> Result<()> {
        ensure!(
            row < self.voxels.nrows(),
            "subject {:02}: voxel row {} outside matrix of {} samples",
            self.id,
            row,
            self.voxels.nrows()
        );
        out.extend(self.voxels.row(row).iter().copied());
        Ok(())
    }

    /// Append a zero row (used when masking out shared context samples).
    pub fn push_zero_row(&self, out: &mut Vec<f32>) {
        out.extend(std::iter::repeat(0.0).take(self.num_voxels()));
    }

    /// Gather rows into a `[rows.len(), num_voxels]` tensor.
    pub fn gather_rows<B: Backend>(
        &self,
        rows: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, 2>> {
        let mut flat = Vec::with_capacity(rows.len() * self.num_voxels());
        for &row in rows {
            self.copy_row(row, &mut flat)?;
        }
        let t = Tensor::<B, 1>::from_data(flat.as_slice(), device);
        Ok(t.reshape([rows.len(), self.num_voxels()]))
    }
}
