//! Sparsemax: Euclidean projection onto the probability simplex
//! (Martins & Astudillo, 2016). Unlike softmax it returns exact zeros for
//! low-scoring entries.

use crate::candle_aux_ops::*;

use candle_core::{CpuStorage, CudaStorage, CustomOp1, Layout, MetalStorage, Result, Shape, Tensor};
use candle_nn::Module;

/// Project `input` onto the simplex along `axis`.
///
/// For each slice `z` along `axis`, with `z_(1) >= z_(2) >= ...` sorted:
/// * `k = max { j : 1 + j z_(j) > sum_{i <= j} z_(i) }`
/// * `tau = (sum_{i <= k} z_(i) - 1) / k`
/// * `out_i = max(0, z_i - tau)`
///
/// The input is shifted by its maximum first, so `z_(1) = 0` and the first
/// entry always satisfies the support condition (`k >= 1`).
pub fn sparsemax(input: &Tensor, axis: usize) -> Result<Tensor> {
    let rank = input.rank();
    if axis >= rank {
        candle_core::bail!("sparsemax axis {} out of range for {:?}", axis, input.dims());
    }

    let last = rank - 1;
    let moved = input.detach().transpose(axis, last)?.contiguous()?;
    let moved_dims = moved.dims().to_vec();
    let n_class = moved_dims[last];
    let rows = moved.elem_count() / n_class.max(1);

    let out_rc = project_rows(&moved.reshape((rows, n_class))?)?;
    let out = out_rc.reshape(moved_dims)?.transpose(axis, last)?;

    input.apply_op1(SparsemaxOp {
        axis,
        output: owned_detached(&out)?,
    })
}

fn project_rows(z_rc: &Tensor) -> Result<Tensor> {
    let (_, n_class) = z_rc.dims2()?;
    let dtype = z_rc.dtype();

    let z_rc = z_rc.broadcast_sub(&z_rc.max_keepdim(1)?)?;
    let (sorted_rc, _) = z_rc.sort_last_dim(false)?;
    let cumsum_rc = sorted_rc.cumsum(1)?;

    let range_1c = Tensor::arange(1u32, n_class as u32 + 1, z_rc.device())?
        .to_dtype(dtype)?
        .unsqueeze(0)?;

    let bound_rc = (range_1c.broadcast_mul(&sorted_rc)? + 1.0)?;
    let is_gt_rc = bound_rc.gt(&cumsum_rc)?.to_dtype(dtype)?;

    let k_r1 = is_gt_rc.broadcast_mul(&range_1c)?.max_keepdim(1)?;
    let taus_r1 = ((is_gt_rc * sorted_rc)?.sum_keepdim(1)? - 1.0)?.div(&k_r1)?;

    z_rc.broadcast_sub(&taus_r1)?.relu()
}

/// Backward context is the op's own output: its support decides which
/// coordinates receive gradient.
struct SparsemaxOp {
    axis: usize,
    output: Tensor,
}

impl CustomOp1 for SparsemaxOp {
    fn name(&self) -> &'static str {
        "sparsemax"
    }

    fn cpu_fwd(&self, _: &CpuStorage, _: &Layout) -> Result<(CpuStorage, Shape)> {
        cached_cpu_storage(&self.output)
    }

    fn cuda_fwd(&self, _: &CudaStorage, _: &Layout) -> Result<(CudaStorage, Shape)> {
        cached_cuda_storage(&self.output)
    }

    fn metal_fwd(&self, _: &MetalStorage, _: &Layout) -> Result<(MetalStorage, Shape)> {
        cached_metal_storage(&self.output)
    }

    /// `nz * (g - sum(g * nz) / sum(nz))` along the projection axis
    fn bwd(&self, _arg: &Tensor, res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let nz = res.ne(0.0)?.to_dtype(res.dtype())?;
        let support = nz.sum_keepdim(self.axis)?;
        let g_mean = grad_res.mul(&nz)?.sum_keepdim(self.axis)?.div(&support)?;
        let grad = grad_res.broadcast_sub(&g_mean)?.mul(&nz)?;
        Ok(Some(grad))
    }
}

/// Sparsemax as a layer; `dim: None` projects along the last axis
#[derive(Clone, Copy, Debug, Default)]
pub struct Sparsemax {
    pub dim: Option<usize>,
}

impl Sparsemax {
    pub fn new(dim: usize) -> Self {
        Self { dim: Some(dim) }
    }
}

impl Module for Sparsemax {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let axis = match self.dim {
            Some(d) => d,
            None => xs.rank().saturating_sub(1),
        };
        sparsemax(xs, axis)
    }
}
