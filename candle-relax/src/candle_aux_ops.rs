use candle_core::backend::BackendStorage;
use candle_core::{
    CpuStorage, CudaStorage, DType, Device, MetalStorage, Result, Shape, Storage, Tensor,
};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Hand the storage of a forward value evaluated ahead of time back to
/// candle. Custom ops built on this only contribute their `bwd`.
///
/// The cached tensor must own a contiguous buffer starting at offset 0.
pub fn cached_cpu_storage(cached: &Tensor) -> Result<(CpuStorage, Shape)> {
    let (storage, layout) = cached.storage_and_layout();
    check_owned_layout(layout)?;
    match &*storage {
        Storage::Cpu(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
        _ => candle_core::bail!("cached forward value is not on the cpu"),
    }
}

pub fn cached_cuda_storage(cached: &Tensor) -> Result<(CudaStorage, Shape)> {
    let (storage, layout) = cached.storage_and_layout();
    check_owned_layout(layout)?;
    match &*storage {
        Storage::Cuda(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
        _ => candle_core::bail!("cached forward value is not on a cuda device"),
    }
}

pub fn cached_metal_storage(cached: &Tensor) -> Result<(MetalStorage, Shape)> {
    let (storage, layout) = cached.storage_and_layout();
    check_owned_layout(layout)?;
    match &*storage {
        Storage::Metal(s) => Ok((s.try_clone(layout)?, layout.shape().clone())),
        _ => candle_core::bail!("cached forward value is not on a metal device"),
    }
}

fn check_owned_layout(layout: &candle_core::Layout) -> Result<()> {
    if !layout.is_contiguous() || layout.start_offset() != 0 {
        candle_core::bail!("cached forward value must be contiguous from offset 0");
    }
    Ok(())
}

/// Freshly allocated, detached copy suitable for `cached_*_storage`
pub fn owned_detached(x: &Tensor) -> Result<Tensor> {
    if x.is_contiguous() && x.layout().start_offset() == 0 {
        Ok(x.detach())
    } else {
        // unary maps always write a fresh contiguous buffer
        x.detach().affine(1.0, 0.0)
    }
}

/// `index_{...,1}` (u32) -> one-hot `{..., n}`
pub fn one_hot_last_dim(index: &Tensor, n: usize, dtype: DType) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, n as u32, index.device())?;
    index.broadcast_eq(&classes)?.to_dtype(dtype)
}

/// reverse the order of entries along `dim`
pub fn reverse_dim(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let rev = (0..n as u32).rev().collect::<Vec<_>>();
    let rev = Tensor::from_vec(rev, n, x.device())?;
    x.index_select(&rev, dim)
}

/// Standard normal draws from `rng`, materialized on `device`
pub fn randn_from<R, S>(rng: &mut R, shape: S, dtype: DType, device: &Device) -> Result<Tensor>
where
    R: Rng + ?Sized,
    S: Into<Shape>,
{
    let shape: Shape = shape.into();
    let values = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect::<Vec<f64>>();
    Tensor::from_vec(values, shape, device)?.to_dtype(dtype)
}
