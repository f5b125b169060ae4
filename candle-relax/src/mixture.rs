//! Mixture of diagonal Normal distributions with pathwise derivatives.
//!
//! A `K`-component mixture over `R^D`. Component means are gathered into
//! `locs` (`K x D`, or `B... x K x D` when batched), per-coordinate standard
//! deviations into `coord_scale` (same shape) and the mixture weights are the
//! softmax of `component_logits` (`K`, or `B... x K`).
//!
//! `rsample` draws a component per sample, which is not differentiable, and
//! then registers a custom backward that evaluates the closed-form pathwise
//! gradient of Jankowiak & Karaletsos, "Pathwise Derivatives for Multivariate
//! Distributions" (arXiv:1806.01856) with respect to all three parameters.
//! `D = 1` is not supported.

use crate::candle_aux_ops::*;
use crate::relax_error::RelaxError;

use candle_core::{
    CpuStorage, CudaStorage, CustomOp3, DType, Layout, MetalStorage, Result, Shape, Tensor, D,
};
use candle_nn::ops;
use log::debug;
use rand::distr::weighted::WeightedIndex;
use rand::Rng;
use rand_distr::Distribution;
use std::f64::consts::{PI, SQRT_2};

#[derive(Clone, Debug)]
pub struct MixtureOfDiagNormals {
    locs: Tensor,             // B... x K x D
    coord_scale: Tensor,      // B... x K x D
    component_logits: Tensor, // B... x K
    probs: Tensor,            // B... x K
    batch_shape: Vec<usize>,
    dim: usize,
}

impl MixtureOfDiagNormals {
    /// Validate and build a mixture.
    ///
    /// # Arguments
    /// * `locs` - component means, `K x D` or `B... x K x D`
    /// * `coord_scale` - component standard deviations, same shape as `locs`
    /// * `component_logits` - unnormalized log weights, `K` or `B... x K`
    ///   (batch axes may broadcast against those of `locs`)
    pub fn new(locs: Tensor, coord_scale: Tensor, component_logits: Tensor) -> Result<Self> {
        let rank = locs.rank();
        if rank < 2 {
            return Err(RelaxError::ShapeMismatch(format!(
                "locs should be K x D (or B x K x D), got {:?}",
                locs.dims()
            ))
            .into());
        }

        if coord_scale.dims() != locs.dims() {
            return Err(RelaxError::ShapeMismatch(format!(
                "coord_scale {:?} should match locs {:?}",
                coord_scale.dims(),
                locs.dims()
            ))
            .into());
        }

        let dims = locs.dims().to_vec();
        let (k, dim) = (dims[rank - 2], dims[rank - 1]);

        if dim == 1 {
            return Err(RelaxError::ShapeMismatch(
                "D = 1 is not supported by the pathwise gradient".into(),
            )
            .into());
        }

        if k == 0 || dim == 0 {
            return Err(RelaxError::ShapeMismatch(format!(
                "empty mixture: {} components of dimension {}",
                k, dim
            ))
            .into());
        }

        if dims[..rank - 2].contains(&0) {
            return Err(RelaxError::ShapeMismatch(format!(
                "empty batch axis in locs {:?}",
                dims
            ))
            .into());
        }

        if component_logits.rank() == 0 || component_logits.dims()[component_logits.rank() - 1] != k
        {
            return Err(RelaxError::ShapeMismatch(format!(
                "component_logits {:?} should end with the {} components of locs",
                component_logits.dims(),
                k
            ))
            .into());
        }

        if component_logits.rank() > rank - 1 {
            return Err(RelaxError::ShapeMismatch(format!(
                "component_logits {:?} has more batch axes than locs {:?}",
                component_logits.dims(),
                dims
            ))
            .into());
        }

        let component_logits = component_logits
            .broadcast_as(&dims[..rank - 1])
            .map_err(|_| {
                RelaxError::ShapeMismatch(format!(
                    "component_logits {:?} does not broadcast to batch shape {:?}",
                    component_logits.dims(),
                    &dims[..rank - 2]
                ))
            })?;

        let dtype = locs.dtype();
        if !matches!(dtype, DType::F32 | DType::F64 | DType::F16 | DType::BF16) {
            return Err(
                RelaxError::InvalidParameter(format!("float dtype required, got {:?}", dtype))
                    .into(),
            );
        }

        if coord_scale.dtype() != dtype || component_logits.dtype() != dtype {
            return Err(RelaxError::InvalidParameter(format!(
                "dtype mismatch: locs {:?}, coord_scale {:?}, component_logits {:?}",
                dtype,
                coord_scale.dtype(),
                component_logits.dtype()
            ))
            .into());
        }

        let min_scale = coord_scale
            .detach()
            .to_dtype(DType::F64)?
            .flatten_all()?
            .min(0)?
            .to_scalar::<f64>()?;

        // also rejects NaN
        if !(min_scale > 0.0) {
            return Err(RelaxError::InvalidParameter(format!(
                "coord_scale must be strictly positive, found {}",
                min_scale
            ))
            .into());
        }

        let probs = ops::softmax(&component_logits, D::Minus1)?;

        Ok(Self {
            locs,
            coord_scale,
            component_logits,
            probs,
            batch_shape: dims[..rank - 2].to_vec(),
            dim,
        })
    }

    /// Broadcast the parameters to a larger batch shape
    pub fn expand(&self, batch_shape: &[usize]) -> Result<Self> {
        let k = self.num_components();
        let mut param_shape = batch_shape.to_vec();
        param_shape.extend([k, self.dim]);
        let mut logit_shape = batch_shape.to_vec();
        logit_shape.push(k);

        let locs = self.locs.broadcast_as(param_shape.as_slice())?;
        let coord_scale = self.coord_scale.broadcast_as(param_shape.as_slice())?;
        let component_logits = self.component_logits.broadcast_as(logit_shape.as_slice())?;

        Ok(Self {
            locs,
            coord_scale,
            probs: ops::softmax(&component_logits, D::Minus1)?,
            component_logits,
            batch_shape: batch_shape.to_vec(),
            dim: self.dim,
        })
    }

    pub fn locs(&self) -> &Tensor {
        &self.locs
    }

    pub fn coord_scale(&self) -> &Tensor {
        &self.coord_scale
    }

    pub fn component_logits(&self) -> &Tensor {
        &self.component_logits
    }

    /// mixture weights, softmax of the logits
    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    pub fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }

    pub fn event_dim(&self) -> usize {
        self.dim
    }

    pub fn num_components(&self) -> usize {
        self.locs.dims()[self.locs.rank() - 2]
    }

    fn num_batch(&self) -> usize {
        self.batch_shape.iter().product()
    }

    /// Mixture mean, `B... x D`
    pub fn mean(&self) -> Result<Tensor> {
        let rank = self.locs.rank();
        self.probs
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&self.locs)?
            .sum(rank - 2)
    }

    /// Per-coordinate mixture variance, `B... x D`
    pub fn variance(&self) -> Result<Tensor> {
        let rank = self.locs.rank();
        let second = (self.coord_scale.sqr()? + self.locs.sqr()?)?;
        let second = self
            .probs
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&second)?
            .sum(rank - 2)?;
        second - self.mean()?.sqr()?
    }

    /// Log density of `value` (`... x D`, broadcastable against the batch
    /// shape); one value per batch element.
    ///
    /// log p(x) = log sum_k pi_k N(x | mu_k, diag(sigma_k^2))
    ///
    /// Each component's exponent `a_k = 0.5 |(x - mu_k)/sigma_k|^2 + sum log sigma_k`
    /// is shifted by the per-point minimum before exponentiating.
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let d = self.dim;
        if value.rank() == 0 || value.dims()[value.rank() - 1] != d {
            return Err(RelaxError::ShapeMismatch(format!(
                "value {:?} should end with the event dimension {}",
                value.dims(),
                d
            ))
            .into());
        }

        let x = value.unsqueeze(value.rank() - 1)?; // ... x 1 x D
        let eps = x
            .broadcast_sub(&self.locs)?
            .broadcast_div(&self.coord_scale)?; // ... x K x D
        let eps_sqr = (eps.sqr()?.sum(D::Minus1)? * 0.5)?; // ... x K
        let log_scale_sum = self.coord_scale.log()?.sum(D::Minus1)?; // B x K

        let a = eps_sqr.broadcast_add(&log_scale_sum)?;
        let a_min = a.min_keepdim(D::Minus1)?.detach();

        let log_mix = a
            .broadcast_sub(&a_min)?
            .neg()?
            .exp()?
            .broadcast_mul(&self.probs)?
            .sum_keepdim(D::Minus1)?
            .log()?;

        let log_norm = 0.5 * (2.0 * PI).ln() * d as f64;
        (log_mix.broadcast_sub(&a_min)? - log_norm)?.squeeze(D::Minus1)
    }

    /// Reparameterized sample, `sample_shape + batch_shape + (D)`.
    ///
    /// Gradients reach `locs`, `coord_scale` and `component_logits`
    /// through the closed-form backward; the component choice and the
    /// noise receive none.
    pub fn rsample<R>(&self, sample_shape: &[usize], rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let z = self.sample(sample_shape, rng)?;
        let op = MixDiagNormalSample {
            sample: owned_detached(&z)?,
        };
        self.locs
            .apply_op3(&self.coord_scale, &self.component_logits, op)
    }

    /// Sample without a gradient node
    ///
    /// 1. component `j ~ Categorical(probs)` per sample and batch element
    /// 2. `eps ~ N(0, I)`
    /// 3. `z = locs[j] + coord_scale[j] * eps`
    pub fn sample<R>(&self, sample_shape: &[usize], rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (nb, k, d) = (self.num_batch(), self.num_components(), self.dim);
        let nl: usize = sample_shape.iter().product();
        let device = self.locs.device();
        let dtype = self.locs.dtype();

        let probs_bk = self
            .probs
            .detach()
            .to_dtype(DType::F64)?
            .reshape((nb, k))?
            .to_vec2::<f64>()?;

        let components = probs_bk
            .iter()
            .map(|p| {
                WeightedIndex::new(p).map_err(|e| {
                    candle_core::Error::Msg(format!("invalid mixture weights {:?}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut which = Vec::with_capacity(nl * nb);
        for _ in 0..nl {
            for comp in components.iter() {
                which.push(comp.sample(rng) as u32);
            }
        }

        debug!("drawing {} x {} samples from {} components", nl, nb, k);

        let which_lb1 = Tensor::from_vec(which, (nl, nb, 1), device)?;
        let onehot_lbk1 = one_hot_last_dim(&which_lb1, k, dtype)?.unsqueeze(3)?;
        let white_lbd = randn_from(rng, (nl, nb, d), dtype, device)?;

        let locs_1bkd = self.locs.detach().reshape((1, nb, k, d))?;
        let scales_1bkd = self.coord_scale.detach().reshape((1, nb, k, d))?;

        let loc_lbd = onehot_lbk1.broadcast_mul(&locs_1bkd)?.sum(2)?;
        let sigma_lbd = onehot_lbk1.broadcast_mul(&scales_1bkd)?.sum(2)?;
        let z_lbd = (loc_lbd + sigma_lbd.mul(&white_lbd)?)?;

        let mut out_shape = sample_shape.to_vec();
        out_shape.extend(self.batch_shape.iter().copied());
        out_shape.push(d);
        z_lbd.reshape(out_shape)
    }
}

/// Gradient node of `rsample`. The forward value is drawn before the node
/// is created; `bwd` only needs the parameters and the sample.
struct MixDiagNormalSample {
    sample: Tensor,
}

impl CustomOp3 for MixDiagNormalSample {
    fn name(&self) -> &'static str {
        "mix-diag-normal-sample"
    }

    fn cpu_fwd(
        &self,
        _: &CpuStorage,
        _: &Layout,
        _: &CpuStorage,
        _: &Layout,
        _: &CpuStorage,
        _: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        cached_cpu_storage(&self.sample)
    }

    fn cuda_fwd(
        &self,
        _: &CudaStorage,
        _: &Layout,
        _: &CudaStorage,
        _: &Layout,
        _: &CudaStorage,
        _: &Layout,
    ) -> Result<(CudaStorage, Shape)> {
        cached_cuda_storage(&self.sample)
    }

    fn metal_fwd(
        &self,
        _: &MetalStorage,
        _: &Layout,
        _: &MetalStorage,
        _: &Layout,
        _: &MetalStorage,
        _: &Layout,
    ) -> Result<(MetalStorage, Shape)> {
        cached_metal_storage(&self.sample)
    }

    fn bwd(
        &self,
        locs: &Tensor,
        scales: &Tensor,
        logits: &Tensor,
        z: &Tensor,
        grad_z: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let rank = locs.rank();
        let (k, d) = (locs.dims()[rank - 2], locs.dims()[rank - 1]);
        let nb = locs.elem_count() / (k * d);
        let nl = z.elem_count() / (nb * d);

        // sample axes -> one leading axis, batch axes -> one batch axis
        let (locs_grad, scales_grad, logits_grad) = pathwise_gradients(
            &z.detach().reshape((nl, nb, d))?,
            &grad_z.detach().reshape((nl, nb, d))?,
            &locs.detach().reshape((nb, k, d))?,
            &scales.detach().reshape((nb, k, d))?,
            &logits.detach().reshape((nb, k))?,
        )?;

        Ok((
            Some(locs_grad.reshape(locs.shape())?),
            Some(scales_grad.reshape(scales.shape())?),
            Some(logits_grad.reshape(logits.shape())?),
        ))
    }
}

/// Closed-form pathwise gradients of a diagonal-Normal mixture sample.
///
/// Index convention: `l` samples, `b` batch, `j`/`c`/`d` components,
/// `i` coordinates. Every sum over samples reduces axis 0 only.
///
/// # Arguments
/// * `z_lbi` - samples
/// * `g_lbi` - upstream gradient w.r.t. the samples
/// * `locs_bji`, `scales_bji` - component parameters
/// * `logits_bj` - mixture logits
///
/// # Returns `(locs_grad_bji, scales_grad_bji, logits_grad_bj)`
fn pathwise_gradients(
    z_lbi: &Tensor,
    g_lbi: &Tensor,
    locs_bji: &Tensor,
    scales_bji: &Tensor,
    logits_bj: &Tensor,
) -> Result<(Tensor, Tensor, Tensor)> {
    let (_, _, dim) = locs_bji.dims3()?;
    let dtype = z_lbi.dtype();

    let half_ln_2pi = 0.5 * (2.0 * PI).ln();
    let norm_const = 0.5 * (2.0 * PI).powf(-0.5 * (dim as f64 - 1.0));

    let pis_bj = ops::softmax(logits_bj, D::Minus1)?;
    let g_lb1i = g_lbi.unsqueeze(2)?;
    let z_lb1i = z_lbi.unsqueeze(2)?;

    // residuals whitened by each component and by the smallest scale
    let sigma_0_b1i = scales_bji.min_keepdim(1)?;
    let resid_lbji = z_lb1i.broadcast_sub(locs_bji)?;
    let z_shift_lbji = resid_lbji.broadcast_div(&sigma_0_b1i)?;
    let z_tilde_lbji = resid_lbji.broadcast_div(scales_bji)?;

    // unit directions between component means; coincident means (and the
    // diagonal) keep a zero direction, where the overlap term vanishes
    let mu_bcdi = locs_bji
        .unsqueeze(2)?
        .broadcast_sub(&locs_bji.unsqueeze(1)?)?;
    let mu_norm_bcd = mu_bcdi.sqr()?.sum(3)?.sqrt()?;
    let mu_norm_bcd = (&mu_norm_bcd + mu_norm_bcd.eq(0.0)?.to_dtype(dtype)?)?;
    let mu_bcdi = mu_bcdi.broadcast_div(&mu_norm_bcd.unsqueeze(3)?)?;

    let mu_ll_bcd = locs_bji.unsqueeze(2)?.broadcast_mul(&mu_bcdi)?.sum(3)?;
    let z_lb11i = z_lb1i.unsqueeze(2)?;
    let z_ll_lbcd = z_lb11i.broadcast_mul(&mu_bcdi)?.sum(4)?;
    let z_perp_lbcdi = z_lb11i.broadcast_sub(&z_ll_lbcd.unsqueeze(4)?.broadcast_mul(&mu_bcdi)?)?;
    let z_perp_sqr_lbcd = z_perp_lbcdi.sqr()?.sum(4)?;

    // r^2_ji: tail (i' > i) of the sigma_0-whitened squares
    //       + head (i' < i) of the self-whitened squares
    let z_shift_sqr = z_shift_lbji.sqr()?;
    let z_shift_tail = z_shift_sqr
        .sum_keepdim(3)?
        .broadcast_sub(&z_shift_sqr.cumsum(3)?)?;
    let z_tilde_sqr = z_tilde_lbji.sqr()?;
    let z_tilde_head = (z_tilde_sqr.cumsum(3)? - &z_tilde_sqr)?;
    let r_sqr_lbji = (z_shift_tail + z_tilde_head)?;

    // component densities at each sample, shifted by the per-sample max;
    // the same shift multiplies every exp(.) divided by q_tot below
    let log_scales_bji = scales_bji.log()?;
    let log_q_lbj = ((&z_tilde_sqr * -0.5)? - half_ln_2pi)?
        .broadcast_sub(&log_scales_bji)?
        .sum(3)?;
    let shift_lb1 = log_q_lbj.max_keepdim(2)?;
    let shift_lb11 = shift_lb1.unsqueeze(3)?;
    let q_lbj = log_q_lbj.broadcast_sub(&shift_lb1)?.exp()?;
    let q_tot_lb1 = q_lbj.broadcast_mul(&pis_bj)?.sum_keepdim(2)?;

    // prod_{i' < i} sigma_j[i'] * prod_{i' > i} sigma_0[i']
    let log_sigma_0_b1i = sigma_0_b1i.log()?;
    let head_log_sigma = (log_scales_bji.cumsum(2)? - &log_scales_bji)?;
    let tail_log_sigma_0 = log_sigma_0_b1i
        .sum_keepdim(2)?
        .broadcast_sub(&log_sigma_0_b1i.cumsum(2)?)?;
    let sigma_products_bji = head_log_sigma.broadcast_add(&tail_log_sigma_0)?.exp()?;

    // (1) logits: erf differences along the coordinate ordering
    let erf_diff_lbji = ((&z_tilde_lbji / SQRT_2)?.erf()? - (&z_shift_lbji / SQRT_2)?.erf()?)?;
    let decay_lbji = (&r_sqr_lbji * -0.5)?.broadcast_sub(&shift_lb11)?.exp()?;
    let logits_grad_lbj = (erf_diff_lbji * decay_lbji)?
        .broadcast_mul(&g_lb1i)?
        .broadcast_div(&sigma_products_bji)?
        .sum(3)?;
    let logits_grad_bj = (logits_grad_lbj.broadcast_div(&q_tot_lb1)?.sum(0)? * norm_const)?;
    let logits_grad_bj = (pis_bj.neg()? * logits_grad_bj)?;
    let logits_grad_bj =
        (&logits_grad_bj - logits_grad_bj.sum_keepdim(1)?.broadcast_mul(&pis_bj)?)?;

    // (2) logits: pairwise overlap along each connecting direction
    let mu_ll_bdc = mu_ll_bcd.transpose(1, 2)?;
    let v_lbcd = ((z_ll_lbcd.broadcast_sub(&mu_ll_bcd)? / SQRT_2)?.erf()?
        - (z_ll_lbcd.broadcast_add(&mu_ll_bdc)? / SQRT_2)?.erf()?)?;
    let v_lbcd = (v_lbcd
        * (&z_perp_sqr_lbcd * -0.5)?
            .broadcast_sub(&shift_lb11)?
            .exp()?)?;
    let mu_cd_g_lbcd = g_lb1i.unsqueeze(2)?.broadcast_mul(&mu_bcdi)?.sum(4)?;
    let v_lbcd = (v_lbcd * mu_cd_g_lbcd.neg()?)?.broadcast_mul(&pis_bj.unsqueeze(1)?)?;
    let v_bc = ((v_lbcd.sum(3)?.broadcast_div(&q_tot_lb1)?.sum(0)? * norm_const)? * &pis_bj)?;
    let logits_grad_bj = (logits_grad_bj + v_bc)?;

    // (3) locs and scales: posterior responsibilities
    let resp_lbj1 = q_lbj
        .broadcast_mul(&pis_bj)?
        .broadcast_div(&q_tot_lb1)?
        .unsqueeze(3)?;
    let prefactor_lbji = resp_lbj1.broadcast_mul(&g_lb1i)?;
    let locs_grad_bji = prefactor_lbji.sum(0)?;
    let scales_grad_bji = prefactor_lbji.mul(&z_tilde_lbji)?.sum(0)?;

    Ok((locs_grad_bji, scales_grad_bji, logits_grad_bj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Var};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_modes(device: &Device) -> Result<MixtureOfDiagNormals> {
        MixtureOfDiagNormals::new(
            Tensor::new(&[[-5f64, 0.], [5., 0.]], device)?,
            Tensor::ones((2, 2), DType::F64, device)?,
            Tensor::zeros(2, DType::F64, device)?,
        )
    }

    fn expect_shape_mismatch(res: Result<MixtureOfDiagNormals>) {
        match res {
            Err(e) => assert!(e.to_string().contains("shape mismatch"), "{}", e),
            Ok(_) => panic!("expected a shape mismatch"),
        }
    }

    #[test]
    fn rejects_inconsistent_shapes() -> Result<()> {
        let device = Device::Cpu;
        let locs = Tensor::zeros((3, 2), DType::F32, &device)?;

        expect_shape_mismatch(MixtureOfDiagNormals::new(
            locs.clone(),
            Tensor::ones((3, 3), DType::F32, &device)?,
            Tensor::zeros(3, DType::F32, &device)?,
        ));

        expect_shape_mismatch(MixtureOfDiagNormals::new(
            locs.clone(),
            Tensor::ones((3, 2), DType::F32, &device)?,
            Tensor::zeros(4, DType::F32, &device)?,
        ));

        expect_shape_mismatch(MixtureOfDiagNormals::new(
            Tensor::zeros((3, 1), DType::F32, &device)?,
            Tensor::ones((3, 1), DType::F32, &device)?,
            Tensor::zeros(3, DType::F32, &device)?,
        ));

        expect_shape_mismatch(MixtureOfDiagNormals::new(
            Tensor::zeros((0, 3, 2), DType::F32, &device)?,
            Tensor::ones((0, 3, 2), DType::F32, &device)?,
            Tensor::zeros(3, DType::F32, &device)?,
        ));

        Ok(())
    }

    #[test]
    fn rejects_non_positive_scale() -> Result<()> {
        let device = Device::Cpu;
        let res = MixtureOfDiagNormals::new(
            Tensor::zeros((2, 2), DType::F32, &device)?,
            Tensor::new(&[[1f32, 1.], [0., 1.]], &device)?,
            Tensor::zeros(2, DType::F32, &device)?,
        );
        match res {
            Err(e) => assert!(e.to_string().contains("invalid parameter")),
            Ok(_) => panic!("zero scale accepted"),
        }
        Ok(())
    }

    #[test]
    fn log_prob_matches_direct_sum() -> Result<()> {
        let device = Device::Cpu;
        let mix = two_modes(&device)?;
        let x = Tensor::new(&[0f64, 0.], &device)?;
        let lp = mix.log_prob(&x)?.to_scalar::<f64>()?;

        // N([0,0] | [+-5,0], I) = exp(-12.5) / (2 pi)
        let direct = (0.5 * (-12.5f64).exp() / (2. * PI) * 2.0).ln();
        assert_abs_diff_eq!(lp, direct, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn far_away_points_stay_finite() -> Result<()> {
        let device = Device::Cpu;
        let mix = MixtureOfDiagNormals::new(
            Tensor::new(&[[-500f32, 0.], [500., 0.]], &device)?,
            Tensor::new(&[[0.1f32, 0.1], [0.1, 0.1]], &device)?,
            Tensor::new(&[0f32, 1.], &device)?,
        )?;
        let x = Tensor::new(&[[0f32, 0.], [501., 3.]], &device)?;
        let lp = mix.log_prob(&x)?.to_vec1::<f32>()?;
        assert!(lp.iter().all(|v| v.is_finite()), "{:?}", lp);
        Ok(())
    }

    #[test]
    fn single_component_is_a_diagonal_gaussian() -> Result<()> {
        let device = Device::Cpu;
        let mix = MixtureOfDiagNormals::new(
            Tensor::new(&[[1f64, -2., 0.5]], &device)?,
            Tensor::new(&[[0.5f64, 2., 1.]], &device)?,
            Tensor::new(&[3f64], &device)?,
        )?;
        let x = [0.3f64, -1.0, 2.0];
        let lp = mix.log_prob(&Tensor::new(&x, &device)?)?.to_scalar::<f64>()?;

        let (mu, sd) = ([1f64, -2., 0.5], [0.5f64, 2., 1.]);
        let direct: f64 = (0..3)
            .map(|i| {
                let e = (x[i] - mu[i]) / sd[i];
                -0.5 * e * e - sd[i].ln() - 0.5 * (2. * PI).ln()
            })
            .sum();
        assert_abs_diff_eq!(lp, direct, epsilon = 1e-10);

        // with one component every draw is mu + sd * eps
        let mut rng = StdRng::seed_from_u64(11);
        let z = mix.rsample(&[5000], &mut rng)?;
        let m = z.mean(0)?.to_vec1::<f64>()?;
        for i in 0..3 {
            assert_abs_diff_eq!(m[i], mu[i], epsilon = 0.1);
        }
        Ok(())
    }

    #[test]
    fn samples_split_between_modes() -> Result<()> {
        let device = Device::Cpu;
        let mix = two_modes(&device)?;
        let mut rng = StdRng::seed_from_u64(42);
        let z = mix.rsample(&[10000], &mut rng)?;
        assert_eq!(z.dims(), &[10000, 2]);

        let x0 = z.narrow(1, 0, 1)?.squeeze(1)?;
        let right = x0.gt(0.0)?.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?;
        assert!((right - 0.5).abs() < 0.03, "fraction right {}", right);
        Ok(())
    }

    #[test]
    fn batched_shapes_and_expand() -> Result<()> {
        let device = Device::Cpu;
        let mix = MixtureOfDiagNormals::new(
            Tensor::zeros((4, 3, 2), DType::F32, &device)?,
            Tensor::ones((4, 3, 2), DType::F32, &device)?,
            Tensor::zeros(3, DType::F32, &device)?,
        )?;
        assert_eq!(mix.batch_shape(), &[4]);
        assert_eq!(mix.probs().dims(), &[4, 3]);

        let mut rng = StdRng::seed_from_u64(1);
        let z = mix.rsample(&[5, 6], &mut rng)?;
        assert_eq!(z.dims(), &[5, 6, 4, 2]);
        assert_eq!(mix.log_prob(&z)?.dims(), &[5, 6, 4]);

        let wide = two_modes(&device)?.expand(&[7])?;
        assert_eq!(wide.locs().dims(), &[7, 2, 2]);
        assert_eq!(wide.rsample(&[3], &mut rng)?.dims(), &[3, 7, 2]);
        Ok(())
    }

    #[test]
    fn mean_and_variance_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let mix = two_modes(&device)?;
        let m = mix.mean()?.to_vec1::<f64>()?;
        let v = mix.variance()?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(m[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[0], 26.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn gradients_reach_all_parameters() -> Result<()> {
        let device = Device::Cpu;
        let locs = Var::from_tensor(&Tensor::new(&[[-1f64, 0.], [1., 0.5]], &device)?)?;
        let scales = Var::from_tensor(&Tensor::new(&[[1f64, 0.7], [0.8, 1.2]], &device)?)?;
        let logits = Var::from_tensor(&Tensor::new(&[0.2f64, -0.1], &device)?)?;

        let mix = MixtureOfDiagNormals::new(
            locs.as_tensor().clone(),
            scales.as_tensor().clone(),
            logits.as_tensor().clone(),
        )?;
        let mut rng = StdRng::seed_from_u64(3);
        let z = mix.rsample(&[64], &mut rng)?;
        let grads = z.sqr()?.sum_all()?.backward()?;

        let g_locs = grads.get(&locs).expect("locs grad");
        let g_scales = grads.get(&scales).expect("scales grad");
        let g_logits = grads.get(&logits).expect("logits grad");
        assert_eq!(g_locs.dims(), &[2, 2]);
        assert_eq!(g_scales.dims(), &[2, 2]);
        assert_eq!(g_logits.dims(), &[2]);

        // softmax is shift invariant
        let s = g_logits.sum_all()?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(s, 0.0, epsilon = 1e-8);
        Ok(())
    }
}
