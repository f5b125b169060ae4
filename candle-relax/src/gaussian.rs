use crate::candle_aux_ops::randn_from;

use candle_core::{Result, Tensor};
use rand::Rng;
use std::f64::consts::PI;

/// Element-wise Gaussian log-density
///
/// -0.5 * (log(2 pi) + logvar + (x - mean)^2 / exp(logvar))
///
/// * `x` - observed values
/// * `mean` - mean (broadcast against `x`)
/// * `logvar` - log variance (broadcast against `x`)
///
pub fn log_normal_pdf(x: &Tensor, mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let resid_sq = x.broadcast_sub(mean)?.sqr()?;
    let scaled = resid_sq.broadcast_div(&logvar.exp()?)?;
    (scaled.broadcast_add(logvar)? + (2.0 * PI).ln())? * (-0.5)
}

/// Element-wise KL divergence between two diagonal Gaussians
///
/// KL(N1 || N2) = log(sd2) - log(sd1) + (v1 + (mu1 - mu2)^2) / (2 v2) - 0.5
///
pub fn normal_kl(mu1: &Tensor, lv1: &Tensor, mu2: &Tensor, lv2: &Tensor) -> Result<Tensor> {
    let v1 = lv1.exp()?;
    let v2 = lv2.exp()?;
    let log_sd_diff = ((lv2 - lv1)? * 0.5)?;
    let spread = (v1 + mu1.sub(mu2)?.sqr()?)?.div(&(v2 * 2.0)?)?;
    (log_sd_diff + spread)? - 0.5
}

/// KL divergence to the standard normal prior, summed over the last axis
///
/// 0.5 * sum (exp(lnvar) - 1 + mu^2 - lnvar)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.sqr()? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// log mean_i exp(x_i) along `dim`, shifted by the max
pub fn log_mean_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)? as f64;
    let x_max = x.max_keepdim(dim)?.detach();
    let lse = x.broadcast_sub(&x_max)?.exp()?.sum_keepdim(dim)?.log()?;
    ((lse + x_max)? - n.ln())?.squeeze(dim)
}

/// z = mu + exp(0.5 * logvar) * eps, eps ~ N(0, I) drawn from `rng`
pub fn gaussian_reparameterize<R>(mu: &Tensor, logvar: &Tensor, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let eps = randn_from(rng, mu.shape(), mu.dtype(), mu.device())?;
    let sd = (logvar * 0.5)?.exp()?;
    mu + sd.mul(&eps)?
}

/// Squared error averaged over all non-batch entries, then over the batch
pub fn mean_squared_error(pred: &Tensor, truth: &Tensor) -> Result<Tensor> {
    let nn = pred.dim(0)?;
    let diff = pred.sub(truth)?.reshape((nn, ()))?;
    diff.sqr()?.mean(1)?.mean(0)
}
