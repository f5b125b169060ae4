use crate::candle_aux_ops::one_hot_last_dim;
use crate::relax_error::{check_temperature, RelaxError};

use candle_core::{DType, Device, Result, Shape, Tensor, D};
use candle_nn::ops;
use rand::Rng;

const GUMBEL_EPS: f64 = 1e-20;

/// Standard Gumbel noise `-ln(-ln(U + eps) + eps)` with `U ~ Unif[0, 1)`
/// drawn from `rng` and placed on `device`.
pub fn sample_gumbel<R, S>(shape: S, dtype: DType, device: &Device, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
    S: Into<Shape>,
{
    let shape: Shape = shape.into();
    let noise = (0..shape.elem_count())
        .map(|_| {
            let u = rng.random::<f64>();
            -(-(u + GUMBEL_EPS).ln() + GUMBEL_EPS).ln()
        })
        .collect::<Vec<f64>>();
    Tensor::from_vec(noise, shape, device)?.to_dtype(dtype)
}

/// Soft relaxation over the last axis: `softmax((logits + g) / temperature)`
pub fn gumbel_softmax_sample<R>(logits: &Tensor, temperature: f64, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    check_temperature(temperature)?;
    let g = sample_gumbel(logits.shape(), logits.dtype(), logits.device(), rng)?;
    let y = ((logits + g)? / temperature)?;
    ops::softmax(&y, D::Minus1)
}

/// Straight-through Gumbel-Softmax over the last axis.
///
/// The value is the one-hot arg-max of the soft sample; the gradient is the
/// soft sample's.
pub fn gumbel_softmax<R>(logits: &Tensor, temperature: f64, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let soft = gumbel_softmax_sample(logits, temperature, rng)?;
    let n_class = soft.dim(D::Minus1)?;
    let hard = one_hot_last_dim(&soft.argmax_keepdim(D::Minus1)?, n_class, soft.dtype())?;
    (hard - &soft)?.detach() + soft
}

/// Relax `... x (z_dim * n_states)` logits state-wise.
///
/// The trailing axis is viewed as `z_dim x n_states`, each of the `z_dim`
/// groups gets its own straight-through draw over `n_states`, and the result
/// is flattened back to the input shape.
pub fn gumbel_softmax_states<R>(
    logits: &Tensor,
    z_dim: usize,
    n_states: usize,
    temperature: f64,
    rng: &mut R,
) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    check_temperature(temperature)?;

    let dims = logits.dims().to_vec();
    if dims.is_empty() || dims[dims.len() - 1] != z_dim * n_states || n_states == 0 {
        return Err(RelaxError::ShapeMismatch(format!(
            "logits {:?} should end with z_dim * n_states = {} x {}",
            dims, z_dim, n_states
        ))
        .into());
    }

    let mut grouped = dims[..dims.len() - 1].to_vec();
    grouped.extend([z_dim, n_states]);

    gumbel_softmax(&logits.reshape(grouped)?, temperature, rng)?.reshape(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Var;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gumbel_noise_is_finite() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let g = sample_gumbel((100, 7), DType::F32, &Device::Cpu, &mut rng)?;
        assert_eq!(g.dims(), &[100, 7]);
        let g = g.flatten_all()?.to_vec1::<f32>()?;
        assert!(g.iter().all(|x| x.is_finite()));

        // Gumbel mean is the Euler-Mascheroni constant
        let mean = g.iter().map(|&x| x as f64).sum::<f64>() / g.len() as f64;
        assert_abs_diff_eq!(mean, 0.5772, epsilon = 0.1);
        Ok(())
    }

    #[test]
    fn straight_through_is_one_hot() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let logits = Tensor::new(&[[0.1f32, 2.0, -1.0, 0.3], [1.0, 1.0, 1.0, 1.0]], &Device::Cpu)?;
        let y = gumbel_softmax(&logits, 0.5, &mut rng)?.to_vec2::<f32>()?;
        for row in y {
            let ones = row.iter().filter(|&&v| (v - 1.0).abs() < 1e-6).count();
            let zeros = row.iter().filter(|&&v| v == 0.0).count();
            assert_eq!((ones, zeros), (1, 3), "{:?}", row);
        }
        Ok(())
    }

    #[test]
    fn straight_through_gradient_is_the_soft_gradient() -> Result<()> {
        let logits = Var::from_tensor(&Tensor::new(&[[0.5f64, -0.2, 0.1]], &Device::Cpu)?)?;
        let w = Tensor::new(&[[1f64, 2., 3.]], &Device::Cpu)?;

        let hard = gumbel_softmax(logits.as_tensor(), 0.7, &mut StdRng::seed_from_u64(9))?;
        let g_hard = (hard * &w)?.sum_all()?.backward()?;

        let soft = gumbel_softmax_sample(logits.as_tensor(), 0.7, &mut StdRng::seed_from_u64(9))?;
        let g_soft = (soft * &w)?.sum_all()?.backward()?;

        let a = g_hard.get(&logits).expect("grad").to_vec2::<f64>()?;
        let b = g_soft.get(&logits).expect("grad").to_vec2::<f64>()?;
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn states_keep_the_flat_layout() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let logits = Tensor::randn(0f32, 1f32, (5, 3 * 4), &Device::Cpu)?;
        let z = gumbel_softmax_states(&logits, 3, 4, 1.0, &mut rng)?;
        assert_eq!(z.dims(), &[5, 12]);

        // one active state per latent coordinate
        let per_group = z.reshape((5, 3, 4))?.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
        for s in per_group {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }

        assert!(gumbel_softmax_states(&logits, 4, 4, 1.0, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn temperature_must_be_positive() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let err = gumbel_softmax(&logits, 0.0, &mut rng).err().expect("zero temperature");
        assert!(err.to_string().contains("invalid parameter"));
        assert!(gumbel_softmax_sample(&logits, -1.0, &mut rng).is_err());
        Ok(())
    }
}
