use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_relax::{gumbel_softmax, gumbel_softmax_sample, sparsemax, TemperatureSchedule};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn cold_straight_through_draws_follow_softmax() -> Result<()> {
    let dev = Device::Cpu;
    let probs = [0.2f64, 0.3, 0.5];
    let logits = Tensor::new(&probs, &dev)?
        .log()?
        .unsqueeze(0)?
        .repeat((20_000, 1))?;

    let mut rng = StdRng::seed_from_u64(31);
    let y = gumbel_softmax(&logits, 1e-3, &mut rng)?;

    let freq = y.mean(0)?.to_vec1::<f64>()?;
    for (f, p) in freq.iter().zip(probs.iter()) {
        assert_abs_diff_eq!(*f, *p, epsilon = 0.015);
    }

    // every row is one-hot
    let row_max = y.max(D::Minus1)?.min(0)?.to_scalar::<f64>()?;
    let row_sum = y.sum(D::Minus1)?;
    assert_abs_diff_eq!(row_max, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(row_sum.min(0)?.to_scalar::<f64>()?, 1.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn hot_soft_samples_are_nearly_uniform() -> Result<()> {
    let dev = Device::Cpu;
    let logits = Tensor::new(&[[2f32, -1.0, 0.5, 0.0]], &dev)?.repeat((100, 1))?;
    let mut rng = StdRng::seed_from_u64(8);
    let y = gumbel_softmax_sample(&logits, 1e4, &mut rng)?;
    let dev_from_uniform = (y - 0.25)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(dev_from_uniform < 1e-2, "{}", dev_from_uniform);
    Ok(())
}

#[test]
fn annealed_temperature_sharpens_soft_samples() -> Result<()> {
    let dev = Device::Cpu;
    let sched = TemperatureSchedule::new(5.0, 0.05, 0.05);
    let logits = Tensor::new(&[[1f64, 0.0, -1.0]], &dev)?.repeat((2000, 1))?;

    let mut rng = StdRng::seed_from_u64(12);
    let mut last_peak = 0.0;
    for step in [0usize, 50, 200] {
        let y = gumbel_softmax_sample(&logits, sched.at_step(step), &mut rng)?;
        let peak = y.max(D::Minus1)?.mean_all()?.to_scalar::<f64>()?;
        assert!(peak > last_peak, "step {}: {} <= {}", step, peak, last_peak);
        last_peak = peak;
    }
    assert!(last_peak > 0.9);
    Ok(())
}

#[test]
fn sparsemax_projects_random_rows_onto_the_simplex() -> Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::randn(0f64, 3.0, (64, 9), &dev)?;
    let y = sparsemax(&x, 1)?;

    let sums = y.sum(1)?.to_vec1::<f64>()?;
    for s in sums {
        assert_abs_diff_eq!(s, 1.0, epsilon = 1e-10);
    }

    // zeros exactly where the input falls below the threshold
    let xs = x.to_vec2::<f64>()?;
    let ys = y.to_vec2::<f64>()?;
    for (xr, yr) in xs.iter().zip(ys.iter()) {
        assert!(yr.iter().all(|&v| v >= 0.0));
        let support = yr.iter().filter(|&&v| v > 0.0).count();
        assert!(support >= 1);

        // recover tau from any supported entry: y = x - tau
        let (j, _) = yr
            .iter()
            .enumerate()
            .find(|(_, &v)| v > 0.0)
            .expect("non-empty support");
        let tau = xr[j] - yr[j];
        for (&xv, &yv) in xr.iter().zip(yr.iter()) {
            if xv <= tau {
                assert_eq!(yv, 0.0);
            } else {
                assert_abs_diff_eq!(yv, xv - tau, epsilon = 1e-10);
            }
        }
    }
    Ok(())
}

#[test]
fn sparsemax_backward_masks_unsupported_entries() -> Result<()> {
    let dev = Device::Cpu;
    let x = Var::from_tensor(&Tensor::randn(0f64, 2.0, (16, 6), &dev)?)?;
    let w = Tensor::randn(0f64, 1.0, (16, 6), &dev)?;
    let y = sparsemax(x.as_tensor(), 1)?;
    let grads = (y.clone() * &w)?.sum_all()?.backward()?;
    let g = grads.get(&x).expect("grad");

    let off_support = y.eq(0.0)?.to_dtype(DType::F64)?;
    let leaked = (g * &off_support)?.abs()?.sum_all()?.to_scalar::<f64>()?;
    assert_eq!(leaked, 0.0);
    Ok(())
}
