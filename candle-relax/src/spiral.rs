//! Noisy 2-D spirals for sequence models.
//!
//! Two reference curves over `t in [start, stop]`:
//! * clockwise: `r = a + 50 b / (stop + 1 - t)`, angle `stop + 1 - t`, centred at `(-5, 0)`
//! * counter-clockwise: `r = a + b t`, angle `t`, centred at `(5, 0)`
//!
//! Each spiral picks one curve at random and observes `nsample` consecutive
//! points from a random start index with Gaussian noise.

use crate::relax_error::RelaxError;

use candle_core::{Device, Result, Tensor};
use log::info;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

#[derive(Clone, Debug)]
pub struct SpiralConfig {
    pub nspiral: usize,
    pub ntotal: usize,
    pub nsample: usize,
    pub start: f64,
    pub stop: f64,
    pub noise_std: f64,
    pub a: f64,
    pub b: f64,
}

impl Default for SpiralConfig {
    fn default() -> Self {
        Self {
            nspiral: 1000,
            ntotal: 500,
            nsample: 100,
            start: 0.,
            stop: 6. * PI,
            noise_std: 0.3,
            a: 0.,
            b: 0.3,
        }
    }
}

pub struct SpiralData {
    /// `nspiral x ntotal x 2` noiseless reference trajectories
    pub orig_trajs: Tensor,
    /// `nspiral x nsample x 2` noisy observed windows
    pub samp_trajs: Tensor,
    /// `ntotal`
    pub orig_ts: Tensor,
    /// `nsample`, the first `nsample` time points
    pub samp_ts: Tensor,
    pub clockwise: Vec<bool>,
    pub start_index: Vec<usize>,
}

pub fn generate_spiral2d<R>(config: &SpiralConfig, device: &Device, rng: &mut R) -> Result<SpiralData>
where
    R: Rng + ?Sized,
{
    let SpiralConfig {
        nspiral,
        ntotal,
        nsample,
        start,
        stop,
        noise_std,
        a,
        b,
    } = config.clone();

    if nsample == 0 || ntotal <= 2 * nsample {
        return Err(RelaxError::InvalidParameter(format!(
            "need ntotal > 2 * nsample > 0, got ntotal = {}, nsample = {}",
            ntotal, nsample
        ))
        .into());
    }

    let noise = Normal::new(0.0, noise_std).map_err(|e| {
        RelaxError::InvalidParameter(format!("noise_std = {}: {}", noise_std, e))
    })?;

    let step = if ntotal > 1 {
        (stop - start) / (ntotal - 1) as f64
    } else {
        0.
    };
    let orig_ts: Vec<f64> = (0..ntotal).map(|i| start + step * i as f64).collect();

    let clockwise_curve: Vec<[f64; 2]> = orig_ts
        .iter()
        .map(|&t| {
            let z = stop + 1. - t;
            let r = a + b * 50. / z;
            [r * z.cos() - 5., r * z.sin()]
        })
        .collect();

    let counter_curve: Vec<[f64; 2]> = orig_ts
        .iter()
        .map(|&t| {
            let r = a + b * t;
            [r * t.cos() + 5., r * t.sin()]
        })
        .collect();

    let mut orig = Vec::with_capacity(nspiral * ntotal * 2);
    let mut samp = Vec::with_capacity(nspiral * nsample * 2);
    let mut clockwise = Vec::with_capacity(nspiral);
    let mut start_index = Vec::with_capacity(nspiral);

    for _ in 0..nspiral {
        let t0 = rng.random_range(nsample..(ntotal - nsample));
        let cc = rng.random::<f64>() > 0.5;
        let curve = if cc { &counter_curve } else { &clockwise_curve };

        orig.extend(curve.iter().flat_map(|xy| xy.iter().copied()));
        for xy in &curve[t0..t0 + nsample] {
            samp.push(xy[0] + noise.sample(rng));
            samp.push(xy[1] + noise.sample(rng));
        }
        clockwise.push(!cc);
        start_index.push(t0);
    }

    info!(
        "generated {} spirals ({} clockwise), {} of {} time points observed",
        nspiral,
        clockwise.iter().filter(|&&c| c).count(),
        nsample,
        ntotal
    );

    let to_f32 = |v: Vec<f64>| v.into_iter().map(|x| x as f32).collect::<Vec<f32>>();

    Ok(SpiralData {
        orig_trajs: Tensor::from_vec(to_f32(orig), (nspiral, ntotal, 2), device)?,
        samp_trajs: Tensor::from_vec(to_f32(samp), (nspiral, nsample, 2), device)?,
        samp_ts: Tensor::from_vec(to_f32(orig_ts[..nsample].to_vec()), nsample, device)?,
        orig_ts: Tensor::from_vec(to_f32(orig_ts), ntotal, device)?,
        clockwise,
        start_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn shapes_and_windows() -> Result<()> {
        let config = SpiralConfig {
            nspiral: 8,
            ntotal: 50,
            nsample: 10,
            noise_std: 0.0,
            ..Default::default()
        };
        let data = generate_spiral2d(&config, &Device::Cpu, &mut StdRng::seed_from_u64(2))?;

        assert_eq!(data.orig_trajs.dims(), &[8, 50, 2]);
        assert_eq!(data.samp_trajs.dims(), &[8, 10, 2]);
        assert_eq!(data.orig_ts.dims(), &[50]);
        assert_eq!(data.samp_ts.dims(), &[10]);

        // noiseless windows are slices of the reference curve
        for (i, &t0) in data.start_index.iter().enumerate() {
            assert!((10..40).contains(&t0));
            let window = data.orig_trajs.get(i)?.narrow(0, t0, 10)?;
            let diff = (window - data.samp_trajs.get(i)?)?
                .abs()?
                .max_keepdim(0)?
                .max_keepdim(1)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            assert!(diff[0] < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn too_few_time_points() {
        let config = SpiralConfig {
            ntotal: 20,
            nsample: 10,
            ..Default::default()
        };
        assert!(generate_spiral2d(&config, &Device::Cpu, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
