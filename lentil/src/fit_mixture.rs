use crate::common::*;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Init, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_relax::MixtureOfDiagNormals;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Args, Debug)]
pub struct MixtureFitArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.safetensors (fitted parameters)\n\
		     - {out}.trace.tsv (KL estimate per epoch)\n\
		     - {out}.mixture.json (fitted and target mixtures)\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        help = "Target mixture (JSON)",
        long_help = "Target mixture as JSON with fields\n\
		     `locs` (K x D), `coord_scale` (K x D), `component_logits` (K).\n\
		     Without it, equal-weight modes are placed on a circle\n\
		     in the first two coordinates."
    )]
    target: Option<Box<str>>,

    #[arg(long, short = 'k', default_value_t = 4, help = "Number of fitted components")]
    components: usize,

    #[arg(long, short = 'd', default_value_t = 2, help = "Event dimension (>= 2)")]
    dim: usize,

    #[arg(
        long,
        default_value_t = 3,
        help = "Number of target modes",
        long_help = "Number of modes of the default target on a circle.\n\
		     Ignored when `--target` is given."
    )]
    target_components: usize,

    #[arg(long, default_value_t = 4.0, help = "Radius of the default target circle")]
    radius: f64,

    #[arg(long, default_value_t = 0.7, help = "Scale of the default target modes")]
    target_scale: f64,

    #[arg(
        long,
        short = 's',
        default_value_t = 256,
        help = "Reparameterized samples per epoch"
    )]
    samples: usize,

    #[arg(long, short = 'i', default_value_t = 500, help = "Number of epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 0.05, help = "Learning rate")]
    learning_rate: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, short, help = "Verbose logging (hides the progress bar)")]
    verbose: bool,
}

/// Mixture parameters as stored in `{out}.mixture.json`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MixtureParams {
    pub locs: Vec<Vec<f32>>,
    pub coord_scale: Vec<Vec<f32>>,
    pub component_logits: Vec<f32>,
}

impl MixtureParams {
    pub fn from_mixture(mix: &MixtureOfDiagNormals) -> anyhow::Result<Self> {
        Ok(Self {
            locs: mix.locs().to_dtype(DType::F32)?.to_vec2()?,
            coord_scale: mix.coord_scale().to_dtype(DType::F32)?.to_vec2()?,
            component_logits: mix.component_logits().to_dtype(DType::F32)?.to_vec1()?,
        })
    }

    pub fn to_mixture(&self, device: &Device) -> anyhow::Result<MixtureOfDiagNormals> {
        let k = self.locs.len();
        let d = self.locs.first().map(|r| r.len()).unwrap_or(0);
        if self.locs.iter().chain(self.coord_scale.iter()).any(|r| r.len() != d)
            || self.coord_scale.len() != k
        {
            anyhow::bail!("ragged mixture parameters");
        }

        let flat = |m: &[Vec<f32>]| m.iter().flatten().copied().collect::<Vec<_>>();
        Ok(MixtureOfDiagNormals::new(
            Tensor::from_vec(flat(&self.locs), (k, d), device)?,
            Tensor::from_vec(flat(&self.coord_scale), (k, d), device)?,
            Tensor::from_vec(self.component_logits.clone(), self.component_logits.len(), device)?,
        )?)
    }

    /// equal-weight modes on a circle in the first two coordinates
    pub fn circle(n_modes: usize, dim: usize, radius: f64, scale: f64) -> Self {
        let locs = (0..n_modes)
            .map(|k| {
                let angle = 2. * PI * k as f64 / n_modes as f64;
                let mut row = vec![0f32; dim];
                row[0] = (radius * angle.cos()) as f32;
                row[1] = (radius * angle.sin()) as f32;
                row
            })
            .collect();
        Self {
            locs,
            coord_scale: vec![vec![scale as f32; dim]; n_modes],
            component_logits: vec![0f32; n_modes],
        }
    }
}

#[derive(Serialize)]
struct FitSummary {
    target: MixtureParams,
    fitted: MixtureParams,
    final_kl: Option<f32>,
}

/// Fit `q` to `p` by minimizing `E_q[log q(z) - log p(z)]` with samples
/// from `q.rsample`
pub fn fit_mixture(args: &MixtureFitArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    if args.dim < 2 {
        anyhow::bail!("--dim must be at least 2");
    }

    let config = TrainConfig {
        learning_rate: args.learning_rate,
        num_epochs: args.epochs,
        device: args.device.to_device()?,
        verbose: args.verbose,
        show_progress: true,
    };
    let dev = &config.device;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let target = match &args.target {
        Some(file) => {
            let text = std::fs::read_to_string(&**file)?;
            serde_json::from_str::<MixtureParams>(&text)?
        }
        None => MixtureParams::circle(args.target_components, args.dim, args.radius, args.target_scale),
    };
    let p = target.to_mixture(dev)?;
    let dim = p.event_dim();
    info!(
        "target: {} components in {} dimensions",
        p.num_components(),
        dim
    );

    let (k, d) = (args.components, dim);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let locs = vb.get_with_hints(
        (k, d),
        "q.locs",
        Init::Randn {
            mean: 0.,
            stdev: 1.,
        },
    )?;
    let log_scale = vb.get_with_hints((k, d), "q.log_scale", Init::Const(0.))?;
    let logits = vb.get_with_hints(k, "q.logits", Init::Const(0.))?;

    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: 0.,
        ..Default::default()
    };
    let mut adam = AdamW::new(varmap.all_vars(), params)?;

    let pb = config.progress_bar();
    let mut kl_trace = vec![];
    let mut meter = AverageMeter::default();

    for epoch in 0..config.num_epochs {
        let q = MixtureOfDiagNormals::new(locs.clone(), log_scale.exp()?, logits.clone())?;
        let z = q.rsample(&[args.samples], &mut rng)?;
        let kl = (q.log_prob(&z)? - p.log_prob(&z)?)?.mean_all()?;
        adam.backward_step(&kl)?;

        let kl_val = kl.to_scalar::<f32>()?;
        meter.update(kl_val as f64);
        kl_trace.push(kl_val);
        pb.inc(1);

        if config.verbose {
            info!("[{}] KL: {} (avg {})", epoch + 1, kl_val, meter.avg());
        }
    }
    pb.finish_and_clear();

    if let Some(kl) = kl_trace.last() {
        info!("final KL estimate: {}", kl);
    }

    mkdir_for(&args.out)?;
    varmap.save(format!("{}.safetensors", args.out))?;
    write_trace(&format!("{}.trace.tsv", args.out), "kl", &kl_trace)?;

    let fitted = MixtureOfDiagNormals::new(locs, log_scale.exp()?, logits)?;
    let summary = FitSummary {
        target,
        fitted: MixtureParams::from_mixture(&fitted)?,
        final_kl: kl_trace.last().copied(),
    };
    let json_file = format!("{}.mixture.json", args.out);
    std::fs::write(&json_file, serde_json::to_string_pretty(&summary)?)?;
    info!("wrote {}", json_file);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_builds_a_mixture() -> anyhow::Result<()> {
        let params = MixtureParams::circle(3, 2, 4.0, 0.5);
        let text = serde_json::to_string(&params)?;
        let back: MixtureParams = serde_json::from_str(&text)?;
        let mix = back.to_mixture(&Device::Cpu)?;
        assert_eq!(mix.num_components(), 3);
        assert_eq!(mix.event_dim(), 2);
        Ok(())
    }

    #[test]
    fn ragged_parameters_are_rejected() {
        let params = MixtureParams {
            locs: vec![vec![0., 1.], vec![2.]],
            coord_scale: vec![vec![1., 1.], vec![1., 1.]],
            component_logits: vec![0., 0.],
        };
        assert!(params.to_mixture(&Device::Cpu).is_err());
    }

    #[test]
    fn short_fit_writes_outputs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("mix");
        let args = MixtureFitArgs {
            out: out.to_string_lossy().into(),
            target: None,
            components: 2,
            dim: 2,
            target_components: 2,
            radius: 3.0,
            target_scale: 0.8,
            samples: 32,
            epochs: 5,
            learning_rate: 0.05,
            seed: 1,
            device: ComputeDevice::Cpu,
            verbose: false,
        };
        fit_mixture(&args)?;

        let prefix = out.to_string_lossy();
        assert!(std::path::Path::new(&format!("{}.safetensors", prefix)).exists());
        let trace = std::fs::read_to_string(format!("{}.trace.tsv", prefix))?;
        assert_eq!(trace.lines().count(), 6);
        let json = std::fs::read_to_string(format!("{}.mixture.json", prefix))?;
        assert!(json.contains("fitted"));
        Ok(())
    }
}
