use crate::common::*;

use candle_core::{DType, IndexOp};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_relax::spiral::{generate_spiral2d, SpiralConfig};
use candle_relax::spiral_rnn::SpiralRnn;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct SpiralRnnArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.safetensors (GRU and decoder parameters)\n\
		     - {out}.trace.tsv (negative log-likelihood per epoch)\n\
		     - {out}.recon.tsv (true, teacher-forced and generated paths)\n"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 1000, help = "Number of spirals")]
    nspiral: usize,

    #[arg(long, default_value_t = 500, help = "Time points per reference spiral")]
    ntotal: usize,

    #[arg(
        long,
        default_value_t = 100,
        help = "Observed time points per spiral",
        long_help = "Observed time points per spiral.\n\
		     Must satisfy ntotal > 2 * nsample."
    )]
    nsample: usize,

    #[arg(long, default_value_t = 0.3, help = "Observation noise standard deviation")]
    noise_std: f64,

    #[arg(long, default_value_t = 20, help = "Decoder hidden units")]
    n_hidden: usize,

    #[arg(long, default_value_t = 25, help = "GRU state size")]
    rnn_hidden: usize,

    #[arg(long, short = 'i', default_value_t = 500, help = "Number of epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 0.01, help = "Learning rate")]
    learning_rate: f64,

    #[arg(long, default_value_t = 0, help = "Spiral to write in {out}.recon.tsv")]
    index: usize,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, short, help = "Verbose logging (hides the progress bar)")]
    verbose: bool,
}

pub fn fit_spiral_rnn(args: &SpiralRnnArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let config = TrainConfig {
        learning_rate: args.learning_rate,
        num_epochs: args.epochs,
        device: args.device.to_device()?,
        verbose: args.verbose,
        show_progress: true,
    };
    let dev = &config.device;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let spiral_config = SpiralConfig {
        nspiral: args.nspiral,
        ntotal: args.ntotal,
        nsample: args.nsample,
        noise_std: args.noise_std,
        ..Default::default()
    };
    let data = generate_spiral2d(&spiral_config, dev, &mut rng)?;

    if args.index >= args.nspiral {
        anyhow::bail!("--index {} out of {} spirals", args.index, args.nspiral);
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let rnn = SpiralRnn::new(2, args.n_hidden, args.rnn_hidden, vb.pp("rnn"))?;

    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: 0.,
        ..Default::default()
    };
    let mut adam = AdamW::new(varmap.all_vars(), params)?;

    let pb = config.progress_bar();
    let mut loss_trace = vec![];
    let mut meter = AverageMeter::default();

    for epoch in 0..config.num_epochs {
        let (pred, _) = rnn.forward(&data.samp_trajs, &data.samp_ts, None)?;
        let loss = rnn.loss(&data.samp_trajs, &pred)?;
        adam.backward_step(&loss)?;

        let loss_val = loss.to_scalar::<f32>()?;
        meter.update(loss_val as f64);
        loss_trace.push(loss_val);
        pb.inc(1);

        if config.verbose {
            info!("[{}] loss: {} (avg {})", epoch + 1, loss_val, meter.avg());
        }
    }
    pb.finish_and_clear();

    mkdir_for(&args.out)?;
    varmap.save(format!("{}.safetensors", args.out))?;
    write_trace(&format!("{}.trace.tsv", args.out), "nll", &loss_trace)?;

    // teacher-forced reconstruction and free rollout of one spiral
    let orig = data.orig_trajs.i(args.index..args.index + 1)?;
    let (recon, _) = rnn.forward(&orig, &data.orig_ts, None)?;
    let extra = rnn.extrapolate(&orig.i((.., 0, ..))?, &data.orig_ts)?;

    let ts = data.orig_ts.to_vec1::<f32>()?;
    let orig = orig.squeeze(0)?.to_vec2::<f32>()?;
    let recon = recon.squeeze(0)?.to_vec2::<f32>()?;
    let extra = extra.squeeze(0)?.to_vec2::<f32>()?;

    let rows = (0..ts.len()).map(|t| {
        [
            ts[t], orig[t][0], orig[t][1], recon[t][0], recon[t][1], extra[t][0], extra[t][1],
        ]
    });
    write_tsv(
        &format!("{}.recon.tsv", args.out),
        &["t", "x", "y", "recon_x", "recon_y", "gen_x", "gen_y"],
        rows,
    )?;

    Ok(())
}
