use crate::common::*;

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use candle_relax::sldm::{SldmConfig, SwitchingStateNetworks};
use candle_relax::spiral::{generate_spiral2d, SpiralConfig};
use candle_relax::TemperatureSchedule;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct SldmSampleArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.states.tsv (state occupancy per annealing step)\n"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 100, help = "Number of spirals")]
    nspiral: usize,

    #[arg(long, default_value_t = 200, help = "Time points per reference spiral")]
    ntotal: usize,

    #[arg(long, default_value_t = 50, help = "Observed time points per spiral")]
    nsample: usize,

    #[arg(long, short = 'k', default_value_t = 3, help = "Number of switching states")]
    n_states: usize,

    #[arg(long, default_value_t = 2, help = "Continuous latent dimension")]
    x_dim: usize,

    #[arg(
        long,
        default_value_t = 2,
        help = "State groups",
        long_help = "Number of relaxed categorical groups.\n\
		     Must equal --x-dim (one switch per latent coordinate)\n\
		     or be 1 (one switch for all coordinates)."
    )]
    z_dim: usize,

    #[arg(long, default_value_t = 32, help = "GRU size over observations")]
    y_rnn_dim: usize,

    #[arg(long, default_value_t = 32, help = "GRU size over latent samples")]
    x_rnn_dim: usize,

    #[arg(long, default_value_t = 16, help = "Hidden units of transition/emission")]
    hidden_dim: usize,

    #[arg(long, default_value_t = 5.0, help = "Initial Gumbel-Softmax temperature")]
    temperature: f64,

    #[arg(long, default_value_t = 0.1, help = "Temperature floor")]
    min_temperature: f64,

    #[arg(long, default_value_t = 0.5, help = "Exponential decay rate per step")]
    decay_rate: f64,

    #[arg(long, default_value_t = 10, help = "Annealing steps")]
    steps: usize,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, short, help = "Verbose logging")]
    verbose: bool,
}

/// Run the inference and prior networks over spiral observations while
/// annealing the temperature; record how the relaxed states are occupied.
pub fn sldm_sample(args: &SldmSampleArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let dev = args.device.to_device()?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let data = generate_spiral2d(
        &SpiralConfig {
            nspiral: args.nspiral,
            ntotal: args.ntotal,
            nsample: args.nsample,
            ..Default::default()
        },
        &dev,
        &mut rng,
    )?;

    let config = SldmConfig {
        n_states: args.n_states,
        y_dim: 2,
        x_dim: args.x_dim,
        z_dim: args.z_dim,
        z_emission_dim: args.hidden_dim,
        z_transition_dim: args.hidden_dim,
        y_rnn_dim: args.y_rnn_dim,
        x_rnn_dim: args.x_rnn_dim,
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let nets = SwitchingStateNetworks::new(config, vb.pp("sldm"))?;

    let schedule = TemperatureSchedule::new(args.temperature, args.min_temperature, args.decay_rate);
    if schedule.at_step(args.steps.saturating_sub(1)) > 1.0 {
        warn!("temperature stays above 1; relaxed states will be far from one-hot");
    }

    let (n, tt) = (args.nspiral, args.nsample);
    let mut rows = vec![];

    for step in 0..args.steps {
        let temperature = schedule.at_step(step);

        let posterior = nets.inference_network(&data.samp_trajs, temperature, &mut rng)?;
        let (prior_z, _) = nets.prior_network(n, tt, temperature, &mut rng)?;

        for (source, z) in [("posterior", &posterior.z), ("prior", &prior_z)] {
            let occupancy = nets.state_occupancy(z)?.to_vec2::<f32>()?;
            for (group, states) in occupancy.iter().enumerate() {
                for (state, p) in states.iter().enumerate() {
                    rows.push(vec![
                        step.to_string(),
                        format!("{:.4}", temperature),
                        source.to_string(),
                        group.to_string(),
                        state.to_string(),
                        p.to_string(),
                    ]);
                }
            }
        }

        let x_msq = posterior
            .x
            .flatten_all()?
            .sqr()?
            .mean_all()?
            .to_scalar::<f32>()?;
        info!(
            "[{}] temperature {:.4}, mean squared mixed latent {:.4}",
            step + 1,
            temperature,
            x_msq
        );
    }

    mkdir_for(&args.out)?;
    write_tsv(
        &format!("{}.states.tsv", args.out),
        &["step", "temperature", "source", "group", "state", "occupancy"],
        rows,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_table_covers_every_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("sldm");
        let args = SldmSampleArgs {
            out: out.to_string_lossy().into(),
            nspiral: 3,
            ntotal: 25,
            nsample: 8,
            n_states: 2,
            x_dim: 2,
            z_dim: 1,
            y_rnn_dim: 4,
            x_rnn_dim: 4,
            hidden_dim: 3,
            temperature: 2.0,
            min_temperature: 0.1,
            decay_rate: 0.5,
            steps: 2,
            seed: 0,
            device: ComputeDevice::Cpu,
            verbose: false,
        };
        sldm_sample(&args)?;

        let text = std::fs::read_to_string(format!("{}.states.tsv", out.to_string_lossy()))?;
        // header + steps * sources * groups * states
        assert_eq!(text.lines().count(), 1 + 2 * 2 * 1 * 2);
        Ok(())
    }
}
