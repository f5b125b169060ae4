//! Switching-state networks built on the categorical relaxation.
//!
//! `K = n_states` regimes each carry their own encoder for the continuous
//! latent `x^k_{1:T}`. A relaxed discrete state `z_t` (`z_dim` groups of `K`
//! states, flattened to `z_dim * K`) is inferred step by step from the
//! previous state and a summary of all regimes, then used as a soft index
//! that mixes the regime samples into one continuous latent `x_t`.
//!
//! Only the networks are provided; no objective is assembled here.

use crate::candle_aux_ops::reverse_dim;
use crate::gaussian::gaussian_reparameterize;
use crate::relax::gumbel::gumbel_softmax_states;
use crate::relax_error::RelaxError;

use candle_core::{Device, Result, Tensor};
use candle_nn::rnn::{gru, GRUConfig, GRU, RNN};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};
use log::debug;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct SldmConfig {
    pub n_states: usize,
    pub y_dim: usize,
    pub x_dim: usize,
    pub z_dim: usize,
    pub z_emission_dim: usize,
    pub z_transition_dim: usize,
    pub y_rnn_dim: usize,
    pub x_rnn_dim: usize,
}

impl Default for SldmConfig {
    fn default() -> Self {
        Self {
            n_states: 3,
            y_dim: 2,
            x_dim: 2,
            z_dim: 2,
            z_emission_dim: 16,
            z_transition_dim: 16,
            y_rnn_dim: 32,
            x_rnn_dim: 32,
        }
    }
}

impl SldmConfig {
    /// size of the flattened relaxed state
    pub fn state_dim(&self) -> usize {
        self.z_dim * self.n_states
    }

    /// Each state group gates one latent coordinate (`z_dim == x_dim`) or
    /// all of them at once (`z_dim == 1`).
    pub fn validate(&self) -> Result<()> {
        if self.n_states == 0 || self.z_dim == 0 || self.x_dim == 0 || self.y_dim == 0 {
            return Err(RelaxError::InvalidParameter(format!(
                "empty dimension in {:?}",
                self
            ))
            .into());
        }
        if self.z_dim != self.x_dim && self.z_dim != 1 {
            return Err(RelaxError::ShapeMismatch(format!(
                "z_dim ({}) must equal x_dim ({}) or be 1",
                self.z_dim, self.x_dim
            ))
            .into());
        }
        Ok(())
    }
}

/// `p(z_t | z_{t-1})`: state logits from the previous relaxed state
pub struct StateTransition {
    lin_z_to_hidden: Linear,
    lin_hidden_to_logits: Linear,
}

impl StateTransition {
    pub fn new(state_dim: usize, transition_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin_z_to_hidden: linear(state_dim, transition_dim, vb.pp("z_to_hidden"))?,
            lin_hidden_to_logits: linear(transition_dim, state_dim, vb.pp("hidden_to_logits"))?,
        })
    }
}

impl Module for StateTransition {
    fn forward(&self, z_prev: &Tensor) -> Result<Tensor> {
        self.lin_hidden_to_logits
            .forward(&self.lin_z_to_hidden.forward(z_prev)?)
    }
}

/// `q(z_t | z_{t-1}, x^1_{t:T}, ..., x^K_{t:T})`
pub struct StateCombiner {
    lin_z_to_hidden: Linear,
    lin_hidden_to_logits: Linear,
}

impl StateCombiner {
    pub fn new(state_dim: usize, rnn_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin_z_to_hidden: linear(state_dim, rnn_dim, vb.pp("z_to_hidden"))?,
            lin_hidden_to_logits: linear(rnn_dim, state_dim, vb.pp("hidden_to_logits"))?,
        })
    }

    /// * `z_prev` - `n x state_dim` previous relaxed state
    /// * `summary` - `n x rnn_dim` downsampled regime summary at `t`
    pub fn forward(&self, z_prev: &Tensor, summary: &Tensor) -> Result<Tensor> {
        let h = (self.lin_z_to_hidden.forward(z_prev)? + summary)?;
        self.lin_hidden_to_logits.forward(&h)
    }
}

/// `n x (rnn_dim * K)` concatenated regime summaries -> `n x rnn_dim`
pub struct StateDownsampler {
    lin: Linear,
}

impl StateDownsampler {
    pub fn new(rnn_dim: usize, n_states: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin: linear(rnn_dim * n_states, rnn_dim, vb.pp("lin"))?,
        })
    }
}

impl Module for StateDownsampler {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.lin.forward(xs)
    }
}

/// `p(x_t | z_t)`: mean through one hidden layer, log-variance fixed at 0
pub struct StateEmitter {
    lin_z_to_hidden: Linear,
    lin_hidden_to_mu: Linear,
}

impl StateEmitter {
    pub fn new(x_dim: usize, state_dim: usize, emission_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin_z_to_hidden: linear(state_dim, emission_dim, vb.pp("z_to_hidden"))?,
            lin_hidden_to_mu: linear(emission_dim, x_dim, vb.pp("hidden_to_mu"))?,
        })
    }

    pub fn forward(&self, z: &Tensor) -> Result<(Tensor, Tensor)> {
        let mu = self
            .lin_hidden_to_mu
            .forward(&self.lin_z_to_hidden.forward(z)?)?;
        let logvar = mu.zeros_like()?;
        Ok((mu, logvar))
    }
}

/// One regime's view of the data:
/// * `q(x^k_t | y_{t:T})` from a GRU run backwards over the observations
/// * a backward GRU summary of the sampled `x^k_{t:T}`
pub struct RegimeEncoder {
    y_rnn: GRU,
    lin_mu: Linear,
    lin_logvar: Linear,
    x_rnn: GRU,
}

pub struct RegimeOutput {
    /// `n x T x x_dim` reparameterized sample
    pub x: Tensor,
    pub mu: Tensor,
    pub logvar: Tensor,
    /// `n x T x x_rnn_dim`, row `t` summarizes `x_{t:T}`
    pub summary: Tensor,
}

impl RegimeEncoder {
    pub fn new(config: &SldmConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            y_rnn: gru(config.y_dim, config.y_rnn_dim, GRUConfig::default(), vb.pp("y_rnn"))?,
            lin_mu: linear(config.y_rnn_dim, config.x_dim, vb.pp("mu"))?,
            lin_logvar: linear(config.y_rnn_dim, config.x_dim, vb.pp("logvar"))?,
            x_rnn: gru(config.x_dim, config.x_rnn_dim, GRUConfig::default(), vb.pp("x_rnn"))?,
        })
    }

    fn backward_states(rnn: &GRU, xs_ntd: &Tensor) -> Result<Tensor> {
        let states = rnn.seq(&reverse_dim(xs_ntd, 1)?)?;
        reverse_dim(&rnn.states_to_tensor(&states)?, 1)
    }

    pub fn forward<R>(&self, y_ntd: &Tensor, rng: &mut R) -> Result<RegimeOutput>
    where
        R: Rng + ?Sized,
    {
        let h_y = Self::backward_states(&self.y_rnn, y_ntd)?;
        let mu = self.lin_mu.forward(&h_y)?;
        let logvar = self.lin_logvar.forward(&h_y)?;
        let x = gaussian_reparameterize(&mu, &logvar, rng)?;
        let summary = Self::backward_states(&self.x_rnn, &x)?;
        Ok(RegimeOutput {
            x,
            mu,
            logvar,
            summary,
        })
    }
}

fn check_time_steps(tt: usize) -> Result<()> {
    if tt == 0 {
        return Err(
            RelaxError::ShapeMismatch("sequence needs at least one time step".into()).into(),
        );
    }
    Ok(())
}

pub struct SldmInference {
    /// `n x T x x_dim` state-mixed continuous latent
    pub x: Tensor,
    /// `n x K x T x x_dim`
    pub q_x_mu: Tensor,
    /// `n x K x T x x_dim`
    pub q_x_logvar: Tensor,
    /// `n x T x state_dim` relaxed states
    pub z: Tensor,
    /// `n x T x state_dim`
    pub z_logits: Tensor,
}

pub struct SwitchingStateNetworks {
    config: SldmConfig,
    z_0: Tensor,
    z_q_0: Tensor,
    regimes: Vec<RegimeEncoder>,
    transition: StateTransition,
    combiner: StateCombiner,
    downsampler: StateDownsampler,
    emitter: StateEmitter,
}

impl SwitchingStateNetworks {
    pub fn new(config: SldmConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let sd = config.state_dim();

        let z_0 = vb.get_with_hints(sd, "z_0", Init::Const(0.))?;
        let z_q_0 = vb.get_with_hints(sd, "z_q_0", Init::Const(0.))?;

        let regimes = (0..config.n_states)
            .map(|k| RegimeEncoder::new(&config, vb.pp(format!("regime.{}", k))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            transition: StateTransition::new(sd, config.z_transition_dim, vb.pp("transition"))?,
            combiner: StateCombiner::new(sd, config.x_rnn_dim, vb.pp("combiner"))?,
            downsampler: StateDownsampler::new(
                config.x_rnn_dim,
                config.n_states,
                vb.pp("downsampler"),
            )?,
            emitter: StateEmitter::new(
                config.x_dim,
                sd,
                config.z_emission_dim,
                vb.pp("emitter"),
            )?,
            config,
            z_0,
            z_q_0,
            regimes,
        })
    }

    pub fn config(&self) -> &SldmConfig {
        &self.config
    }

    fn relax<R>(&self, logits: &Tensor, temperature: f64, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        gumbel_softmax_states(
            logits,
            self.config.z_dim,
            self.config.n_states,
            temperature,
            rng,
        )
    }

    /// Soft-index the regime samples with the relaxed state
    ///
    /// * `z_n_s` - `n x (z_dim * K)`
    /// * `q_x_nkd` - `n x K x x_dim` regime samples at one time step
    fn mix_regimes(&self, z_ns: &Tensor, q_x_nkd: &Tensor) -> Result<Tensor> {
        let n = z_ns.dim(0)?;
        let z_nzk = z_ns.reshape((n, self.config.z_dim, self.config.n_states))?;
        let q_x_ndk = q_x_nkd.transpose(1, 2)?;
        z_nzk.broadcast_mul(&q_x_ndk)?.sum(2)
    }

    /// `q(z_{1:T}, x_{1:T} | y_{1:T})`
    ///
    /// * `y_ntd` - observations `n x T x y_dim`
    /// * `temperature` - Gumbel-Softmax temperature (positive)
    pub fn inference_network<R>(
        &self,
        y_ntd: &Tensor,
        temperature: f64,
        rng: &mut R,
    ) -> Result<SldmInference>
    where
        R: Rng + ?Sized,
    {
        let (n, tt, y_dim) = y_ntd.dims3()?;
        check_time_steps(tt)?;
        if y_dim != self.config.y_dim {
            return Err(RelaxError::ShapeMismatch(format!(
                "observations have {} coordinates, networks expect {}",
                y_dim, self.config.y_dim
            ))
            .into());
        }

        let mut q_x = vec![];
        let mut q_x_mu = vec![];
        let mut q_x_logvar = vec![];
        let mut summaries = vec![];

        for regime in self.regimes.iter() {
            let out = regime.forward(y_ntd, rng)?;
            q_x.push(out.x.unsqueeze(1)?);
            q_x_mu.push(out.mu.unsqueeze(1)?);
            q_x_logvar.push(out.logvar.unsqueeze(1)?);
            summaries.push(out.summary);
        }

        let q_x_nktd = Tensor::cat(&q_x, 1)?;
        let q_x_mu = Tensor::cat(&q_x_mu, 1)?;
        let q_x_logvar = Tensor::cat(&q_x_logvar, 1)?;
        let summary_nth = Tensor::cat(&summaries, 2)?;

        let sd = self.config.state_dim();
        let z_q_0 = self.z_q_0.unsqueeze(0)?.broadcast_as((n, sd))?;
        let mut z_prev = self.relax(&z_q_0, temperature, rng)?;

        let mut x_t_vec = Vec::with_capacity(tt);
        let mut z_t_vec = Vec::with_capacity(tt);
        let mut logits_vec = Vec::with_capacity(tt);

        for t in 0..tt {
            let summary_t = self.downsampler.forward(&summary_nth.get_on_dim(1, t)?)?;
            let logits_t = self.combiner.forward(&z_prev, &summary_t)?;
            let z_t = self.relax(&logits_t, temperature, rng)?;

            let x_t = self.mix_regimes(&z_t, &q_x_nktd.get_on_dim(2, t)?)?;

            x_t_vec.push(x_t);
            logits_vec.push(logits_t);
            z_t_vec.push(z_t.clone());
            z_prev = z_t;
        }

        debug!("inferred {} x {} relaxed states at T = {}", n, sd, temperature);

        Ok(SldmInference {
            x: Tensor::stack(&x_t_vec, 1)?,
            q_x_mu,
            q_x_logvar,
            z: Tensor::stack(&z_t_vec, 1)?,
            z_logits: Tensor::stack(&logits_vec, 1)?,
        })
    }

    /// `p(z_{1:T})` rolled out from the learned initial logits; returns
    /// relaxed states and their logits, both `n x T x state_dim`
    pub fn prior_network<R>(
        &self,
        n: usize,
        tt: usize,
        temperature: f64,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)>
    where
        R: Rng + ?Sized,
    {
        check_time_steps(tt)?;
        let sd = self.config.state_dim();
        let z_0 = self.z_0.unsqueeze(0)?.broadcast_as((n, sd))?;
        let mut z_prev = self.relax(&z_0, temperature, rng)?;

        let mut z_t_vec = Vec::with_capacity(tt);
        let mut logits_vec = Vec::with_capacity(tt);

        for _ in 0..tt {
            let logits_t = self.transition.forward(&z_prev)?;
            let z_t = self.relax(&logits_t, temperature, rng)?;
            logits_vec.push(logits_t);
            z_t_vec.push(z_t.clone());
            z_prev = z_t;
        }

        Ok((Tensor::stack(&z_t_vec, 1)?, Tensor::stack(&logits_vec, 1)?))
    }

    /// `p(x_t | z_t)` mean and log-variance for any leading shape
    pub fn emission(&self, z: &Tensor) -> Result<(Tensor, Tensor)> {
        self.emitter.forward(z)
    }

    /// posterior state occupancy: average of the relaxed one-hot states
    /// over samples and time, `z_dim x K`
    pub fn state_occupancy(&self, z_nts: &Tensor) -> Result<Tensor> {
        let (n, tt, _) = z_nts.dims3()?;
        z_nts
            .reshape((n * tt, self.config.z_dim, self.config.n_states))?
            .mean(0)
    }

    pub fn device(&self) -> &Device {
        self.z_0.device()
    }
}
