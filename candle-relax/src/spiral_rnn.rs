use crate::candle_aux_layers::*;
use crate::gaussian::log_normal_pdf;

use candle_core::{Result, Tensor, D};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// observation noise of the spiral likelihood
pub const SPIRAL_NOISE_STD: f64 = 0.3;

/// GRU over `(x, y, t)` inputs followed by a small ReLU decoder back to
/// the observation space.
pub struct SpiralRnn {
    gru: GRU,
    dec: StackLayers<Linear>,
    obs_dim: usize,
    rnn_hidden: usize,
}

impl SpiralRnn {
    /// * `obs_dim` - observation dimension (2 for planar spirals)
    /// * `n_hidden` - decoder hidden units
    /// * `rnn_hidden` - GRU state size
    pub fn new(obs_dim: usize, n_hidden: usize, rnn_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let gru = gru(obs_dim + 1, rnn_hidden, GRUConfig::default(), vb.pp("gru"))?;
        let dec = linear_stack(rnn_hidden, &[n_hidden], obs_dim, Activation::Relu, vb.pp("dec"))?;
        Ok(Self {
            gru,
            dec,
            obs_dim,
            rnn_hidden,
        })
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn rnn_hidden(&self) -> usize {
        self.rnn_hidden
    }

    /// Teacher-forced predictions
    ///
    /// * `trajs_ntd` - observed trajectories
    /// * `ts_t` - shared time stamps
    /// * `init` - GRU state to resume from, zeros if `None`
    ///
    /// Returns the `n x t x d` predictions and the last GRU state
    pub fn forward(
        &self,
        trajs_ntd: &Tensor,
        ts_t: &Tensor,
        init: Option<&GRUState>,
    ) -> Result<(Tensor, GRUState)> {
        let (n, t, _) = trajs_ntd.dims3()?;
        let ts_nt1 = ts_t
            .to_dtype(trajs_ntd.dtype())?
            .reshape((1, t, 1))?
            .broadcast_as((n, t, 1))?;
        let inputs = Tensor::cat(&[trajs_ntd, &ts_nt1], D::Minus1)?;

        let states = match init {
            Some(h) => self.gru.seq_init(&inputs, h)?,
            None => self.gru.seq(&inputs)?,
        };

        let last = match states.last() {
            Some(h) => h.clone(),
            None => candle_core::bail!("empty sequence"),
        };

        let out_nth = self.gru.states_to_tensor(&states)?;
        Ok((self.dec.forward(&out_nth)?, last))
    }

    /// Negative Gaussian log-likelihood with fixed noise, summed over time
    /// and coordinates, averaged over trajectories
    pub fn loss(&self, trajs_ntd: &Tensor, pred_ntd: &Tensor) -> Result<Tensor> {
        let logvar = Tensor::full(
            2.0 * SPIRAL_NOISE_STD.ln(),
            pred_ntd.shape(),
            pred_ntd.device(),
        )?
        .to_dtype(pred_ntd.dtype())?;

        log_normal_pdf(trajs_ntd, pred_ntd, &logvar)?
            .sum(2)?
            .sum(1)?
            .neg()?
            .mean(0)
    }

    /// Autoregressive rollout from the first observation: each prediction
    /// is fed back with the next time stamp. Returns `n x len(ts) x d`.
    pub fn extrapolate(&self, first_nd: &Tensor, ts_t: &Tensor) -> Result<Tensor> {
        let (n, _) = first_nd.dims2()?;
        let ts = ts_t.to_dtype(first_nd.dtype())?;
        let len = ts.dim(0)?;

        let mut state = self.gru.zero_state(n)?;
        let mut x_nd = first_nd.clone();
        let mut preds = Vec::with_capacity(len);

        for i in 0..len {
            let t_n1 = ts.narrow(0, i, 1)?.reshape((1, 1))?.broadcast_as((n, 1))?;
            let input = Tensor::cat(&[&x_nd, &t_n1], 1)?;
            state = self.gru.step(&input, &state)?;
            x_nd = self.dec.forward(state.h())?;
            preds.push(x_nd.unsqueeze(1)?);
        }

        Tensor::cat(&preds, 1)
    }
}
