pub mod candle_aux_layers;
pub mod candle_aux_ops;
pub mod gaussian;
pub mod mixture;
pub mod relax;
pub mod relax_error;
pub mod schedule;
pub mod sldm;
pub mod spiral;
pub mod spiral_rnn;

pub use mixture::MixtureOfDiagNormals;
pub use relax::gumbel::{
    gumbel_softmax, gumbel_softmax_sample, gumbel_softmax_states, sample_gumbel,
};
pub use relax::sparsemax::{sparsemax, Sparsemax};
pub use relax_error::RelaxError;
pub use schedule::TemperatureSchedule;

pub use candle_core;
pub use candle_nn;
