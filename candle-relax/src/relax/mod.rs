pub mod gumbel;
pub mod sparsemax;
