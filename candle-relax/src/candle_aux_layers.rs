use candle_core::{Result, Tensor};
use candle_nn::{linear, Activation, Linear, Module, VarBuilder};

/// Feed-forward stack: each `M` optionally followed by an activation
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// `d_in -> hidden[0] -> ... -> d_out` with `act` between hidden layers
/// and a linear output; parameters live under `{vb}.fc.{j}`.
pub fn linear_stack(
    d_in: usize,
    hidden: &[usize],
    d_out: usize,
    act: Activation,
    vb: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev = d_in;
    for (j, &next) in hidden.iter().enumerate() {
        fc.push_with_act(linear(prev, next, vb.pp(format!("fc.{}", j)))?, act);
        prev = next;
    }
    fc.push(linear(prev, d_out, vb.pp(format!("fc.{}", hidden.len())))?);
    Ok(fc)
}
