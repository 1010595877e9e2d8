use std::io::{self, Read, Write};

use rand::Rng;

use crate::activation::Activation;
use crate::error::Result;
use crate::layer::{Gradients, Layer, LayerKind};
use crate::layers::DenseLayer;
use crate::network::Cost;
use crate::serialize;
use crate::tensor::{Tensor, TensorInfo, TensorView};

/// Output layer: a fully-connected layer paired with the cost function used
/// to seed backpropagation.
#[derive(Debug, Clone)]
pub struct OutputLayer {
    inner: DenseLayer,
    cost: Cost,
}

impl OutputLayer {
    pub fn new(
        input: TensorInfo,
        neurons: usize,
        phi: Activation,
        cost: Cost,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Ok(Self {
            inner: DenseLayer::new(input, neurons, phi, rng)?,
            cost,
        })
    }

    pub fn cost_function(&self) -> Cost {
        self.cost
    }

    /// The network-level cost of activations `a` against targets `y`.
    pub fn cost(&self, a: TensorView, y: TensorView) -> Result<f32> {
        self.cost.cost(a, y)
    }

    /// The seed delta dCost/dz for backpropagation.
    pub fn delta(&self, a: TensorView, y: TensorView, z: TensorView) -> Result<Tensor> {
        self.cost.delta(a, y, z, self.activation())
    }

    pub fn deserialize(r: &mut dyn Read) -> Option<Self> {
        let inner = DenseLayer::deserialize(r)?;
        let cost = Cost::from_tag(serialize::read_u8(r)?)?;
        Some(Self { inner, cost })
    }
}

impl Layer for OutputLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Output
    }

    fn input(&self) -> TensorInfo {
        self.inner.input()
    }

    fn output(&self) -> TensorInfo {
        self.inner.output()
    }

    fn activation(&self) -> Activation {
        self.inner.activation()
    }

    fn weights(&self) -> &[f32] {
        self.inner.weights()
    }

    fn weights_mut(&mut self) -> &mut [f32] {
        self.inner.weights_mut()
    }

    fn biases(&self) -> &[f32] {
        self.inner.biases()
    }

    fn biases_mut(&mut self) -> &mut [f32] {
        self.inner.biases_mut()
    }

    fn forward(&mut self, x: TensorView) -> Result<(Tensor, Tensor)> {
        self.inner.forward(x)
    }

    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor> {
        self.inner.backward(delta, z_prev, phi_prev)
    }

    fn compute_gradient(
        &self,
        a_prev: TensorView,
        delta: TensorView,
    ) -> Result<Option<Gradients>> {
        self.inner.compute_gradient(a_prev, delta)
    }

    fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        self.inner.serialize(w)?;
        serialize::write_u8(w, self.cost.tag())
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        let mut copy = self.clone();
        copy.inner.reset_cache();
        Box::new(copy)
    }
}
