use crate::activation::Activation;
use crate::error::{NnError, Result};
use crate::layer::Layer;
use crate::tensor::{Shape, Tensor, TensorInfo, TensorView};

/// Cost function selector for the output layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Cost {
    #[default]
    Quadratic,
    CrossEntropy,
}

impl Cost {
    /// Total cost over a batch of activations `a` against targets `y`.
    /// Summed in f64 to keep batch aggregation stable.
    pub fn cost(self, a: TensorView, y: TensorView) -> Result<f32> {
        if a.shape() != y.shape() {
            return Err(NnError::ShapeMismatch {
                expected: y.shape().len(),
                got: a.shape().len(),
            });
        }
        let total: f64 = match self {
            Cost::Quadratic => a
                .data()
                .iter()
                .zip(y.data())
                .map(|(&ak, &yk)| {
                    let d = (ak - yk) as f64;
                    d * d / 2.0
                })
                .sum(),
            Cost::CrossEntropy => a
                .data()
                .iter()
                .zip(y.data())
                .map(|(&ak, &yk)| {
                    let ak = (ak as f64).clamp(1e-12, 1.0 - 1e-12);
                    let yk = yk as f64;
                    -(yk * ak.ln() + (1.0 - yk) * (1.0 - ak).ln())
                })
                .sum(),
        };
        Ok(total as f32)
    }

    /// Output-layer delta dCost/dz.
    ///
    /// Cross-entropy assumes a sigmoid output, where the activation
    /// derivative cancels and the delta collapses to `a - y`.
    pub fn delta(self, a: TensorView, y: TensorView, z: TensorView, phi: Activation) -> Result<Tensor> {
        if a.shape() != y.shape() || a.shape() != z.shape() {
            return Err(NnError::ShapeMismatch {
                expected: y.shape().len(),
                got: a.shape().len(),
            });
        }
        let mut delta = Tensor::new(a.shape());
        for ((dk, &ak), &yk) in delta.data_mut().iter_mut().zip(a.data()).zip(y.data()) {
            *dk = ak - yk;
        }
        if self == Cost::Quadratic {
            phi.deriv_slice(z.data(), delta.data_mut());
        }
        Ok(delta)
    }

    pub fn tag(self) -> u8 {
        match self {
            Cost::Quadratic => 0,
            Cost::CrossEntropy => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Cost::Quadratic,
            1 => Cost::CrossEntropy,
            _ => return None,
        })
    }
}

/// Ordered layer chain. Drives full forward passes and cost computation;
/// per-layer state (caches) lives in the layers themselves.
#[derive(Debug)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    cost: Cost,
}

impl Network {
    /// Builds a network, validating that each layer's output shape feeds the
    /// next layer's input.
    pub fn new(layers: Vec<Box<dyn Layer>>, cost: Cost) -> Result<Self> {
        if layers.is_empty() {
            return Err(NnError::InvalidConfiguration { field: "layers" });
        }
        for pair in layers.windows(2) {
            if pair[0].output().len() != pair[1].input().len() {
                return Err(NnError::ShapeMismatch {
                    expected: pair[1].input().len(),
                    got: pair[0].output().len(),
                });
            }
        }
        Ok(Self { layers, cost })
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn cost_function(&self) -> Cost {
        self.cost
    }

    pub fn input(&self) -> TensorInfo {
        self.layers[0].input()
    }

    pub fn output(&self) -> TensorInfo {
        self.layers[self.layers.len() - 1].output()
    }

    /// Full forward pass; `x` carries one sample per row, and the result has
    /// the same row count. Flat matrix inputs are accepted and viewed with
    /// each layer's declared input shape.
    pub fn forward(&mut self, x: TensorView) -> Result<Tensor> {
        let mut a = x.to_owned();
        for layer in &mut self.layers {
            let view =
                TensorView::reshape(a.data(), Shape::new(a.entities(), layer.input())?)?;
            let (_, next) = layer.forward(view)?;
            a = next;
        }
        Ok(a)
    }

    /// Total cost of the network output for `x` against targets `y`.
    pub fn cost(&mut self, x: TensorView, y: TensorView) -> Result<f32> {
        let a = self.forward(x)?;
        self.cost.cost(a.view(), y)
    }

    /// A deep copy with all layer caches dropped.
    pub fn duplicate(&self) -> Network {
        Network {
            layers: self.layers.iter().map(|l| l.clone_layer()).collect(),
            cost: self.cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::Rng;

    use super::*;
    use crate::activation::Activation;
    use crate::backend::{Backend, ConvInfo, CpuBackend};
    use crate::layers::{ConvolutionLayer, DenseLayer};
    use crate::tensor::{Shape, TensorInfo};

    fn small_network(rng: &mut impl Rng) -> Network {
        let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
        let input = TensorInfo::new(1, 4, 4).unwrap();
        let conv = ConvolutionLayer::new(
            input,
            ConvInfo::same(3).unwrap(),
            2,
            Activation::ReLU,
            backend,
            rng,
        )
        .unwrap();
        let dense = DenseLayer::new(conv.output(), 3, Activation::Sigmoid, rng).unwrap();
        Network::new(vec![Box::new(conv), Box::new(dense)], Cost::Quadratic).unwrap()
    }

    #[test]
    fn mismatched_chain_is_rejected() {
        let mut rng = rand::rng();
        let a = DenseLayer::new(TensorInfo::linear(4).unwrap(), 3, Activation::Sigmoid, &mut rng)
            .unwrap();
        let b = DenseLayer::new(TensorInfo::linear(5).unwrap(), 2, Activation::Sigmoid, &mut rng)
            .unwrap();
        let err = Network::new(vec![Box::new(a), Box::new(b)], Cost::Quadratic).unwrap_err();
        assert_eq!(err, NnError::ShapeMismatch { expected: 5, got: 3 });
    }

    #[test]
    fn forward_keeps_row_count() {
        let mut rng = rand::rng();
        let mut net = small_network(&mut rng);
        let x = Tensor::new(Shape::new(5, net.input()).unwrap());
        let out = net.forward(x.view()).unwrap();
        assert_eq!(out.entities(), 5);
        assert_eq!(out.info(), net.output());
    }

    #[test]
    fn quadratic_cost_of_exact_prediction_is_zero() {
        let y = Tensor::from_vec(Shape::matrix(1, 2).unwrap(), vec![0.25, 0.75]).unwrap();
        assert_eq!(Cost::Quadratic.cost(y.view(), y.view()).unwrap(), 0.0);
        let a = Tensor::from_vec(Shape::matrix(1, 2).unwrap(), vec![0.25, 1.75]).unwrap();
        assert!((Cost::Quadratic.cost(a.view(), y.view()).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_delta_skips_activation_derivative() {
        let shape = Shape::matrix(1, 2).unwrap();
        let a = Tensor::from_vec(shape, vec![0.8, 0.3]).unwrap();
        let y = Tensor::from_vec(shape, vec![1.0, 0.0]).unwrap();
        let z = Tensor::from_vec(shape, vec![1.5, -0.9]).unwrap();
        let delta = Cost::CrossEntropy
            .delta(a.view(), y.view(), z.view(), Activation::Sigmoid)
            .unwrap();
        assert!((delta.data()[0] - -0.2).abs() < 1e-6);
        assert!((delta.data()[1] - 0.3).abs() < 1e-6);
    }
}
