use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::activation::Activation;
use crate::backend::{Backend, PoolInfo};
use crate::error::{NnError, Result};
use crate::layer::{self, Gradients, Layer, LayerKind};
use crate::serialize;
use crate::tensor::{Shape, Tensor, TensorInfo, TensorView};

/// Weightless max-pooling layer.
///
/// The forward input is duplicated into the layer so Backward can recompute
/// each window's arg-max and route the gradient to exactly that position.
#[derive(Debug, Clone)]
pub struct PoolingLayer {
    input: TensorInfo,
    output: TensorInfo,
    pool: PoolInfo,
    phi: Activation,
    backend: Arc<dyn Backend>,
    cached_input: Option<Tensor>,
}

impl PoolingLayer {
    pub fn new(
        input: TensorInfo,
        pool: PoolInfo,
        phi: Activation,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let output = pool.output_info(input)?;
        log::debug!("pooling layer {input} -> {output}, window {}", pool.window);
        Ok(Self {
            input,
            output,
            pool,
            phi,
            backend,
            cached_input: None,
        })
    }

    pub fn pool_info(&self) -> PoolInfo {
        self.pool
    }

    pub fn deserialize(r: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Self> {
        let (input, output, phi) = layer::read_header(r)?;
        if serialize::read_u32(r)? != 0 || serialize::read_u32(r)? != 0 {
            return None;
        }
        let pool = PoolInfo::new(
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
        )
        .ok()?;
        if pool.output_info(input).ok()? != output {
            return None;
        }
        Some(Self {
            input,
            output,
            pool,
            phi,
            backend: Arc::clone(backend),
            cached_input: None,
        })
    }

    fn cached(&self, entities: usize) -> Result<&Tensor> {
        match &self.cached_input {
            Some(x) if x.entities() == entities => Ok(x),
            Some(x) => Err(NnError::StaleState {
                cached: x.entities(),
                got: entities,
            }),
            None => Err(NnError::StaleState {
                cached: 0,
                got: entities,
            }),
        }
    }
}

impl Layer for PoolingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn input(&self) -> TensorInfo {
        self.input
    }

    fn output(&self) -> TensorInfo {
        self.output
    }

    fn activation(&self) -> Activation {
        self.phi
    }

    fn weights(&self) -> &[f32] {
        &[]
    }

    fn weights_mut(&mut self) -> &mut [f32] {
        &mut []
    }

    fn biases(&self) -> &[f32] {
        &[]
    }

    fn biases_mut(&mut self) -> &mut [f32] {
        &mut []
    }

    fn forward(&mut self, x: TensorView) -> Result<(Tensor, Tensor)> {
        let mut z = Tensor::new(Shape::new(x.entities(), self.output)?);
        self.backend.pool_forward(x, self.pool, &mut z)?;
        let mut a = Tensor::like(&z);
        self.backend.activation_forward(z.data(), a.data_mut(), self.phi)?;
        self.cached_input = Some(x.to_owned());
        Ok((z, a))
    }

    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor> {
        let x = self.cached(delta.entities())?;
        let mut dx = Tensor::new(Shape::new(delta.entities(), self.input)?);
        self.backend.pool_backward(x.view(), delta, self.pool, &mut dx)?;
        self.backend
            .activation_backward(z_prev.data(), dx.data_mut(), phi_prev)?;
        Ok(dx)
    }

    fn compute_gradient(
        &self,
        _a_prev: TensorView,
        delta: TensorView,
    ) -> Result<Option<Gradients>> {
        self.cached(delta.entities())?;
        Ok(None)
    }

    fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        layer::write_header(w, self.input, self.output, self.phi)?;
        // Weightless: zero-length buffers keep the common framing.
        serialize::write_u32(w, 0)?;
        serialize::write_u32(w, 0)?;
        serialize::write_u32(w, self.pool.window as u32)?;
        serialize::write_u32(w, self.pool.padding as u32)?;
        serialize::write_u32(w, self.pool.stride as u32)
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        let mut copy = self.clone();
        copy.cached_input = None;
        Box::new(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::new())
    }

    #[test]
    fn halves_spatial_dimensions() {
        let input = TensorInfo::new(2, 4, 4).unwrap();
        let mut layer = PoolingLayer::new(
            input,
            PoolInfo::new(2, 0, 2).unwrap(),
            Activation::Identity,
            backend(),
        )
        .unwrap();
        assert_eq!(layer.output(), TensorInfo::new(2, 2, 2).unwrap());
        let x = Tensor::new(Shape::new(2, input).unwrap());
        let (z, a) = layer.forward(x.view()).unwrap();
        assert_eq!(z.shape(), Shape::new(2, layer.output()).unwrap());
        assert_eq!(a.shape(), z.shape());
    }

    #[test]
    fn backward_without_forward_is_stale() {
        let input = TensorInfo::new(1, 4, 4).unwrap();
        let mut layer = PoolingLayer::new(
            input,
            PoolInfo::new(2, 0, 2).unwrap(),
            Activation::Identity,
            backend(),
        )
        .unwrap();
        let delta = Tensor::new(Shape::new(1, layer.output()).unwrap());
        let z_prev = Tensor::new(Shape::new(1, input).unwrap());
        let err = layer
            .backward(delta.view(), z_prev.view(), Activation::Identity)
            .unwrap_err();
        assert_eq!(err, NnError::StaleState { cached: 0, got: 1 });
    }

    #[test]
    fn compute_gradient_is_none_for_weightless_layer() {
        let input = TensorInfo::new(1, 4, 4).unwrap();
        let mut layer = PoolingLayer::new(
            input,
            PoolInfo::new(2, 0, 2).unwrap(),
            Activation::Identity,
            backend(),
        )
        .unwrap();
        let x = Tensor::new(Shape::new(1, input).unwrap());
        layer.forward(x.view()).unwrap();
        let delta = Tensor::new(Shape::new(1, layer.output()).unwrap());
        assert_eq!(
            layer.compute_gradient(x.view(), delta.view()).unwrap(),
            None
        );
    }

    #[test]
    fn serialization_round_trips() {
        let input = TensorInfo::new(3, 6, 6).unwrap();
        let layer = PoolingLayer::new(
            input,
            PoolInfo::new(3, 1, 1).unwrap(),
            Activation::Sigmoid,
            backend(),
        )
        .unwrap();
        let mut buf = Vec::new();
        layer.serialize(&mut buf).unwrap();
        let back = PoolingLayer::deserialize(&mut buf.as_slice(), &backend()).unwrap();
        assert_eq!(back.pool_info(), layer.pool_info());
        assert_eq!(back.output(), layer.output());
    }
}
