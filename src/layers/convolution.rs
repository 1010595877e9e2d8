use std::io::{self, Read, Write};
use std::sync::Arc;

use rand::Rng;

use crate::activation::Activation;
use crate::backend::{Backend, ConvInfo};
use crate::error::{NnError, Result};
use crate::layer::{self, Gradients, Layer, LayerKind};
use crate::layers::xavier_fill;
use crate::serialize;
use crate::tensor::{Shape, Tensor, TensorInfo, TensorView};

/// Standalone convolution layer: one bank of square filters plus a
/// per-kernel bias, dispatched onto the backend.
#[derive(Debug, Clone)]
pub struct ConvolutionLayer {
    input: TensorInfo,
    output: TensorInfo,
    conv: ConvInfo,
    weights: Box<[f32]>,
    biases: Box<[f32]>,
    phi: Activation,
    backend: Arc<dyn Backend>,
    cached_entities: usize,
}

impl ConvolutionLayer {
    pub fn new(
        input: TensorInfo,
        conv: ConvInfo,
        kernels: usize,
        phi: Activation,
        backend: Arc<dyn Backend>,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if kernels == 0 {
            return Err(NnError::InvalidConfiguration { field: "kernels" });
        }
        let output = conv.output_info(input, kernels)?;
        let mut weights = bytemuck::zeroed_slice_box(conv.weight_len(input.channels, kernels));
        let field = conv.kernel * conv.kernel;
        xavier_fill(rng, &mut weights, input.channels * field, kernels * field);
        log::debug!("convolution layer {input} -> {output}, kernel {}", conv.kernel);
        Ok(Self {
            input,
            output,
            conv,
            weights,
            biases: bytemuck::zeroed_slice_box(kernels),
            phi,
            backend,
            cached_entities: 0,
        })
    }

    pub fn conv_info(&self) -> ConvInfo {
        self.conv
    }

    pub fn deserialize(r: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Self> {
        let (input, output, phi) = layer::read_header(r)?;
        let wlen = serialize::read_u32(r)? as usize;
        let weights = serialize::read_f32s(r, wlen)?;
        let blen = serialize::read_u32(r)? as usize;
        let biases = serialize::read_f32s(r, blen)?;
        let conv = ConvInfo::new(
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
        )
        .ok()?;
        let kernels = output.channels;
        if conv.output_info(input, kernels).ok()? != output
            || weights.len() != conv.weight_len(input.channels, kernels)
            || biases.len() != kernels
        {
            return None;
        }
        Some(Self {
            input,
            output,
            conv,
            weights: weights.into_boxed_slice(),
            biases: biases.into_boxed_slice(),
            phi,
            backend: Arc::clone(backend),
            cached_entities: 0,
        })
    }

    fn check_cache(&self, entities: usize) -> Result<()> {
        if self.cached_entities != entities {
            return Err(NnError::StaleState {
                cached: self.cached_entities,
                got: entities,
            });
        }
        Ok(())
    }
}

impl Layer for ConvolutionLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
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
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    fn biases(&self) -> &[f32] {
        &self.biases
    }

    fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    fn forward(&mut self, x: TensorView) -> Result<(Tensor, Tensor)> {
        let mut z = Tensor::new(Shape::new(x.entities(), self.output)?);
        self.backend
            .conv_forward(x, &self.weights, self.output.channels, self.conv, &mut z)?;
        self.backend.bias_forward(&mut z, &self.biases)?;
        let mut a = Tensor::like(&z);
        self.backend.activation_forward(z.data(), a.data_mut(), self.phi)?;
        self.cached_entities = x.entities();
        Ok((z, a))
    }

    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor> {
        self.check_cache(delta.entities())?;
        let mut dx = Tensor::new(Shape::new(delta.entities(), self.input)?);
        self.backend
            .conv_backward_data(delta, &self.weights, self.conv, &mut dx)?;
        self.backend
            .activation_backward(z_prev.data(), dx.data_mut(), phi_prev)?;
        Ok(dx)
    }

    fn compute_gradient(
        &self,
        a_prev: TensorView,
        delta: TensorView,
    ) -> Result<Option<Gradients>> {
        self.check_cache(delta.entities())?;
        let mut dw: Box<[f32]> = bytemuck::zeroed_slice_box(self.weights.len());
        self.backend
            .conv_backward_filter(a_prev, delta, self.conv, &mut dw)?;
        let mut db: Box<[f32]> = bytemuck::zeroed_slice_box(self.biases.len());
        self.backend.bias_backward(delta, &mut db)?;
        Ok(Some(Gradients { dw, db }))
    }

    fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        layer::write_header(w, self.input, self.output, self.phi)?;
        serialize::write_u32(w, self.weights.len() as u32)?;
        serialize::write_f32s(w, &self.weights)?;
        serialize::write_u32(w, self.biases.len() as u32)?;
        serialize::write_f32s(w, &self.biases)?;
        serialize::write_u32(w, self.conv.kernel as u32)?;
        serialize::write_u32(w, self.conv.padding as u32)?;
        serialize::write_u32(w, self.conv.stride as u32)
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        let mut copy = self.clone();
        copy.cached_entities = 0;
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
    fn forward_backward_preserve_declared_shapes() {
        let input = TensorInfo::new(2, 5, 5).unwrap();
        let mut layer = ConvolutionLayer::new(
            input,
            ConvInfo::same(3).unwrap(),
            4,
            Activation::ReLU,
            backend(),
            &mut rand::rng(),
        )
        .unwrap();
        assert_eq!(layer.output(), TensorInfo::new(4, 5, 5).unwrap());

        let x = Tensor::new(Shape::new(3, input).unwrap());
        let (z, a) = layer.forward(x.view()).unwrap();
        assert_eq!(z.shape(), Shape::new(3, layer.output()).unwrap());
        assert_eq!(a.shape(), z.shape());

        let delta = Tensor::new(z.shape());
        let dx = layer
            .backward(delta.view(), x.view(), Activation::Identity)
            .unwrap();
        assert_eq!(dx.shape(), x.shape());

        let grads = layer
            .compute_gradient(x.view(), delta.view())
            .unwrap()
            .unwrap();
        assert_eq!(grads.dw.len(), layer.weights().len());
        assert_eq!(grads.db.len(), layer.biases().len());
    }

    #[test]
    fn stale_cache_is_rejected() {
        let input = TensorInfo::new(1, 3, 3).unwrap();
        let mut layer = ConvolutionLayer::new(
            input,
            ConvInfo::same(3).unwrap(),
            2,
            Activation::Identity,
            backend(),
            &mut rand::rng(),
        )
        .unwrap();
        let x = Tensor::new(Shape::new(2, input).unwrap());
        layer.forward(x.view()).unwrap();
        let delta = Tensor::new(Shape::new(5, layer.output()).unwrap());
        let z_prev = Tensor::new(Shape::new(5, input).unwrap());
        let err = layer
            .backward(delta.view(), z_prev.view(), Activation::Identity)
            .unwrap_err();
        assert_eq!(err, NnError::StaleState { cached: 2, got: 5 });
    }

    #[test]
    fn serialization_round_trips() {
        let input = TensorInfo::new(2, 4, 4).unwrap();
        let layer = ConvolutionLayer::new(
            input,
            ConvInfo::new(3, 1, 1).unwrap(),
            3,
            Activation::LeakyReLU,
            backend(),
            &mut rand::rng(),
        )
        .unwrap();
        let mut buf = Vec::new();
        layer.serialize(&mut buf).unwrap();
        let back = ConvolutionLayer::deserialize(&mut buf.as_slice(), &backend()).unwrap();
        assert_eq!(back.weights(), layer.weights());
        assert_eq!(back.conv_info(), layer.conv_info());
        assert_eq!(back.activation(), layer.activation());
    }
}
