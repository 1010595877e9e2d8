use std::io::{self, Read, Write};

use faer::linalg::matmul::matmul;
use faer::prelude::*;
use rand::Rng;

use crate::activation::Activation;
use crate::error::{NnError, Result};
use crate::layer::{self, Gradients, Layer, LayerKind};
use crate::layers::xavier_fill;
use crate::serialize;
use crate::tensor::{Shape, Tensor, TensorInfo, TensorView};

/// Fully-connected layer: `z = x W + b`, one row per entity.
///
/// Weights are stored column-major as an `(inputs, neurons)` matrix in one
/// flat buffer, so the whole batch multiplies in a single `faer` matmul.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    input: TensorInfo,
    output: TensorInfo,
    weights: Box<[f32]>,
    biases: Box<[f32]>,
    phi: Activation,
    cached_entities: usize,
}

impl DenseLayer {
    pub fn new(
        input: TensorInfo,
        neurons: usize,
        phi: Activation,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if neurons == 0 {
            return Err(NnError::InvalidConfiguration { field: "neurons" });
        }
        let n_in = input.len();
        let mut weights = bytemuck::zeroed_slice_box(n_in * neurons);
        xavier_fill(rng, &mut weights, n_in, neurons);
        Ok(Self {
            input,
            output: TensorInfo::linear(neurons)?,
            weights,
            biases: bytemuck::zeroed_slice_box(neurons),
            phi,
            cached_entities: 0,
        })
    }

    fn from_parts(
        input: TensorInfo,
        output: TensorInfo,
        phi: Activation,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Option<Self> {
        if output.height != 1 || output.width != 1 {
            return None;
        }
        if weights.len() != input.len() * output.len() || biases.len() != output.len() {
            return None;
        }
        Some(Self {
            input,
            output,
            weights: weights.into_boxed_slice(),
            biases: biases.into_boxed_slice(),
            phi,
            cached_entities: 0,
        })
    }

    pub fn deserialize(r: &mut dyn Read) -> Option<Self> {
        let (input, output, phi) = layer::read_header(r)?;
        let wlen = serialize::read_u32(r)? as usize;
        let weights = serialize::read_f32s(r, wlen)?;
        let blen = serialize::read_u32(r)? as usize;
        let biases = serialize::read_f32s(r, blen)?;
        Self::from_parts(input, output, phi, weights, biases)
    }

    pub(crate) fn reset_cache(&mut self) {
        self.cached_entities = 0;
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

    fn check_input(&self, x: TensorView) -> Result<()> {
        if x.info().len() != self.input.len() {
            return Err(NnError::ShapeMismatch {
                expected: self.input.len(),
                got: x.info().len(),
            });
        }
        Ok(())
    }

    fn check_delta(&self, delta: TensorView) -> Result<()> {
        if delta.info().len() != self.output.len() {
            return Err(NnError::ShapeMismatch {
                expected: self.output.len(),
                got: delta.info().len(),
            });
        }
        Ok(())
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::FullyConnected
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
        self.check_input(x)?;
        let n = x.entities();
        let n_in = self.input.len();
        let n_out = self.output.len();
        let mut z = Tensor::new(Shape::new(n, self.output)?);
        {
            // Row-major (n, n_in) data viewed as column-major (n_in, n),
            // then transposed.
            let x_mat = MatRef::from_column_major_slice(x.data(), n_in, n).transpose();
            let w_mat = MatRef::from_column_major_slice(&self.weights, n_in, n_out);
            let z_mat = MatMut::from_column_major_slice_mut(z.data_mut(), n_out, n);
            // z = x W
            matmul(
                z_mat.transpose_mut(),
                faer::Accum::Replace,
                x_mat,
                w_mat,
                1.0,
                Par::Seq,
            );
        }
        for e in 0..n {
            let row = z.sample_mut(e);
            for (zk, &bk) in row.iter_mut().zip(&self.biases) {
                *zk += bk;
            }
        }
        let mut a = Tensor::like(&z);
        self.phi.apply_slice(z.data(), a.data_mut());
        self.cached_entities = n;
        Ok((z, a))
    }

    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor> {
        let n = delta.entities();
        self.check_cache(n)?;
        self.check_input(z_prev)?;
        self.check_delta(delta)?;
        let n_in = self.input.len();
        let n_out = self.output.len();
        let mut dx = Tensor::new(Shape::new(n, self.input)?);
        {
            let delta_mat = MatRef::from_column_major_slice(delta.data(), n_out, n).transpose();
            let w_mat = MatRef::from_column_major_slice(&self.weights, n_in, n_out);
            let dx_mat = MatMut::from_column_major_slice_mut(dx.data_mut(), n_in, n);
            // dx = delta W^T
            matmul(
                dx_mat.transpose_mut(),
                faer::Accum::Replace,
                delta_mat,
                w_mat.transpose(),
                1.0,
                Par::Seq,
            );
        }
        phi_prev.deriv_slice(z_prev.data(), dx.data_mut());
        Ok(dx)
    }

    fn compute_gradient(
        &self,
        a_prev: TensorView,
        delta: TensorView,
    ) -> Result<Option<Gradients>> {
        let n = delta.entities();
        self.check_cache(n)?;
        self.check_input(a_prev)?;
        self.check_delta(delta)?;
        let n_in = self.input.len();
        let n_out = self.output.len();
        let mut dw: Box<[f32]> = bytemuck::zeroed_slice_box(self.weights.len());
        {
            let a_mat = MatRef::from_column_major_slice(a_prev.data(), n_in, n);
            let delta_mat = MatRef::from_column_major_slice(delta.data(), n_out, n).transpose();
            let dw_mat = MatMut::from_column_major_slice_mut(&mut dw, n_in, n_out);
            // dW = a_prev^T delta, summed over the batch.
            matmul(
                dw_mat,
                faer::Accum::Replace,
                a_mat,
                delta_mat,
                1.0,
                Par::Seq,
            );
        }
        let mut db: Box<[f32]> = bytemuck::zeroed_slice_box(self.biases.len());
        for e in 0..n {
            for (dbk, &dk) in db.iter_mut().zip(delta.sample(e)) {
                *dbk += dk;
            }
        }
        Ok(Some(Gradients { dw, db }))
    }

    fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        layer::write_header(w, self.input, self.output, self.phi)?;
        serialize::write_u32(w, self.weights.len() as u32)?;
        serialize::write_f32s(w, &self.weights)?;
        serialize::write_u32(w, self.biases.len() as u32)?;
        serialize::write_f32s(w, &self.biases)
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        let mut copy = self.clone();
        copy.cached_entities = 0;
        Box::new(copy)
    }
}
