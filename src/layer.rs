use std::fmt::Debug;
use std::io::{self, Read, Write};
use std::sync::Arc;

use derive_more::Display;

use crate::activation::Activation;
use crate::backend::Backend;
use crate::error::Result;
use crate::layers::{ConvolutionLayer, DenseLayer, InceptionLayer, OutputLayer, PoolingLayer};
use crate::serialize;
use crate::tensor::{Tensor, TensorInfo, TensorView};

/// Discriminant of the concrete layer behind a `dyn Layer`, also used as the
/// leading tag of the binary layer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LayerKind {
    FullyConnected,
    Convolution,
    Pooling,
    Inception,
    Output,
}

impl LayerKind {
    pub fn tag(self) -> u8 {
        match self {
            LayerKind::FullyConnected => 0,
            LayerKind::Convolution => 1,
            LayerKind::Pooling => 2,
            LayerKind::Inception => 3,
            LayerKind::Output => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => LayerKind::FullyConnected,
            1 => LayerKind::Convolution,
            2 => LayerKind::Pooling,
            3 => LayerKind::Inception,
            4 => LayerKind::Output,
            _ => return None,
        })
    }
}

/// Weight and bias gradients produced by [`Layer::compute_gradient`], laid
/// out exactly like the layer's own buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub dw: Box<[f32]>,
    pub db: Box<[f32]>,
}

/// The polymorphic layer contract.
///
/// A layer is constructed once with fixed shapes and hyperparameters, then
/// driven repeatedly through `forward` / `backward` / `compute_gradient`.
/// `forward` caches whatever intermediates the other two need for the *same*
/// batch; a new `forward` replaces those caches, and calling `backward` or
/// `compute_gradient` against a missing or mismatched cache fails with
/// [`crate::NnError::StaleState`].
pub trait Layer: Debug + Send + Sync {
    fn kind(&self) -> LayerKind;

    fn input(&self) -> TensorInfo;

    fn output(&self) -> TensorInfo;

    fn activation(&self) -> Activation;

    /// The flat weight buffer; empty for weightless layers.
    fn weights(&self) -> &[f32];

    fn weights_mut(&mut self) -> &mut [f32];

    /// The flat bias buffer; empty for weightless layers.
    fn biases(&self) -> &[f32];

    fn biases_mut(&mut self) -> &mut [f32];

    /// Computes `(z, a)`: the pre-activation and `a = phi(z)`, both newly
    /// owned, with one row per input entity.
    fn forward(&mut self, x: TensorView) -> Result<(Tensor, Tensor)>;

    /// Propagates `delta` (dCost/dz of this layer) through the layer's
    /// linear operation and applies `phi_prev'(z_prev)`, yielding
    /// dCost/dz of the previous layer.
    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor>;

    /// Derives weight and bias gradients from the previous layer's
    /// activations and this layer's `delta`. Weightless layers return
    /// `Ok(None)`.
    fn compute_gradient(&self, a_prev: TensorView, delta: TensorView)
    -> Result<Option<Gradients>>;

    /// Writes the layer body (header, buffers, hyperparameters) to `w`.
    /// The leading [`LayerKind`] tag is written by [`write_layer`].
    fn serialize(&self, w: &mut dyn Write) -> io::Result<()>;

    /// A copy of this layer with fresh (empty) caches.
    fn clone_layer(&self) -> Box<dyn Layer>;
}

pub(crate) fn write_header(
    w: &mut dyn Write,
    input: TensorInfo,
    output: TensorInfo,
    phi: Activation,
) -> io::Result<()> {
    serialize::write_info(w, input)?;
    serialize::write_info(w, output)?;
    serialize::write_u8(w, phi.tag())
}

pub(crate) fn read_header(r: &mut dyn Read) -> Option<(TensorInfo, TensorInfo, Activation)> {
    let input = serialize::read_info(r)?;
    let output = serialize::read_info(r)?;
    let phi = Activation::from_tag(serialize::read_u8(r)?)?;
    Some((input, output, phi))
}

/// Writes `layer` with its kind tag, the inverse of [`read_layer`].
pub fn write_layer(w: &mut dyn Write, layer: &dyn Layer) -> io::Result<()> {
    serialize::write_u8(w, layer.kind().tag())?;
    layer.serialize(w)
}

/// Reads one layer from `r`, dispatching on the kind tag. Returns `None` if
/// the tag is unknown or the body fails to deserialize.
pub fn read_layer(r: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Box<dyn Layer>> {
    let kind = LayerKind::from_tag(serialize::read_u8(r)?)?;
    Some(match kind {
        LayerKind::FullyConnected => Box::new(DenseLayer::deserialize(r)?),
        LayerKind::Convolution => Box::new(ConvolutionLayer::deserialize(r, backend)?),
        LayerKind::Pooling => Box::new(PoolingLayer::deserialize(r, backend)?),
        LayerKind::Inception => Box::new(InceptionLayer::deserialize(r, backend)?),
        LayerKind::Output => Box::new(OutputLayer::deserialize(r)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            LayerKind::FullyConnected,
            LayerKind::Convolution,
            LayerKind::Pooling,
            LayerKind::Inception,
            LayerKind::Output,
        ] {
            assert_eq!(LayerKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(LayerKind::from_tag(9), None);
    }

    #[test]
    fn header_round_trips() {
        let input = TensorInfo::new(3, 8, 8).unwrap();
        let output = TensorInfo::linear(10).unwrap();
        let mut buf = Vec::new();
        write_header(&mut buf, input, output, Activation::Sigmoid).unwrap();
        assert_eq!(
            read_header(&mut buf.as_slice()),
            Some((input, output, Activation::Sigmoid))
        );
        assert_eq!(read_header(&mut buf[..10].as_ref()), None);
    }
}
