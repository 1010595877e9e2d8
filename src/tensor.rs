use derive_more::Display;

use crate::error::{NnError, Result};

/// Per-sample shape of a tensor, in channel-major (CHW) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{channels}x{height}x{width}")]
pub struct TensorInfo {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorInfo {
    pub fn new(channels: usize, height: usize, width: usize) -> Result<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(NnError::InvalidShape {
                entities: 1,
                channels,
                height,
                width,
            });
        }
        Ok(Self {
            channels,
            height,
            width,
        })
    }

    /// 1-D form, used by fully-connected layers.
    pub fn linear(len: usize) -> Result<Self> {
        Self::new(len, 1, 1)
    }

    /// Number of values in one sample.
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of values in one channel plane.
    pub fn slice_len(&self) -> usize {
        self.height * self.width
    }
}

/// Full shape of a tensor: a batch of `entities` samples.
///
/// The 2-D matrix form `(rows, cols)` is the degenerate case
/// `(rows, cols x 1 x 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{entities}x{info}")]
pub struct Shape {
    pub entities: usize,
    pub info: TensorInfo,
}

impl Shape {
    pub fn new(entities: usize, info: TensorInfo) -> Result<Self> {
        if entities == 0 {
            return Err(NnError::InvalidShape {
                entities,
                channels: info.channels,
                height: info.height,
                width: info.width,
            });
        }
        Ok(Self { entities, info })
    }

    pub fn of(entities: usize, channels: usize, height: usize, width: usize) -> Result<Self> {
        Self::new(entities, TensorInfo::new(channels, height, width)?)
    }

    /// Degenerate 2-D matrix shape.
    pub fn matrix(rows: usize, cols: usize) -> Result<Self> {
        Self::new(rows, TensorInfo::linear(cols)?)
    }

    /// Total number of values.
    pub fn len(&self) -> usize {
        self.entities * self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Owning, shape-tagged, contiguous `f32` buffer.
///
/// Invariant: `data.len() == shape.len()`. The buffer is freed exactly once,
/// on drop. For a non-owning reshape of existing memory see [`TensorView`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Box<[f32]>,
}

impl Tensor {
    /// A zero-filled tensor of the given shape.
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            data: bytemuck::zeroed_slice_box(shape.len()),
        }
    }

    /// A zero-filled tensor with the same shape as `other`.
    pub fn like(other: &Tensor) -> Self {
        Self::new(other.shape)
    }

    /// Takes ownership of `data`, validating it against `shape`.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(NnError::ShapeMismatch {
                expected: shape.len(),
                got: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: data.into_boxed_slice(),
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn entities(&self) -> usize {
        self.shape.entities
    }

    pub fn info(&self) -> TensorInfo {
        self.shape.info
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// An owning copy; the original stays valid.
    pub fn duplicate(&self) -> Tensor {
        self.clone()
    }

    /// Borrowed view of the whole tensor.
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            shape: self.shape,
            data: &self.data,
        }
    }

    /// The values of sample `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= entities`.
    pub fn sample(&self, i: usize) -> &[f32] {
        let len = self.shape.info.len();
        &self.data[i * len..(i + 1) * len]
    }

    pub fn sample_mut(&mut self, i: usize) -> &mut [f32] {
        let len = self.shape.info.len();
        &mut self.data[i * len..(i + 1) * len]
    }

    /// Copies `src` into this tensor's channel range starting at
    /// `channel_offset`, entity by entity. Used to merge branch outputs into
    /// a concatenated tensor.
    pub fn write_channels(&mut self, src: &Tensor, channel_offset: usize) -> Result<()> {
        let dst_info = self.shape.info;
        let src_info = src.shape.info;
        let compatible = src.shape.entities == self.shape.entities
            && src_info.slice_len() == dst_info.slice_len()
            && channel_offset + src_info.channels <= dst_info.channels;
        if !compatible {
            return Err(NnError::ShapeMismatch {
                expected: dst_info.len(),
                got: src_info.len(),
            });
        }
        let plane = dst_info.slice_len();
        for e in 0..self.shape.entities {
            let dst = &mut self.sample_mut(e)
                [channel_offset * plane..(channel_offset + src_info.channels) * plane];
            dst.copy_from_slice(src.sample(e));
        }
        Ok(())
    }

    /// The inverse of [`Tensor::write_channels`]: extracts `channels`
    /// channel planes starting at `channel_offset` into an owned tensor.
    pub fn extract_channels(&self, channel_offset: usize, channels: usize) -> Result<Tensor> {
        self.view().extract_channels(channel_offset, channels)
    }
}

/// Borrowed, bounds-checked reshape of existing memory.
///
/// A view never frees its buffer; dropping it is a no-op borrow release.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    shape: Shape,
    data: &'a [f32],
}

impl<'a> TensorView<'a> {
    /// Reinterprets `data` as a tensor of the given shape.
    pub fn reshape(data: &'a [f32], shape: Shape) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(NnError::ShapeMismatch {
                expected: shape.len(),
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn entities(&self) -> usize {
        self.shape.entities
    }

    pub fn info(&self) -> TensorInfo {
        self.shape.info
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// The values of sample `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= entities`.
    pub fn sample(&self, i: usize) -> &'a [f32] {
        let len = self.shape.info.len();
        &self.data[i * len..(i + 1) * len]
    }

    /// Extracts `channels` channel planes starting at `channel_offset` into
    /// an owned tensor. See [`Tensor::extract_channels`].
    pub fn extract_channels(&self, channel_offset: usize, channels: usize) -> Result<Tensor> {
        let info = self.shape.info;
        if channels == 0 || channel_offset + channels > info.channels {
            return Err(NnError::ShapeMismatch {
                expected: info.channels,
                got: channel_offset + channels,
            });
        }
        let out_info = TensorInfo::new(channels, info.height, info.width)?;
        let mut out = Tensor::new(Shape::new(self.shape.entities, out_info)?);
        let plane = info.slice_len();
        for e in 0..self.shape.entities {
            let src =
                &self.sample(e)[channel_offset * plane..(channel_offset + channels) * plane];
            out.sample_mut(e).copy_from_slice(src);
        }
        Ok(out)
    }

    /// Owning copy of the viewed memory.
    pub fn to_owned(&self) -> Tensor {
        Tensor {
            shape: self.shape,
            data: self.data.into(),
        }
    }
}
