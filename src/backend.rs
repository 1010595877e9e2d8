use std::fmt::Debug;

use crate::activation::Activation;
use crate::error::{NnError, Result};
use crate::tensor::{Tensor, TensorInfo, TensorView};

/// Geometry of a convolution: square kernel, symmetric zero padding, uniform
/// stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvInfo {
    pub kernel: usize,
    pub padding: usize,
    pub stride: usize,
}

impl ConvInfo {
    pub fn new(kernel: usize, padding: usize, stride: usize) -> Result<Self> {
        if kernel == 0 {
            return Err(NnError::InvalidConfiguration { field: "kernel" });
        }
        if stride == 0 {
            return Err(NnError::InvalidConfiguration { field: "stride" });
        }
        Ok(Self {
            kernel,
            padding,
            stride,
        })
    }

    /// Stride-1 convolution padded to keep spatial dimensions (odd kernels).
    pub fn same(kernel: usize) -> Result<Self> {
        Self::new(kernel, (kernel.max(1) - 1) / 2, 1)
    }

    pub fn output_dim(&self, input: usize) -> usize {
        (input + 2 * self.padding - self.kernel) / self.stride + 1
    }

    pub fn output_info(&self, input: TensorInfo, kernels: usize) -> Result<TensorInfo> {
        TensorInfo::new(
            kernels,
            self.output_dim(input.height),
            self.output_dim(input.width),
        )
    }

    /// Filter buffer length for `kernels` output channels.
    pub fn weight_len(&self, in_channels: usize, kernels: usize) -> usize {
        kernels * in_channels * self.kernel * self.kernel
    }
}

/// Geometry of a max-pooling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub window: usize,
    pub padding: usize,
    pub stride: usize,
}

impl PoolInfo {
    pub fn new(window: usize, padding: usize, stride: usize) -> Result<Self> {
        if window == 0 {
            return Err(NnError::InvalidConfiguration { field: "window" });
        }
        if stride == 0 {
            return Err(NnError::InvalidConfiguration { field: "stride" });
        }
        if padding >= window {
            // A window must always overlap at least one input cell.
            return Err(NnError::InvalidConfiguration { field: "padding" });
        }
        Ok(Self {
            window,
            padding,
            stride,
        })
    }

    pub fn output_dim(&self, input: usize) -> usize {
        (input + 2 * self.padding - self.window) / self.stride + 1
    }

    pub fn output_info(&self, input: TensorInfo) -> Result<TensorInfo> {
        TensorInfo::new(
            input.channels,
            self.output_dim(input.height),
            self.output_dim(input.width),
        )
    }
}

/// Executor of the primitive numeric kernels.
///
/// Every call is synchronous and deterministic given identical inputs. Shape
/// contracts are validated up front and violations surface as
/// [`NnError::ShapeMismatch`]; an accelerator implementation that fails to
/// allocate device memory reports [`NnError::BackendResourceExhaustion`],
/// which is fatal for the current pass and never retried here.
///
/// Constructed once and passed explicitly into every layer that needs it.
pub trait Backend: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Cross-correlation of `x` with `kernels` filters taken from `w`,
    /// overwriting `y`. Filter layout is `[kernel][channel][ky][kx]`.
    fn conv_forward(
        &self,
        x: TensorView,
        w: &[f32],
        kernels: usize,
        conv: ConvInfo,
        y: &mut Tensor,
    ) -> Result<()>;

    /// Adjoint of `conv_forward` with respect to the input; **accumulates**
    /// into `dx` so parallel-branch contributions can be summed.
    fn conv_backward_data(
        &self,
        dy: TensorView,
        w: &[f32],
        conv: ConvInfo,
        dx: &mut Tensor,
    ) -> Result<()>;

    /// Adjoint of `conv_forward` with respect to the filters, overwriting
    /// `dw` (summed over entities and output positions).
    fn conv_backward_filter(
        &self,
        x: TensorView,
        dy: TensorView,
        conv: ConvInfo,
        dw: &mut [f32],
    ) -> Result<()>;

    /// Adds one bias value per output channel.
    fn bias_forward(&self, y: &mut Tensor, b: &[f32]) -> Result<()>;

    /// Per-channel sums of `dy`, overwriting `db`.
    fn bias_backward(&self, dy: TensorView, db: &mut [f32]) -> Result<()>;

    /// Max pooling; window positions hanging over the padding border only
    /// consider in-bounds cells.
    fn pool_forward(&self, x: TensorView, pool: PoolInfo, y: &mut Tensor) -> Result<()>;

    /// Routes each output gradient to the arg-max input position of its
    /// window, recomputed from the original input `x`; **accumulates** into
    /// `dx`.
    fn pool_backward(
        &self,
        x: TensorView,
        dy: TensorView,
        pool: PoolInfo,
        dx: &mut Tensor,
    ) -> Result<()>;

    /// `a = phi(z)`, elementwise.
    fn activation_forward(&self, z: &[f32], a: &mut [f32], phi: Activation) -> Result<()>;

    /// `d *= phi'(z)`, elementwise.
    fn activation_backward(&self, z: &[f32], d: &mut [f32], phi: Activation) -> Result<()>;
}

/// Reference implementation running every kernel on the host CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(NnError::ShapeMismatch { expected, got });
    }
    Ok(())
}

fn check_conv_io(
    x: TensorView,
    w: &[f32],
    kernels: usize,
    conv: ConvInfo,
    y_shape: (usize, TensorInfo),
) -> Result<()> {
    let expected = conv.output_info(x.info(), kernels)?;
    if y_shape.0 != x.entities() || y_shape.1 != expected {
        return Err(NnError::ShapeMismatch {
            expected: x.entities() * expected.len(),
            got: y_shape.0 * y_shape.1.len(),
        });
    }
    check_len(conv.weight_len(x.info().channels, kernels), w.len())
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn conv_forward(
        &self,
        x: TensorView,
        w: &[f32],
        kernels: usize,
        conv: ConvInfo,
        y: &mut Tensor,
    ) -> Result<()> {
        check_conv_io(x, w, kernels, conv, (y.entities(), y.info()))?;
        let info = x.info();
        let (ih, iw, in_c) = (info.height, info.width, info.channels);
        let out = y.info();
        let (oh, ow) = (out.height, out.width);
        let k = conv.kernel;
        let p = conv.padding as isize;
        let s = conv.stride;
        for e in 0..x.entities() {
            let xs = x.sample(e);
            let ys = y.sample_mut(e);
            for oc in 0..kernels {
                let w_base = oc * in_c * k * k;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = 0.0f32;
                        for ic in 0..in_c {
                            let plane = &xs[ic * ih * iw..][..ih * iw];
                            let filter = &w[w_base + ic * k * k..][..k * k];
                            for ky in 0..k {
                                let iy = (oy * s + ky) as isize - p;
                                if iy < 0 || iy >= ih as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = (ox * s + kx) as isize - p;
                                    if ix < 0 || ix >= iw as isize {
                                        continue;
                                    }
                                    acc += filter[ky * k + kx]
                                        * plane[iy as usize * iw + ix as usize];
                                }
                            }
                        }
                        ys[oc * oh * ow + oy * ow + ox] = acc;
                    }
                }
            }
        }
        Ok(())
    }

    fn conv_backward_data(
        &self,
        dy: TensorView,
        w: &[f32],
        conv: ConvInfo,
        dx: &mut Tensor,
    ) -> Result<()> {
        let kernels = dy.info().channels;
        check_conv_io(dx.view(), w, kernels, conv, (dy.entities(), dy.info()))?;
        let info = dx.info();
        let (ih, iw, in_c) = (info.height, info.width, info.channels);
        let out = dy.info();
        let (oh, ow) = (out.height, out.width);
        let k = conv.kernel;
        let p = conv.padding as isize;
        let s = conv.stride;
        for e in 0..dy.entities() {
            let dys = dy.sample(e);
            let dxs = dx.sample_mut(e);
            for oc in 0..kernels {
                let w_base = oc * in_c * k * k;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = dys[oc * oh * ow + oy * ow + ox];
                        if g == 0.0 {
                            continue;
                        }
                        for ic in 0..in_c {
                            let filter = &w[w_base + ic * k * k..][..k * k];
                            for ky in 0..k {
                                let iy = (oy * s + ky) as isize - p;
                                if iy < 0 || iy >= ih as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = (ox * s + kx) as isize - p;
                                    if ix < 0 || ix >= iw as isize {
                                        continue;
                                    }
                                    dxs[ic * ih * iw + iy as usize * iw + ix as usize] +=
                                        filter[ky * k + kx] * g;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn conv_backward_filter(
        &self,
        x: TensorView,
        dy: TensorView,
        conv: ConvInfo,
        dw: &mut [f32],
    ) -> Result<()> {
        let kernels = dy.info().channels;
        check_conv_io(x, dw, kernels, conv, (dy.entities(), dy.info()))?;
        dw.fill(0.0);
        let info = x.info();
        let (ih, iw, in_c) = (info.height, info.width, info.channels);
        let out = dy.info();
        let (oh, ow) = (out.height, out.width);
        let k = conv.kernel;
        let p = conv.padding as isize;
        let s = conv.stride;
        for e in 0..x.entities() {
            let xs = x.sample(e);
            let dys = dy.sample(e);
            for oc in 0..kernels {
                let w_base = oc * in_c * k * k;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = dys[oc * oh * ow + oy * ow + ox];
                        if g == 0.0 {
                            continue;
                        }
                        for ic in 0..in_c {
                            let plane = &xs[ic * ih * iw..][..ih * iw];
                            let filter = &mut dw[w_base + ic * k * k..][..k * k];
                            for ky in 0..k {
                                let iy = (oy * s + ky) as isize - p;
                                if iy < 0 || iy >= ih as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = (ox * s + kx) as isize - p;
                                    if ix < 0 || ix >= iw as isize {
                                        continue;
                                    }
                                    filter[ky * k + kx] +=
                                        g * plane[iy as usize * iw + ix as usize];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn bias_forward(&self, y: &mut Tensor, b: &[f32]) -> Result<()> {
        let info = y.info();
        check_len(info.channels, b.len())?;
        let plane = info.slice_len();
        for e in 0..y.entities() {
            let ys = y.sample_mut(e);
            for (c, &bias) in b.iter().enumerate() {
                for v in &mut ys[c * plane..(c + 1) * plane] {
                    *v += bias;
                }
            }
        }
        Ok(())
    }

    fn bias_backward(&self, dy: TensorView, db: &mut [f32]) -> Result<()> {
        let info = dy.info();
        check_len(info.channels, db.len())?;
        db.fill(0.0);
        let plane = info.slice_len();
        for e in 0..dy.entities() {
            let dys = dy.sample(e);
            for (c, grad) in db.iter_mut().enumerate() {
                *grad += dys[c * plane..(c + 1) * plane].iter().sum::<f32>();
            }
        }
        Ok(())
    }

    fn pool_forward(&self, x: TensorView, pool: PoolInfo, y: &mut Tensor) -> Result<()> {
        let expected = pool.output_info(x.info())?;
        if y.entities() != x.entities() || y.info() != expected {
            return Err(NnError::ShapeMismatch {
                expected: x.entities() * expected.len(),
                got: y.len(),
            });
        }
        let info = x.info();
        let (ih, iw) = (info.height, info.width);
        let (oh, ow) = (expected.height, expected.width);
        let win = pool.window;
        let p = pool.padding as isize;
        let s = pool.stride;
        for e in 0..x.entities() {
            let xs = x.sample(e);
            let ys = y.sample_mut(e);
            for c in 0..info.channels {
                let plane = &xs[c * ih * iw..][..ih * iw];
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        for wy in 0..win {
                            let iy = (oy * s + wy) as isize - p;
                            if iy < 0 || iy >= ih as isize {
                                continue;
                            }
                            for wx in 0..win {
                                let ix = (ox * s + wx) as isize - p;
                                if ix < 0 || ix >= iw as isize {
                                    continue;
                                }
                                best = best.max(plane[iy as usize * iw + ix as usize]);
                            }
                        }
                        ys[c * oh * ow + oy * ow + ox] = best;
                    }
                }
            }
        }
        Ok(())
    }

    fn pool_backward(
        &self,
        x: TensorView,
        dy: TensorView,
        pool: PoolInfo,
        dx: &mut Tensor,
    ) -> Result<()> {
        let expected = pool.output_info(x.info())?;
        if dy.entities() != x.entities()
            || dy.info() != expected
            || dx.shape() != x.shape()
        {
            return Err(NnError::ShapeMismatch {
                expected: x.entities() * expected.len(),
                got: dy.entities() * dy.info().len(),
            });
        }
        let info = x.info();
        let (ih, iw) = (info.height, info.width);
        let (oh, ow) = (expected.height, expected.width);
        let win = pool.window;
        let p = pool.padding as isize;
        let s = pool.stride;
        for e in 0..x.entities() {
            let xs = x.sample(e);
            let dys = dy.sample(e);
            let dxs = dx.sample_mut(e);
            for c in 0..info.channels {
                let plane = &xs[c * ih * iw..][..ih * iw];
                for oy in 0..oh {
                    for ox in 0..ow {
                        // Same traversal order as pool_forward, so the
                        // arg-max picked here is the cell that produced the
                        // forward output.
                        let mut best = f32::NEG_INFINITY;
                        let mut best_at = 0usize;
                        for wy in 0..win {
                            let iy = (oy * s + wy) as isize - p;
                            if iy < 0 || iy >= ih as isize {
                                continue;
                            }
                            for wx in 0..win {
                                let ix = (ox * s + wx) as isize - p;
                                if ix < 0 || ix >= iw as isize {
                                    continue;
                                }
                                let at = iy as usize * iw + ix as usize;
                                if plane[at] > best {
                                    best = plane[at];
                                    best_at = at;
                                }
                            }
                        }
                        dxs[c * ih * iw + best_at] += dys[c * oh * ow + oy * ow + ox];
                    }
                }
            }
        }
        Ok(())
    }

    fn activation_forward(&self, z: &[f32], a: &mut [f32], phi: Activation) -> Result<()> {
        check_len(z.len(), a.len())?;
        phi.apply_slice(z, a);
        Ok(())
    }

    fn activation_backward(&self, z: &[f32], d: &mut [f32], phi: Activation) -> Result<()> {
        check_len(z.len(), d.len())?;
        phi.deriv_slice(z, d);
        Ok(())
    }
}
