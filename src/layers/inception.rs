use std::io::{self, Read, Write};
use std::ops::Range;
use std::sync::Arc;

use derive_more::Display;
use rand::Rng;

use crate::activation::Activation;
use crate::backend::{Backend, ConvInfo, PoolInfo};
use crate::error::{NnError, Result};
use crate::layer::{self, Gradients, Layer, LayerKind};
use crate::layers::xavier_fill;
use crate::serialize;
use crate::tensor::{Shape, Tensor, TensorInfo, TensorView};

const CONV_1X1: ConvInfo = ConvInfo {
    kernel: 1,
    padding: 0,
    stride: 1,
};
const CONV_3X3: ConvInfo = ConvInfo {
    kernel: 3,
    padding: 1,
    stride: 1,
};
const CONV_5X5: ConvInfo = ConvInfo {
    kernel: 5,
    padding: 2,
    stride: 1,
};
const POOL_3X3: PoolInfo = PoolInfo {
    window: 3,
    padding: 1,
    stride: 1,
};

/// Kernel counts of the four pipelines of an inception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(
    "1x1:{primary_1x1} 3x3:{reduce_3x3}>{secondary_3x3} 5x5:{reduce_5x5}>{secondary_5x5} pool:{after_pool_1x1}"
)]
pub struct InceptionInfo {
    pub primary_1x1: usize,
    pub reduce_3x3: usize,
    pub secondary_3x3: usize,
    pub reduce_5x5: usize,
    pub secondary_5x5: usize,
    pub after_pool_1x1: usize,
}

impl InceptionInfo {
    pub fn new(
        primary_1x1: usize,
        reduce_3x3: usize,
        secondary_3x3: usize,
        reduce_5x5: usize,
        secondary_5x5: usize,
        after_pool_1x1: usize,
    ) -> Result<Self> {
        let fields = [
            (primary_1x1, "primary_1x1"),
            (reduce_3x3, "reduce_3x3"),
            (secondary_3x3, "secondary_3x3"),
            (reduce_5x5, "reduce_5x5"),
            (secondary_5x5, "secondary_5x5"),
            (after_pool_1x1, "after_pool_1x1"),
        ];
        for (value, field) in fields {
            if value == 0 {
                return Err(NnError::InvalidConfiguration { field });
            }
        }
        Ok(Self {
            primary_1x1,
            reduce_3x3,
            secondary_3x3,
            reduce_5x5,
            secondary_5x5,
            after_pool_1x1,
        })
    }

    /// Channels of the concatenated output: one slice per pipeline.
    pub fn output_channels(&self) -> usize {
        self.primary_1x1 + self.secondary_3x3 + self.secondary_5x5 + self.after_pool_1x1
    }

    fn as_array(&self) -> [usize; 6] {
        [
            self.primary_1x1,
            self.reduce_3x3,
            self.secondary_3x3,
            self.reduce_5x5,
            self.secondary_5x5,
            self.after_pool_1x1,
        ]
    }
}

fn ranges(sizes: [usize; 6]) -> [Range<usize>; 6] {
    let mut offset = 0;
    sizes.map(|size| {
        let start = offset;
        offset += size;
        start..offset
    })
}

/// Offset table into the shared weight and bias buffers, one contiguous,
/// non-overlapping range per stage.
///
/// Canonical stage order: primary 1x1, 3x3 reduce, 3x3, 5x5 reduce, 5x5,
/// after-pool 1x1 (each reduction precedes its convolution). Computed once
/// at construction; Forward, Backward and ComputeGradient all index through
/// this table and never recompute offsets inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    w: [Range<usize>; 6],
    b: [Range<usize>; 6],
}

impl Partition {
    pub const PRIMARY_1X1: usize = 0;
    pub const REDUCE_3X3: usize = 1;
    pub const SECONDARY_3X3: usize = 2;
    pub const REDUCE_5X5: usize = 3;
    pub const SECONDARY_5X5: usize = 4;
    pub const AFTER_POOL_1X1: usize = 5;

    pub fn new(in_channels: usize, info: InceptionInfo) -> Self {
        let w_sizes = [
            in_channels * info.primary_1x1,
            in_channels * info.reduce_3x3,
            3 * 3 * info.reduce_3x3 * info.secondary_3x3,
            in_channels * info.reduce_5x5,
            5 * 5 * info.reduce_5x5 * info.secondary_5x5,
            in_channels * info.after_pool_1x1,
        ];
        Self {
            w: ranges(w_sizes),
            b: ranges(info.as_array()),
        }
    }

    pub fn weights(&self, stage: usize) -> Range<usize> {
        self.w[stage].clone()
    }

    pub fn biases(&self, stage: usize) -> Range<usize> {
        self.b[stage].clone()
    }

    /// Total weight buffer length; equals the sum of the stage sizes.
    pub fn weight_len(&self) -> usize {
        self.w[Self::AFTER_POOL_1X1].end
    }

    pub fn bias_len(&self) -> usize {
        self.b[Self::AFTER_POOL_1X1].end
    }
}

/// Intermediates of the most recent Forward, plus the reduction deltas the
/// most recent Backward reconstructed for ComputeGradient. The pooling stage
/// is weightless, so its delta is consumed inside Backward and never kept.
#[derive(Debug, Clone)]
struct Cache {
    input: Tensor,
    reduce_3x3_z: Tensor,
    reduce_3x3_a: Tensor,
    reduce_5x5_z: Tensor,
    reduce_5x5_a: Tensor,
    pool_z: Tensor,
    pool_a: Tensor,
    reduce_3x3_delta: Option<Tensor>,
    reduce_5x5_delta: Option<Tensor>,
}

/// Multi-branch composite layer fusing four pipelines over one input:
/// 1x1 convolution, 1x1 reduction + 3x3, 1x1 reduction + 5x5, and
/// 3x3 stride-1 max pooling + 1x1 convolution.
///
/// All pipelines share a single weight buffer and a single bias buffer,
/// partitioned by [`Partition`]; their outputs write disjoint channel slices
/// of one concatenated output tensor. Branches run in parallel; their
/// backward contributions into the shared input gradient are summed, never
/// overwritten.
#[derive(Debug, Clone)]
pub struct InceptionLayer {
    input: TensorInfo,
    output: TensorInfo,
    info: InceptionInfo,
    partition: Partition,
    weights: Box<[f32]>,
    biases: Box<[f32]>,
    phi: Activation,
    backend: Arc<dyn Backend>,
    cache: Option<Cache>,
}

impl InceptionLayer {
    pub fn new(
        input: TensorInfo,
        info: InceptionInfo,
        phi: Activation,
        backend: Arc<dyn Backend>,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let output = TensorInfo::new(info.output_channels(), input.height, input.width)?;
        let partition = Partition::new(input.channels, info);
        let mut weights: Box<[f32]> = bytemuck::zeroed_slice_box(partition.weight_len());
        // fan counts per stage: (in_channels, kernel, kernels)
        let stages = [
            (input.channels, 1, info.primary_1x1),
            (input.channels, 1, info.reduce_3x3),
            (info.reduce_3x3, 3, info.secondary_3x3),
            (input.channels, 1, info.reduce_5x5),
            (info.reduce_5x5, 5, info.secondary_5x5),
            (input.channels, 1, info.after_pool_1x1),
        ];
        for (stage, (in_c, kernel, kernels)) in stages.into_iter().enumerate() {
            let field = kernel * kernel;
            xavier_fill(
                rng,
                &mut weights[partition.weights(stage)],
                in_c * field,
                kernels * field,
            );
        }
        log::debug!("inception layer {input} -> {output} ({info})");
        let biases: Box<[f32]> = bytemuck::zeroed_slice_box(partition.bias_len());
        Ok(Self {
            input,
            output,
            info,
            partition,
            weights,
            biases,
            phi,
            backend,
            cache: None,
        })
    }

    pub fn inception_info(&self) -> InceptionInfo {
        self.info
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn deserialize(r: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Self> {
        let (input, output, phi) = layer::read_header(r)?;
        let wlen = serialize::read_u32(r)? as usize;
        let weights = serialize::read_f32s(r, wlen)?;
        let blen = serialize::read_u32(r)? as usize;
        let biases = serialize::read_f32s(r, blen)?;
        let info = InceptionInfo::new(
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
            serialize::read_u32(r)? as usize,
        )
        .ok()?;
        let partition = Partition::new(input.channels, info);
        let expected_output =
            TensorInfo::new(info.output_channels(), input.height, input.width).ok()?;
        if output != expected_output
            || weights.len() != partition.weight_len()
            || biases.len() != partition.bias_len()
        {
            return None;
        }
        Some(Self {
            input,
            output,
            info,
            partition,
            weights: weights.into_boxed_slice(),
            biases: biases.into_boxed_slice(),
            phi,
            backend: Arc::clone(backend),
            cache: None,
        })
    }

    fn stage_weights(&self, stage: usize) -> &[f32] {
        &self.weights[self.partition.weights(stage)]
    }

    fn stage_biases(&self, stage: usize) -> &[f32] {
        &self.biases[self.partition.biases(stage)]
    }

    /// One convolution stage: conv, bias, activation.
    fn conv_stage(
        &self,
        x: TensorView,
        stage: usize,
        kernels: usize,
        conv: ConvInfo,
    ) -> Result<(Tensor, Tensor)> {
        let out = conv.output_info(x.info(), kernels)?;
        let mut z = Tensor::new(Shape::new(x.entities(), out)?);
        self.backend
            .conv_forward(x, self.stage_weights(stage), kernels, conv, &mut z)?;
        self.backend.bias_forward(&mut z, self.stage_biases(stage))?;
        let mut a = Tensor::like(&z);
        self.backend
            .activation_forward(z.data(), a.data_mut(), self.phi)?;
        Ok((z, a))
    }

    fn check_cache(&self, entities: usize) -> Result<&Cache> {
        match &self.cache {
            Some(cache) if cache.input.entities() == entities => Ok(cache),
            Some(cache) => Err(NnError::StaleState {
                cached: cache.input.entities(),
                got: entities,
            }),
            None => Err(NnError::StaleState {
                cached: 0,
                got: entities,
            }),
        }
    }

    /// Channel offsets of the four branch slices in the concatenated output.
    fn branch_offsets(&self) -> [usize; 4] {
        let i = self.info;
        [
            0,
            i.primary_1x1,
            i.primary_1x1 + i.secondary_3x3,
            i.primary_1x1 + i.secondary_3x3 + i.secondary_5x5,
        ]
    }
}

impl Layer for InceptionLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Inception
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
        if x.info() != self.input {
            return Err(NnError::ShapeMismatch {
                expected: self.input.len(),
                got: x.info().len(),
            });
        }
        let n = x.entities();
        let info = self.info;

        let branch_1x1 = || self.conv_stage(x, Partition::PRIMARY_1X1, info.primary_1x1, CONV_1X1);
        type BranchOut = (Tensor, Tensor, (Tensor, Tensor));
        let branch_3x3 = || -> Result<BranchOut> {
            let (rz, ra) =
                self.conv_stage(x, Partition::REDUCE_3X3, info.reduce_3x3, CONV_1X1)?;
            let out =
                self.conv_stage(ra.view(), Partition::SECONDARY_3X3, info.secondary_3x3, CONV_3X3)?;
            Ok((rz, ra, out))
        };
        let branch_5x5 = || -> Result<BranchOut> {
            let (rz, ra) =
                self.conv_stage(x, Partition::REDUCE_5X5, info.reduce_5x5, CONV_1X1)?;
            let out =
                self.conv_stage(ra.view(), Partition::SECONDARY_5X5, info.secondary_5x5, CONV_5X5)?;
            Ok((rz, ra, out))
        };
        let branch_pool = || -> Result<BranchOut> {
            let mut pz = Tensor::new(Shape::new(n, self.input)?);
            self.backend.pool_forward(x, POOL_3X3, &mut pz)?;
            let mut pa = Tensor::like(&pz);
            self.backend
                .activation_forward(pz.data(), pa.data_mut(), self.phi)?;
            let out =
                self.conv_stage(pa.view(), Partition::AFTER_POOL_1X1, info.after_pool_1x1, CONV_1X1)?;
            Ok((pz, pa, out))
        };

        let ((r1, r2), (r3, r4)) = rayon::join(
            || rayon::join(branch_1x1, branch_3x3),
            || rayon::join(branch_5x5, branch_pool),
        );
        let (z1, a1) = r1?;
        let (reduce_3x3_z, reduce_3x3_a, (z2, a2)) = r2?;
        let (reduce_5x5_z, reduce_5x5_a, (z3, a3)) = r3?;
        let (pool_z, pool_a, (z4, a4)) = r4?;

        let mut z = Tensor::new(Shape::new(n, self.output)?);
        let mut a = Tensor::like(&z);
        let mut offset = 0;
        for (bz, ba) in [(&z1, &a1), (&z2, &a2), (&z3, &a3), (&z4, &a4)] {
            z.write_channels(bz, offset)?;
            a.write_channels(ba, offset)?;
            offset += bz.info().channels;
        }

        self.cache = Some(Cache {
            input: x.to_owned(),
            reduce_3x3_z,
            reduce_3x3_a,
            reduce_5x5_z,
            reduce_5x5_a,
            pool_z,
            pool_a,
            reduce_3x3_delta: None,
            reduce_5x5_delta: None,
        });
        Ok((z, a))
    }

    fn backward(
        &mut self,
        delta: TensorView,
        z_prev: TensorView,
        phi_prev: Activation,
    ) -> Result<Tensor> {
        let n = delta.entities();
        let info = self.info;
        let [o1, o2, o3, o4] = self.branch_offsets();
        let (dx, reduce_3x3_delta, reduce_5x5_delta) = {
            let cache = self.check_cache(n)?;
            let d1 = delta.extract_channels(o1, info.primary_1x1)?;
            let d2 = delta.extract_channels(o2, info.secondary_3x3)?;
            let d3 = delta.extract_channels(o3, info.secondary_5x5)?;
            let d4 = delta.extract_channels(o4, info.after_pool_1x1)?;
            let input_shape = Shape::new(n, self.input)?;

            let back_1x1 = || -> Result<Tensor> {
                let mut dx = Tensor::new(input_shape);
                self.backend.conv_backward_data(
                    d1.view(),
                    self.stage_weights(Partition::PRIMARY_1X1),
                    CONV_1X1,
                    &mut dx,
                )?;
                Ok(dx)
            };
            // Reduction delta: conv backward through the secondary stage,
            // then the activation derivative over the cached reduction z.
            let back_reduced = |d: &Tensor,
                                conv: ConvInfo,
                                secondary: usize,
                                reduce: usize,
                                reduce_z: &Tensor|
             -> Result<(Tensor, Tensor)> {
                let mut dr = Tensor::like(reduce_z);
                self.backend
                    .conv_backward_data(d.view(), self.stage_weights(secondary), conv, &mut dr)?;
                self.backend
                    .activation_backward(reduce_z.data(), dr.data_mut(), self.phi)?;
                let mut dx = Tensor::new(input_shape);
                self.backend.conv_backward_data(
                    dr.view(),
                    self.stage_weights(reduce),
                    CONV_1X1,
                    &mut dx,
                )?;
                Ok((dx, dr))
            };
            let back_3x3 = || {
                back_reduced(
                    &d2,
                    CONV_3X3,
                    Partition::SECONDARY_3X3,
                    Partition::REDUCE_3X3,
                    &cache.reduce_3x3_z,
                )
            };
            let back_5x5 = || {
                back_reduced(
                    &d3,
                    CONV_5X5,
                    Partition::SECONDARY_5X5,
                    Partition::REDUCE_5X5,
                    &cache.reduce_5x5_z,
                )
            };
            let back_pool = || -> Result<Tensor> {
                let mut dp = Tensor::like(&cache.pool_z);
                self.backend.conv_backward_data(
                    d4.view(),
                    self.stage_weights(Partition::AFTER_POOL_1X1),
                    CONV_1X1,
                    &mut dp,
                )?;
                self.backend
                    .activation_backward(cache.pool_z.data(), dp.data_mut(), self.phi)?;
                let mut dx = Tensor::new(input_shape);
                self.backend
                    .pool_backward(cache.input.view(), dp.view(), POOL_3X3, &mut dx)?;
                Ok(dx)
            };

            let ((r1, r2), (r3, r4)) = rayon::join(
                || rayon::join(back_1x1, back_3x3),
                || rayon::join(back_5x5, back_pool),
            );
            let mut dx = r1?;
            let (dx2, dr3) = r2?;
            let (dx3, dr5) = r3?;
            let dx4 = r4?;
            // Branch contributions into the shared input gradient are
            // summed, serially.
            for part in [&dx2, &dx3, &dx4] {
                for (acc, &v) in dx.data_mut().iter_mut().zip(part.data()) {
                    *acc += v;
                }
            }
            self.backend
                .activation_backward(z_prev.data(), dx.data_mut(), phi_prev)?;
            (dx, dr3, dr5)
        };
        // Kept for ComputeGradient on the same batch.
        let Some(cache) = self.cache.as_mut() else {
            return Err(NnError::StaleState { cached: 0, got: n });
        };
        cache.reduce_3x3_delta = Some(reduce_3x3_delta);
        cache.reduce_5x5_delta = Some(reduce_5x5_delta);
        Ok(dx)
    }

    fn compute_gradient(
        &self,
        a_prev: TensorView,
        delta: TensorView,
    ) -> Result<Option<Gradients>> {
        let n = delta.entities();
        let info = self.info;
        let cache = self.check_cache(n)?;
        let (dr3, dr5) = match (&cache.reduce_3x3_delta, &cache.reduce_5x5_delta) {
            (Some(dr3), Some(dr5)) => (dr3, dr5),
            // Backward has not run for this batch, so the reduction deltas
            // are unavailable.
            _ => return Err(NnError::StaleState { cached: 0, got: n }),
        };
        let [o1, o2, o3, o4] = self.branch_offsets();
        let d1 = delta.extract_channels(o1, info.primary_1x1)?;
        let d2 = delta.extract_channels(o2, info.secondary_3x3)?;
        let d3 = delta.extract_channels(o3, info.secondary_5x5)?;
        let d4 = delta.extract_channels(o4, info.after_pool_1x1)?;

        let mut dw: Box<[f32]> = bytemuck::zeroed_slice_box(self.weights.len());
        let mut db: Box<[f32]> = bytemuck::zeroed_slice_box(self.biases.len());
        // (stage, stage input, stage delta, geometry); offsets into dw/db
        // are disjoint, so each stage writes its own range exactly once.
        let stages: [(usize, TensorView, &Tensor, ConvInfo); 6] = [
            (Partition::PRIMARY_1X1, a_prev, &d1, CONV_1X1),
            (Partition::REDUCE_3X3, a_prev, dr3, CONV_1X1),
            (
                Partition::SECONDARY_3X3,
                cache.reduce_3x3_a.view(),
                &d2,
                CONV_3X3,
            ),
            (Partition::REDUCE_5X5, a_prev, dr5, CONV_1X1),
            (
                Partition::SECONDARY_5X5,
                cache.reduce_5x5_a.view(),
                &d3,
                CONV_5X5,
            ),
            (Partition::AFTER_POOL_1X1, cache.pool_a.view(), &d4, CONV_1X1),
        ];
        for (stage, input, stage_delta, conv) in stages {
            self.backend.conv_backward_filter(
                input,
                stage_delta.view(),
                conv,
                &mut dw[self.partition.weights(stage)],
            )?;
            self.backend
                .bias_backward(stage_delta.view(), &mut db[self.partition.biases(stage)])?;
        }
        Ok(Some(Gradients { dw, db }))
    }

    fn serialize(&self, w: &mut dyn Write) -> io::Result<()> {
        layer::write_header(w, self.input, self.output, self.phi)?;
        serialize::write_u32(w, self.weights.len() as u32)?;
        serialize::write_f32s(w, &self.weights)?;
        serialize::write_u32(w, self.biases.len() as u32)?;
        serialize::write_f32s(w, &self.biases)?;
        for value in self.info.as_array() {
            serialize::write_u32(w, value as u32)?;
        }
        Ok(())
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        let mut copy = self.clone();
        copy.cache = None;
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
    fn zero_kernel_count_is_rejected() {
        assert_eq!(
            InceptionInfo::new(2, 0, 2, 2, 2, 2).unwrap_err(),
            NnError::InvalidConfiguration {
                field: "reduce_3x3"
            }
        );
        assert!(InceptionInfo::new(1, 1, 1, 1, 1, 1).is_ok());
    }

    #[test]
    fn output_channels_sum_the_four_pipelines() {
        let info = InceptionInfo::new(3, 2, 4, 2, 5, 6).unwrap();
        assert_eq!(info.output_channels(), 3 + 4 + 5 + 6);
    }

    #[test]
    fn partition_is_contiguous_and_covers_the_buffers() {
        let info = InceptionInfo::new(3, 2, 4, 2, 5, 6).unwrap();
        let partition = Partition::new(7, info);
        let mut w_end = 0;
        let mut b_end = 0;
        for stage in 0..6 {
            let w = partition.weights(stage);
            let b = partition.biases(stage);
            assert_eq!(w.start, w_end, "weight gap before stage {stage}");
            assert_eq!(b.start, b_end, "bias gap before stage {stage}");
            assert!(w.end > w.start);
            assert!(b.end > b.start);
            w_end = w.end;
            b_end = b.end;
        }
        assert_eq!(w_end, partition.weight_len());
        assert_eq!(b_end, partition.bias_len());
        assert_eq!(
            partition.weight_len(),
            7 * 3 + 7 * 2 + 9 * 2 * 4 + 7 * 2 + 25 * 2 * 5 + 7 * 6
        );
        assert_eq!(partition.bias_len(), 3 + 2 + 4 + 2 + 5 + 6);
    }

    #[test]
    fn forward_concatenates_branch_slices() {
        let input = TensorInfo::new(3, 4, 4).unwrap();
        let info = InceptionInfo::new(2, 2, 2, 2, 2, 2).unwrap();
        let mut layer =
            InceptionLayer::new(input, info, Activation::Sigmoid, backend(), &mut rand::rng())
                .unwrap();
        assert_eq!(layer.output(), TensorInfo::new(8, 4, 4).unwrap());
        let x = Tensor::from_vec(
            Shape::new(2, input).unwrap(),
            (0..2 * input.len()).map(|i| (i as f32).sin()).collect(),
        )
        .unwrap();
        let (z, a) = layer.forward(x.view()).unwrap();
        assert_eq!(z.shape(), Shape::new(2, layer.output()).unwrap());
        assert_eq!(a.shape(), z.shape());
        for (&zk, &ak) in z.data().iter().zip(a.data()) {
            assert!((Activation::Sigmoid.apply(zk) - ak).abs() < 1e-6);
        }
    }

    #[test]
    fn backward_requires_forward_and_matching_batch() {
        let input = TensorInfo::new(2, 3, 3).unwrap();
        let info = InceptionInfo::new(1, 1, 1, 1, 1, 1).unwrap();
        let mut layer =
            InceptionLayer::new(input, info, Activation::Identity, backend(), &mut rand::rng())
                .unwrap();
        let delta = Tensor::new(Shape::new(2, layer.output()).unwrap());
        let z_prev = Tensor::new(Shape::new(2, input).unwrap());
        assert_eq!(
            layer
                .backward(delta.view(), z_prev.view(), Activation::Identity)
                .unwrap_err(),
            NnError::StaleState { cached: 0, got: 2 }
        );

        let x = Tensor::new(Shape::new(3, input).unwrap());
        layer.forward(x.view()).unwrap();
        assert_eq!(
            layer
                .backward(delta.view(), z_prev.view(), Activation::Identity)
                .unwrap_err(),
            NnError::StaleState { cached: 3, got: 2 }
        );
    }

    #[test]
    fn compute_gradient_requires_backward_first() {
        let input = TensorInfo::new(2, 3, 3).unwrap();
        let info = InceptionInfo::new(1, 1, 1, 1, 1, 1).unwrap();
        let mut layer =
            InceptionLayer::new(input, info, Activation::Identity, backend(), &mut rand::rng())
                .unwrap();
        let x = Tensor::new(Shape::new(1, input).unwrap());
        layer.forward(x.view()).unwrap();
        let delta = Tensor::new(Shape::new(1, layer.output()).unwrap());
        assert_eq!(
            layer
                .compute_gradient(x.view(), delta.view())
                .unwrap_err(),
            NnError::StaleState { cached: 0, got: 1 }
        );

        let z_prev = Tensor::new(Shape::new(1, input).unwrap());
        layer
            .backward(delta.view(), z_prev.view(), Activation::Identity)
            .unwrap();
        let grads = layer
            .compute_gradient(x.view(), delta.view())
            .unwrap()
            .unwrap();
        assert_eq!(grads.dw.len(), layer.weights().len());
        assert_eq!(grads.db.len(), layer.biases().len());
    }

    #[test]
    fn serialization_round_trips_bit_exact() {
        let input = TensorInfo::new(3, 5, 5).unwrap();
        let info = InceptionInfo::new(2, 3, 4, 2, 3, 2).unwrap();
        let layer =
            InceptionLayer::new(input, info, Activation::ReLU, backend(), &mut rand::rng())
                .unwrap();
        let mut buf = Vec::new();
        layer.serialize(&mut buf).unwrap();
        let back = InceptionLayer::deserialize(&mut buf.as_slice(), &backend()).unwrap();
        assert_eq!(back.weights(), layer.weights());
        assert_eq!(back.biases(), layer.biases());
        assert_eq!(back.inception_info(), layer.inception_info());
        assert_eq!(back.activation(), layer.activation());
        assert!(InceptionLayer::deserialize(&mut buf[..buf.len() - 2].as_ref(), &backend()).is_none());
    }
}
