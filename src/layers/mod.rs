mod convolution;
mod dense;
mod inception;
mod output;
mod pooling;

pub use convolution::*;
pub use dense::*;
pub use inception::*;
pub use output::*;
pub use pooling::*;

use rand::Rng;

/// Xavier-uniform fill: limit = sqrt(6 / (fan_in + fan_out)).
pub(crate) fn xavier_fill(rng: &mut impl Rng, buf: &mut [f32], fan_in: usize, fan_out: usize) {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    for p in buf {
        *p = rng.random_range(-limit..limit);
    }
}
