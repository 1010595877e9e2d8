use derive_more::Display;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + f32::exp(-x))
}

/// Activation selector carried by every layer.
///
/// Kept as a plain enum (rather than a trait object) so it can travel through
/// the binary layer serialization as a single tag byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
    ReLU,
    LeakyReLU,
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => f32::tanh(x),
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU => {
                if x > 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
        }
    }

    pub fn deriv(self, x: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Sigmoid => sigmoid(x) * (1.0 - sigmoid(x)),
            Activation::Tanh => 1.0 - f32::tanh(x).powi(2),
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
        }
    }

    /// `a[i] = phi(z[i])` for every element.
    ///
    /// # Panics
    ///
    /// Panics if `z` and `a` have different lengths.
    pub fn apply_slice(self, z: &[f32], a: &mut [f32]) {
        assert_eq!(z.len(), a.len());
        if self == Activation::Identity {
            a.copy_from_slice(z);
            return;
        }
        for (ak, &zk) in a.iter_mut().zip(z) {
            *ak = self.apply(zk);
        }
    }

    /// `d[i] *= phi'(z[i])` for every element; the in-place activation
    /// backward step.
    ///
    /// # Panics
    ///
    /// Panics if `z` and `d` have different lengths.
    pub fn deriv_slice(self, z: &[f32], d: &mut [f32]) {
        assert_eq!(z.len(), d.len());
        if self == Activation::Identity {
            return;
        }
        for (dk, &zk) in d.iter_mut().zip(z) {
            *dk *= self.deriv(zk);
        }
    }

    /// Serialization tag. Stable across versions; see `from_tag`.
    pub fn tag(self) -> u8 {
        match self {
            Activation::Identity => 0,
            Activation::Sigmoid => 1,
            Activation::Tanh => 2,
            Activation::ReLU => 3,
            Activation::LeakyReLU => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Activation::Identity,
            1 => Activation::Sigmoid,
            2 => Activation::Tanh,
            3 => Activation::ReLU,
            4 => Activation::LeakyReLU,
            _ => return None,
        })
    }
}
