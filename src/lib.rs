pub use faer;

mod activation;
mod backend;
mod error;
mod evaluate;
mod layer;
mod layers;
mod network;
mod tensor;

pub use activation::*;
pub use backend::*;
pub use error::*;
pub use evaluate::*;
pub use layer::*;
pub use layers::*;
pub use network::*;
pub use tensor::*;

pub(crate) mod serialize;
