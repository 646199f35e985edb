//! Neural network layers, model, optimizer and losses

mod layers;
mod loss;
mod model;
mod optim;

pub use layers::{relu, relu_backward, sigmoid, sigmoid_backward, Conv2d, ConvGrads, StateDict};
pub use loss::{CustomLoss, LossKind, LossOutput, LossParameters, MseLoss, SeparationLoss};
pub use model::{Architecture, ForwardCache, SeparationNet, SeparationOutput};
pub use optim::{Adam, AdamState};
