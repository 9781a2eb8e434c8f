pub mod activations;
pub mod layers;
pub mod loss;
