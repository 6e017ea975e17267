pub mod engine;
pub mod signature;
pub mod substitution;

pub use engine::Once;
pub use signature::BuildSignature;
pub use substitution::substitute;
