pub mod diff;
pub mod fingerprint;
pub mod gate;
pub mod hash;
pub mod types;

pub use types::*;
