//! Internal utilities.

pub mod det_rng;
pub mod slab;

pub use det_rng::DetRng;
pub use slab::{Key, Slab};
