pub mod egress;
pub mod info;

pub use egress::*;
pub use info::*;
