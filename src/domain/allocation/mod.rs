pub mod allocation;
pub mod props;
pub mod range;
pub mod set;
