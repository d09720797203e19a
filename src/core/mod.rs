pub mod interval;
pub mod keys;
pub mod math;
pub mod provider_id;
pub mod window;
