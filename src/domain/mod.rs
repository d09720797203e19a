pub mod allocation;
pub mod engine;
pub mod network;
pub mod summary;
