pub mod data_source;
pub mod prometheus;
pub mod query_group;
pub mod rows;
pub mod types;
