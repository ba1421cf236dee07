pub mod agent;
pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod supervisor;
