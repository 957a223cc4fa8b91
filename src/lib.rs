pub mod agent;
pub mod config;
pub mod emit;
pub mod error;
pub mod probe;
pub mod procscan;
