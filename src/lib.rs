pub mod config;
pub mod error;
pub mod jobs;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;
pub mod util;
