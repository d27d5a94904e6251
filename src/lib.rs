pub mod agent;
pub mod capture;
pub mod config;
pub mod export;
pub mod signal;
pub mod sink;
