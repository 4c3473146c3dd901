pub mod api;
pub mod app;
pub mod config;
pub mod environment;
pub mod job;
pub mod project;
pub mod shared;
