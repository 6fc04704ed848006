pub mod builder;
pub mod camera;
pub mod config;
pub mod constants;
pub mod geo;
