pub mod config;
pub mod editor;
pub mod engine;
pub mod model;
pub mod observability;
pub mod repository;
pub mod timezone;
pub mod workspace;
