pub mod config;
pub mod error;
pub mod fetcher;
pub mod filename;
pub mod formats;
pub mod playlist;
pub mod relay;
pub mod security;
