pub mod app;
pub mod archive;
pub mod client;
pub mod config;
pub mod discover;
pub mod domain;
pub mod download;
pub mod error;
pub mod matcher;
pub mod output;
pub mod retry;
pub mod store;
