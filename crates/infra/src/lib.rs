pub mod config;
pub mod db;
pub mod jobs;
pub mod logging;
pub mod recompute;
pub mod repositories;
pub mod stores;
