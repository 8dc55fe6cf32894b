pub mod config;
pub mod edit_log;
pub mod export;
pub mod fast_import;
pub mod fetch_cache;
pub mod filesystem;
pub mod history;
pub mod runtime;
pub mod translate;
pub mod users;
