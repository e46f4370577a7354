pub mod analysis;
pub mod crawl;
pub mod data_io;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod render;
pub mod runtime;
pub mod types;
pub mod webdriver;
