//! End-to-end tests against mock HTTP peers and real SQLite files

mod common;
mod crawl_tests;
mod server_tests;
mod sync_tests;
