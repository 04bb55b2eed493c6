//! Unit tests for individual components

mod config_test;
mod error_test;
mod ledger_test;
mod snapshot_test;
mod util_test;
