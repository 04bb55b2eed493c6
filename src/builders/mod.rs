//! Wiring of a complete deployment from configuration.

pub mod deployment;

pub use deployment::{Deployment, BACKUP_ID, PRIMARY_ID};
