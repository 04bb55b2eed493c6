//! # Classroom Broker
//!
//! Classroom and lab allocation served through a load-balancing broker and
//! a redundant ACTIVE/STANDBY worker pair.
//!
//! Faculty gateways submit allocation requests to the broker, which hands
//! each one to the longest-idle worker endpoint. Endpoints belong to the
//! ACTIVE node of the pair; that node runs the allocation engine and ships
//! every committed registry mutation to its STANDBY peer, which takes over
//! when the ACTIVE node stops sending heartbeats.
//!
//! ## Allocation
//!
//! Requests ask for a number of rooms and labs with a minimum capacity.
//! Units are picked by ascending id. When native labs run short, spare
//! rooms are converted into mobile labs. A request is either served in
//! full or not at all: a shortfall comes back with `unavailable` set and
//! the registry untouched.
//!
//! ```rust,ignore
//! use classroom_broker::builders::Deployment;
//! use classroom_broker::config::SystemConfig;
//! use classroom_broker::core::AllocationRequest;
//!
//! let deployment = Deployment::launch(SystemConfig::default())?;
//! let mut gateway = deployment.gateway("Engineering")?;
//! let response = gateway
//!     .request(&AllocationRequest::new("Engineering", "Systems", 3, 8, 3, 30))
//!     .await?;
//! assert_eq!(response.room_ids.len(), 8);
//! deployment.shutdown().await?;
//! ```
//!
//! ## Layout
//!
//! - [`core`]: registry, allocation engine, load balancer and failover state
//!   machines. No I/O.
//! - [`infra`]: pending queue, reply ledger and snapshot storage.
//! - [`runtime`]: tokio tasks for the broker, worker slots, nodes and gateways.
//! - [`builders`]: [`builders::Deployment`] wiring everything from a
//!   [`config::SystemConfig`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core domain types and state machines.
pub mod core;
/// Configuration models for the broker, nodes, engine and gateways.
pub mod config;
/// Builders wiring a deployment from configuration.
pub mod builders;
/// Infrastructure adapters for queues, reply ledgers and snapshots.
pub mod infra;
/// Tokio tasks and handles.
pub mod runtime;
/// Shared utilities.
pub mod util;
