//! Tokio tasks: the broker loop, worker slots, node pair members and the
//! faculty gateway.

pub mod broker;
pub mod gateway;
pub mod node;
pub mod slot;

pub use broker::{
    AdminCommand, BackendFrame, BrokerHandle, BrokerService, ClientLink, DispatchSender,
    FrontendFrame, WorkerLink,
};
pub use gateway::GatewayClient;
pub use node::{NodeHandle, NodeStatus, PeerLink, WorkerNode};
pub use slot::{run_slot, SlotExit, SlotStop};
