//! Configuration models for the broker, worker pair, engine, and gateways.

pub mod system;

pub use system::{
    BrokerConfig, EngineConfig, GatewayConfig, InventoryConfig, NodeConfig, SystemConfig,
};
