pub mod entities;
pub mod gateway;

pub use gateway::GatewayStorage;
