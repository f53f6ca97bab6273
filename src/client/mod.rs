//! Outbound A2A client — used by the broker to delegate work to external
//! agents, and usable standalone against any A2A JSON-RPC endpoint.

pub mod agent_client;
pub mod endpoints;

pub use agent_client::{
    resolve_card, resolve_card_with, AgentClient, EventStream, HttpChannel, RpcChannel,
    CARD_PATHS, DEFAULT_REQUEST_TIMEOUT,
};
pub use endpoints::{AgentEndpoint, AgentEndpointRegistry};
