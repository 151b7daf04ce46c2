//! Gateway Client (C2): the request/reply transport to the broker adapter.

pub mod client;
pub mod wire;

pub use client::GatewayClient;
pub use wire::{Action, Reply, Request, Status, WireError};
