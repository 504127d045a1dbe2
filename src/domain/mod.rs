//! Domain types and the ports through which the engine reaches its collaborators.

pub mod money;
pub mod notification;
pub mod order;
pub mod ports;
pub mod pricing;
