#![doc = include_str!("../README.md")]

// Public modules
mod common;

pub mod algorithm;
pub mod config;
pub mod driver;
mod error;
mod node;
pub mod proto;
pub mod transport;

pub use crate::common::{
    Distance, Envelope, Field, Id, NodeReference, RoutingHop, RoutingResult, Tag,
    DEFAULT_ID_SIZE, MAX_FIELDS,
};
pub use crate::config::{Config, RoutingStrategy};
pub use crate::driver::{NodeFailureCallback, RouteCallback, RouteMode};
pub use crate::error::{Error, Result};
pub use crate::node::OverlayNode;
pub use crate::transport::mem::{MemNetwork, MemTransport};
pub use crate::transport::{Handler, Transport};
pub use bytes::Bytes;
