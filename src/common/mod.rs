//! Common value types: identifiers, node references, envelopes, results.

mod envelope;
mod id;
mod node_ref;
mod result;

pub use envelope::{Envelope, Field, Tag, MAX_FIELDS};
pub use id::{Distance, Id, DEFAULT_ID_SIZE};
pub use node_ref::NodeReference;
pub use result::{RoutingHop, RoutingResult};
