//! Reference to an overlay node: an (identifier, network address) pair.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;

use crate::common::Id;

/// An (identifier, address) pair naming an overlay node.
///
/// Address-only and id-only forms are legal intermediate states: a reference
/// may be constructed from a bootstrap address alone and have its identifier
/// computed later or filled in from a reply.
#[derive(Clone)]
pub struct NodeReference {
    id: Option<Id>,
    addr: Option<SocketAddr>,
}

impl NodeReference {
    pub fn new(id: Id, addr: SocketAddr) -> NodeReference {
        NodeReference {
            id: Some(id),
            addr: Some(addr),
        }
    }

    pub fn from_addr(addr: SocketAddr) -> NodeReference {
        NodeReference {
            id: None,
            addr: Some(addr),
        }
    }

    pub fn from_id(id: Id) -> NodeReference {
        NodeReference {
            id: Some(id),
            addr: None,
        }
    }

    pub fn empty() -> NodeReference {
        NodeReference {
            id: None,
            addr: None,
        }
    }

    // === Getters ===

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    // === Public Methods ===

    /// Fill in a missing identifier learned from a reply.
    pub fn with_id(mut self, id: Id) -> NodeReference {
        self.id = Some(id);
        self
    }

    /// Compute a missing identifier as the hash of the textual address.
    pub fn with_hashed_id(self, size: usize) -> NodeReference {
        match (&self.id, self.addr) {
            (None, Some(addr)) => {
                let id = Id::from_hash(addr.to_string(), size);
                self.with_id(id)
            }
            _ => self,
        }
    }
}

/// Equality is by identifier when both sides carry one, else by address,
/// else structural (both fields absent).
impl PartialEq for NodeReference {
    fn eq(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => match (self.addr, other.addr) {
                (Some(a), Some(b)) => a == b,
                (None, None) => self.id.is_none() && other.id.is_none(),
                _ => false,
            },
        }
    }
}

impl Eq for NodeReference {}

impl Debug for NodeReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.id, self.addr) {
            (Some(id), Some(addr)) => write!(f, "NodeReference({id}@{addr})"),
            (Some(id), None) => write!(f, "NodeReference({id}@?)"),
            (None, Some(addr)) => write!(f, "NodeReference(?@{addr})"),
            (None, None) => write!(f, "NodeReference(?)"),
        }
    }
}
