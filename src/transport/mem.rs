//! In-process network of transport endpoints.
//!
//! Every delivery goes through a real envelope encode/decode round trip, so
//! the wire codec is exercised end-to-end. Endpoints can be taken down and
//! individual directed links cut, which is how the tests simulate peer
//! failures and partial partitions.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use crate::common::{Envelope, Tag};
use crate::transport::{Handler, Transport};
use crate::{Error, Result};

const RTT_CACHE_SIZE: usize = 256;

/// A shared in-process network endpoints attach to.
#[derive(Clone)]
pub struct MemNetwork {
    inner: Arc<NetInner>,
}

struct NetInner {
    signature: Bytes,
    endpoints: Mutex<HashMap<SocketAddr, Arc<Endpoint>>>,
    down: Mutex<HashSet<SocketAddr>>,
    /// Directed (from, to) links that silently drop traffic.
    cut_links: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
    next_port: AtomicU16,
}

struct Endpoint {
    handlers: RwLock<HashMap<Tag, Arc<dyn Handler>>>,
}

impl MemNetwork {
    pub fn new(signature: Bytes) -> MemNetwork {
        MemNetwork {
            inner: Arc::new(NetInner {
                signature,
                endpoints: Mutex::new(HashMap::new()),
                down: Mutex::new(HashSet::new()),
                cut_links: Mutex::new(HashSet::new()),
                next_port: AtomicU16::new(4000),
            }),
        }
    }

    /// Attach a new endpoint with a fresh loopback address.
    pub fn endpoint(&self) -> Arc<MemTransport> {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                addr,
                Arc::new(Endpoint {
                    handlers: RwLock::new(HashMap::new()),
                }),
            );

        Arc::new(MemTransport {
            addr,
            net: self.inner.clone(),
            rtt: Mutex::new(LruCache::new(
                NonZeroUsize::new(RTT_CACHE_SIZE).expect("nonzero"),
            )),
        })
    }

    /// Make an endpoint unreachable, as a crashed peer would be.
    pub fn take_down(&self, addr: SocketAddr) {
        self.inner
            .down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr);
    }

    pub fn bring_up(&self, addr: SocketAddr) {
        self.inner
            .down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr);
    }

    /// Silently drop all traffic flowing `from -> to`. The reverse
    /// direction is unaffected.
    pub fn cut_link(&self, from: SocketAddr, to: SocketAddr) {
        self.inner
            .cut_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((from, to));
    }

    pub fn heal_link(&self, from: SocketAddr, to: SocketAddr) {
        self.inner
            .cut_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(from, to));
    }
}

impl NetInner {
    fn is_down(&self, addr: &SocketAddr) -> bool {
        self.down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(addr)
    }

    fn is_cut(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.cut_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(from, to))
    }

    /// Deliver one envelope, round-tripping it through the wire codec, and
    /// return the handler's synchronous reply if any.
    fn deliver(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>> {
        if self.is_down(&to) || self.is_cut(from, to) {
            return Err(Error::Unreachable(to));
        }

        let bytes = envelope.to_bytes(&self.signature)?;
        let decoded = Envelope::from_bytes(&bytes, &self.signature)?;

        let endpoint = self
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .cloned()
            .ok_or(Error::Unreachable(to))?;

        let handler = endpoint
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&decoded.tag)
            .cloned();

        match handler {
            Some(handler) => Ok(handler.handle(from, decoded)),
            None => {
                trace!(?to, tag = ?decoded.tag, "No handler registered, dropping");
                Ok(None)
            }
        }
    }
}

/// One endpoint of a [MemNetwork].
pub struct MemTransport {
    addr: SocketAddr,
    net: Arc<NetInner>,
    rtt: Mutex<LruCache<SocketAddr, Duration>>,
}

impl Transport for MemTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<()> {
        self.net.deliver(self.addr, to, &envelope)?;
        Ok(())
    }

    fn send_and_receive(
        &self,
        to: SocketAddr,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope> {
        let started = Instant::now();
        let reply = self.net.deliver(self.addr, to, &envelope)?;

        // The request got through; the reply may still be lost on the way
        // back. An in-flight request cannot be canceled, so the caller sits
        // out the full timeout exactly as it would against a real network.
        if self.net.is_cut(to, self.addr) {
            std::thread::sleep(timeout);
            return Err(Error::Timeout);
        }

        match reply {
            Some(reply) => {
                self.rtt
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .put(to, started.elapsed());
                Ok(reply)
            }
            None => {
                std::thread::sleep(timeout);
                Err(Error::Timeout)
            }
        }
    }

    fn register_handler(&self, tag: Tag, handler: Arc<dyn Handler>) {
        if let Some(endpoint) = self
            .net
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.addr)
            .cloned()
        {
            endpoint
                .handlers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(tag, handler);
        }
    }

    fn estimated_rtt(&self, to: SocketAddr) -> Option<Duration> {
        self.rtt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{Field, Id, NodeReference};

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, _from: SocketAddr, envelope: Envelope) -> Option<Envelope> {
            Some(Envelope::new(Tag::Ack, envelope.source.clone(), envelope.fields))
        }
    }

    fn ping(from: &Arc<MemTransport>) -> Envelope {
        Envelope::new(
            Tag::Ping,
            NodeReference::new(Id::random(2), from.local_addr()),
            vec![Field::U8(1)],
        )
    }

    #[test]
    fn request_reply_and_rtt() {
        let net = MemNetwork::new(Bytes::from_static(b"test"));
        let a = net.endpoint();
        let b = net.endpoint();

        b.register_handler(Tag::Ping, Arc::new(Echo));

        let reply = a
            .send_and_receive(b.local_addr(), ping(&a), Duration::from_millis(100))
            .unwrap();
        assert_eq!(reply.tag, Tag::Ack);
        assert_eq!(reply.fields, vec![Field::U8(1)]);

        assert!(a.estimated_rtt(b.local_addr()).is_some());
        assert!(a.estimated_rtt(a.local_addr()).is_none());
    }

    #[test]
    fn down_endpoint_is_unreachable() {
        let net = MemNetwork::new(Bytes::from_static(b"test"));
        let a = net.endpoint();
        let b = net.endpoint();
        b.register_handler(Tag::Ping, Arc::new(Echo));

        net.take_down(b.local_addr());
        assert!(matches!(
            a.send_and_receive(b.local_addr(), ping(&a), Duration::from_millis(10)),
            Err(Error::Unreachable(_))
        ));

        net.bring_up(b.local_addr());
        assert!(a
            .send_and_receive(b.local_addr(), ping(&a), Duration::from_millis(10))
            .is_ok());
    }

    #[test]
    fn directed_cut_drops_only_one_direction() {
        let net = MemNetwork::new(Bytes::from_static(b"test"));
        let a = net.endpoint();
        let b = net.endpoint();
        a.register_handler(Tag::Ping, Arc::new(Echo));
        b.register_handler(Tag::Ping, Arc::new(Echo));

        net.cut_link(a.local_addr(), b.local_addr());

        assert!(a.send(b.local_addr(), ping(&a)).is_err());
        assert!(b.send(a.local_addr(), ping(&b)).is_ok());

        // A request that gets through but whose reply is lost times out.
        net.heal_link(a.local_addr(), b.local_addr());
        net.cut_link(b.local_addr(), a.local_addr());
        assert!(matches!(
            a.send_and_receive(b.local_addr(), ping(&a), Duration::from_millis(5)),
            Err(Error::Timeout)
        ));
    }
}
