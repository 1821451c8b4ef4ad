// Copyright 2021 Stratus Data Systems, Inc.

//! Client interface to the multicast manager: the component that knows
//! which publishers exist and owns each publisher's pool of FMTP client
//! addresses. Sessions subscribe on behalf of their peer and release the
//! allocated address on teardown.
//!
//! The manager is shared by every session serving the same site, so all
//! state sits behind an internal lock and `subscribe` never blocks on
//! anything but that lock. `unsubscribe` is idempotent: releasing an
//! address that was never allocated, or releasing it twice, is harmless by
//! design of the crash paths that call it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::error::EngineError;
use crate::types::{CidrAddr, Feed, McastInfo};

struct SenderEntry {
    info: McastInfo,
    fmtp_subnet: CidrAddr,
    allocated: HashSet<Ipv4Addr>,
}

impl SenderEntry {
    fn network(&self) -> u32 {
        let prefix = u32::from(self.fmtp_subnet.prefix_len);
        let mask = if prefix == 0 {
            0
        } else {
            u32::max_value() << (32 - prefix)
        };
        u32::from(self.fmtp_subnet.addr) & mask
    }

    fn allocate(&mut self) -> Option<CidrAddr> {
        let network = self.network();
        let block = self.fmtp_subnet.host_count();
        // The network address and the final (broadcast) address are not
        // usable client addresses
        for i in 1..block.saturating_sub(1) {
            let candidate = Ipv4Addr::from(network + i);
            if !self.allocated.contains(&candidate) {
                self.allocated.insert(candidate);
                return Some(CidrAddr::new(
                    candidate,
                    self.fmtp_subnet.prefix_len,
                ));
            }
        }
        None
    }

    fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.allocated.remove(&addr)
    }
}

/// Registry of potential multicast publishers and their address pools.
pub struct McastManager {
    senders: Mutex<Vec<SenderEntry>>,
}

impl Default for McastManager {
    fn default() -> Self {
        McastManager::new()
    }
}

impl McastManager {
    pub fn new() -> McastManager {
        McastManager {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Registers a potential publisher and the subnet its FMTP clients are
    /// allocated from. Feeds of registered publishers must not overlap.
    pub fn add_potential_sender(
        &self,
        info: McastInfo,
        fmtp_subnet: CidrAddr,
    ) -> Result<(), EngineError> {
        if info.feed.is_none() {
            return Err(EngineError::Inval(String::from(
                "potential sender must carry a feed",
            )));
        }

        let mut senders = self.lock();
        if senders.iter().any(|s| s.info.feed.intersects(info.feed)) {
            return Err(EngineError::Dup(format!(
                "feed {} conflicts with an earlier sender",
                info.feed
            )));
        }

        senders.push(SenderEntry {
            info,
            fmtp_subnet,
            allocated: HashSet::new(),
        });
        Ok(())
    }

    /// Subscribes a peer to `feed`: locates the publisher covering the feed
    /// and allocates an FMTP client address from its pool. `NoEnt` when the
    /// feed is not multicast by any registered publisher.
    pub fn subscribe(
        &self,
        feed: Feed,
    ) -> Result<(McastInfo, CidrAddr), EngineError> {
        let mut senders = self.lock();
        let entry = senders
            .iter_mut()
            .find(|s| s.info.feed.contains(feed))
            .ok_or_else(|| {
                EngineError::NoEnt(format!("no publisher for feed {}", feed))
            })?;

        let fmtp_addr = entry.allocate().ok_or_else(|| {
            EngineError::Mcast(format!(
                "FMTP address pool for feed {} is exhausted",
                entry.info.feed
            ))
        })?;

        Ok((entry.info.clone(), fmtp_addr))
    }

    /// Returns a peer's FMTP client address to the pool. A no-op when the
    /// feed has no publisher or the address isn't allocated.
    pub fn unsubscribe(&self, feed: Feed, addr: Ipv4Addr) {
        let mut senders = self.lock();
        if let Some(entry) =
            senders.iter_mut().find(|s| s.info.feed.contains(feed))
        {
            entry.release(addr);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<Vec<SenderEntry>> {
        // A poisoned registry only happens if another session thread
        // panicked mid-update; the entries themselves stay consistent.
        match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::SocketAddrV4;

    fn info(feed: Feed) -> McastInfo {
        McastInfo {
            feed,
            group: "224.0.1.2:38800".parse::<SocketAddrV4>().unwrap(),
            fmtp_server: "10.0.0.1:5555".parse::<SocketAddrV4>().unwrap(),
        }
    }

    fn subnet() -> CidrAddr {
        CidrAddr::new(Ipv4Addr::new(10, 0, 0, 128), 25)
    }

    fn manager() -> McastManager {
        let umm = McastManager::new();
        umm.add_potential_sender(info(Feed(0x0f)), subnet()).unwrap();
        umm
    }

    #[test]
    fn subscribe_allocates_first_usable_address() {
        let umm = manager();
        let (reply, fmtp_addr) = umm.subscribe(Feed(0x0f)).unwrap();
        assert_eq!(reply.feed, Feed(0x0f));
        // The subnet's own address is not in the pool
        assert_eq!(fmtp_addr, CidrAddr::new(Ipv4Addr::new(10, 0, 0, 129), 25));

        let (_, second) = umm.subscribe(Feed(0x0f)).unwrap();
        assert_eq!(second.addr, Ipv4Addr::new(10, 0, 0, 130));
    }

    #[test]
    fn subscribe_unknown_feed_is_noent() {
        let umm = manager();
        match umm.subscribe(Feed(0xf0)) {
            Err(EngineError::NoEnt(_)) => (),
            other => panic!("expected NoEnt, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn unsubscribe_returns_address_to_pool() {
        let umm = manager();
        let (_, fmtp_addr) = umm.subscribe(Feed(0x0f)).unwrap();
        umm.unsubscribe(Feed(0x0f), fmtp_addr.addr);

        let (_, again) = umm.subscribe(Feed(0x0f)).unwrap();
        assert_eq!(again, fmtp_addr);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let umm = manager();
        // Never subscribed
        umm.unsubscribe(Feed(0x0f), Ipv4Addr::new(10, 0, 0, 200));
        // Unknown feed
        umm.unsubscribe(Feed(0xf0), Ipv4Addr::new(10, 0, 0, 128));

        let (_, fmtp_addr) = umm.subscribe(Feed(0x0f)).unwrap();
        umm.unsubscribe(Feed(0x0f), fmtp_addr.addr);
        umm.unsubscribe(Feed(0x0f), fmtp_addr.addr);
    }

    #[test]
    fn conflicting_registration_is_dup() {
        let umm = manager();
        match umm.add_potential_sender(info(Feed(0x01)), subnet()) {
            Err(EngineError::Dup(_)) => (),
            other => panic!("expected Dup, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        // A /30 block holds exactly two usable client addresses
        let umm = McastManager::new();
        umm.add_potential_sender(
            info(Feed(0x01)),
            CidrAddr::new(Ipv4Addr::new(192, 168, 7, 0), 30),
        )
        .unwrap();

        let (_, first) = umm.subscribe(Feed(0x01)).unwrap();
        assert_eq!(first.addr, Ipv4Addr::new(192, 168, 7, 1));
        let (_, second) = umm.subscribe(Feed(0x01)).unwrap();
        assert_eq!(second.addr, Ipv4Addr::new(192, 168, 7, 2));
        match umm.subscribe(Feed(0x01)) {
            Err(EngineError::Mcast(_)) => (),
            other => panic!("expected Mcast, got {:?}", other.is_ok()),
        }
    }
}
