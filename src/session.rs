// Copyright 2021 Stratus Data Systems, Inc.

//! The per-peer session: exactly one downstream subscriber of one feed.
//!
//! A session is created in the unsubscribed state by the dispatcher and
//! promoted by the subscription handshake, which validates the peer against
//! the policy oracle, provisions the virtual circuit, subscribes through
//! the multicast manager, opens the product-index map, and installs the
//! outbound transport on the accepted connection. After that the peer
//! issues asynchronous recovery requests that replay products out of the
//! local store.
//!
//! All resources the session acquires are owned by the `Session` value and
//! released by `Drop`, in reverse order of acquisition, so every exit path
//! tears down the same way.

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Duration, Utc};
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::client::PeerClient;
use crate::error::{EngineError, PimError, PqError};
use crate::pim::ProdIndexMap;
use crate::policy::{self, FeedPolicy};
use crate::pq::{OpenMode, ProductQueue};
use crate::types::{
    BacklogSpec, Feed, MissedProduct, Product, ProductClass,
    SubscriptionReply, SubscriptionRequest, VcEndPoint,
};
use crate::umm::McastManager;
use crate::vcircuit;

/// Engine-instance configuration, handed down by the parent daemon.
#[derive(Clone)]
pub struct SessionConfig {
    /// Workgroup name for virtual-circuit provisioning.
    pub workgroup: String,
    /// The local end of provisioned virtual circuits.
    pub local_vc_end: VcEndPoint,
    /// Pathname of the read-only product queue.
    pub queue_path: PathBuf,
}

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No successful handshake yet.
    Init,
    /// Handshake validated and subscribed; transport not yet installed.
    Subscribed,
    /// Fully set up; recovery requests are being served.
    Serving,
    /// Unusable. Absorbing; the dispatcher drains to exit.
    Done,
}

enum BacklogStep {
    Sent,
    Stop,
    Failed(EngineError),
}

/// One upstream session. See the module docs for the lifecycle.
pub struct Session {
    config: SessionConfig,
    manager: Arc<McastManager>,
    policy: Arc<dyn FeedPolicy>,
    feed: Feed,
    down_fmtp_addr: Ipv4Addr,
    circuit_id: Option<String>,
    pim: Option<ProdIndexMap>,
    pq: Option<ProductQueue>,
    client: Option<PeerClient>,
    done: bool,
    log: Logger,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        manager: Arc<McastManager>,
        policy: Arc<dyn FeedPolicy>,
        log: Option<&Logger>,
    ) -> Session {
        // If no logger was provided use the slog StdLog drain by default
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Session {
            config,
            manager,
            policy,
            feed: Feed::NONE,
            down_fmtp_addr: Ipv4Addr::UNSPECIFIED,
            circuit_id: None,
            pim: None,
            pq: None,
            client: None,
            done: false,
            log,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.done {
            SessionState::Done
        } else if self.client.is_some() {
            SessionState::Serving
        } else if !self.feed.is_none() {
            SessionState::Subscribed
        } else {
            SessionState::Init
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Marks the session unusable. Once set it stays set.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    pub fn down_fmtp_addr(&self) -> Ipv4Addr {
        self.down_fmtp_addr
    }

    pub fn circuit_id(&self) -> Option<&str> {
        self.circuit_id.as_deref()
    }

    /// The subscription handshake. Returns the reply to send, or `None` on
    /// a system failure, in which case the dispatch layer sends a generic
    /// error instead and marks the session done.
    ///
    /// `Unauth` and `NoEnt` are normal replies, not failures: the peer is
    /// told and the connection stays up. Each failing step unwinds the
    /// steps that preceded it.
    pub fn handle_subscribe(
        &mut self,
        request: &SubscriptionRequest,
        stream: &TcpStream,
    ) -> Option<SubscriptionReply> {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                error!(self.log, "couldn't identify peer: {}", e);
                return None;
            }
        };
        let host = peer.ip().to_string();
        let peer_v4 = match peer.ip() {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        info!(self.log, "incoming subscription request";
            "host" => %host, "feed" => %request.feed);

        let allowed = self.policy.allowed_feeds(&host, peer_v4);
        let reduced = policy::reduce_to_allowed(request.feed, &allowed);
        if reduced.is_none() {
            warn!(self.log,
                "host {} isn't allowed to receive any part of feed {}",
                host, request.feed);
            return Some(SubscriptionReply::Unauth);
        }

        if let Err(e) = self.create_virtual_circuit(reduced, &request.vc_end) {
            error!(self.log,
                "couldn't create virtual circuit to host {}: {}", host, e);
            return None;
        }

        let (mcast_info, fmtp_addr) = match self.manager.subscribe(reduced) {
            Ok(subscription) => subscription,
            Err(EngineError::NoEnt(_)) => {
                warn!(self.log, "allowed feed {} isn't multicast", reduced);
                self.destroy_virtual_circuit();
                return Some(SubscriptionReply::NoEnt);
            }
            Err(e) => {
                error!(self.log, "couldn't subscribe host {} to feed {}: {}",
                    host, reduced, e);
                self.destroy_virtual_circuit();
                return None;
            }
        };

        let map_dir = queue_parent(&self.config.queue_path);
        match ProdIndexMap::open_for_reading(map_dir, reduced) {
            Ok(pim) => self.pim = Some(pim),
            Err(e) => {
                error!(self.log, "couldn't open product-index map: {}", e);
                self.manager.unsubscribe(reduced, fmtp_addr.addr);
                self.destroy_virtual_circuit();
                return None;
            }
        }

        // Set and cleared together; see `release_down_fmtp_addr`.
        self.feed = reduced;
        self.down_fmtp_addr = fmtp_addr.addr;

        if let Err(e) = self.ensure_product_queue_open() {
            error!(self.log, "{}", e);
            return None;
        }

        match PeerClient::from_connection(stream, Some(&self.log)) {
            Ok(client) => self.client = Some(client),
            Err(e) => {
                error!(self.log,
                    "couldn't create client-side transport to downstream \
                     host {}: {}",
                    host, e);
                return None;
            }
        }

        info!(self.log, "subscribed";
            "feed" => %reduced, "fmtp_addr" => %fmtp_addr);
        Some(SubscriptionReply::Ok {
            info: mcast_info,
            fmtp_addr,
        })
    }

    /// Serves a missed-product lookup: resolve the sequence index through
    /// the index map, locate the product in the queue, and send it one-way
    /// to the peer; a miss at either step sends a no-such-product notice
    /// instead. A transport failure destroys the outbound transport and
    /// marks the session done.
    pub fn handle_request_product(&mut self, index: u64) {
        debug!(self.log, "missed-product request"; "index" => index);

        if self.client.is_none() {
            error!(self.log, "peer hasn't subscribed yet");
            self.done = true;
            return;
        }

        if let Err(e) = self.find_and_send_product(index) {
            error!(self.log, "{}", e);
            self.client = None;
            self.done = true;
        }
    }

    fn find_and_send_product(
        &mut self,
        index: u64,
    ) -> Result<(), EngineError> {
        match self.send_product(index) {
            Err(EngineError::NoEnt(reason)) => {
                info!(self.log, "{}", reason);
                let client = self.client.as_mut().ok_or_else(|| {
                    EngineError::Logic(String::from(
                        "outbound transport isn't installed",
                    ))
                })?;
                client.no_such_product(index)
            }
            other => other,
        }
    }

    fn send_product(&mut self, index: u64) -> Result<(), EngineError> {
        let pim = self.pim.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from("product-index map isn't open"))
        })?;
        let sig = match pim.get(index) {
            Ok(sig) => sig,
            Err(PimError::NoEnt(_)) => {
                return Err(EngineError::NoEnt(format!(
                    "no signature in product-index map corresponding to \
                     index {}",
                    index
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let pq = self.pq.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from("product queue isn't open"))
        })?;
        let client = self.client.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from(
                "outbound transport isn't installed",
            ))
        })?;

        let send_result = pq.process_product(&sig, |info, data| {
            client.deliver_missed_product(&MissedProduct {
                index,
                product: Product {
                    info: info.clone(),
                    data: data.to_vec(),
                },
            })
        });

        match send_result {
            Ok(delivery) => {
                delivery?;
                info!(self.log, "missed product sent";
                    "index" => index, "signature" => %sig);
                Ok(())
            }
            Err(PqError::NotFound) => Err(EngineError::NoEnt(format!(
                "no data-product corresponding to signature {}: index={}",
                sig, index
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Serves a backlog request: position the queue cursor from the
    /// request, then replay every feed-matching product up to (but not
    /// including)
    /// the stop signature. Reaching end-of-queue first ends the backlog
    /// there; the session stays up.
    pub fn handle_request_backlog(&mut self, spec: &BacklogSpec) {
        debug!(self.log, "backlog request"; "before" => %spec.before);

        if self.client.is_none() {
            error!(self.log, "peer hasn't subscribed yet");
            self.done = true;
            return;
        }

        if let Err(e) = self.send_backlog(spec) {
            error!(self.log, "{}", e);
            self.client = None;
            self.done = true;
        }
    }

    fn send_backlog(&mut self, spec: &BacklogSpec) -> Result<(), EngineError> {
        self.set_queue_cursor(spec)?;

        let class = ProductClass::all().narrow_feed(self.feed);
        let pq = self.pq.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from("product queue isn't open"))
        })?;
        let client = self.client.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from(
                "outbound transport isn't installed",
            ))
        })?;

        loop {
            let step = pq.sequence(&class, |info, data| {
                if info.signature == spec.before {
                    BacklogStep::Stop
                } else {
                    let product = Product {
                        info: info.clone(),
                        data: data.to_vec(),
                    };
                    match client.deliver_backlog_product(&product) {
                        Ok(()) => BacklogStep::Sent,
                        Err(e) => BacklogStep::Failed(e),
                    }
                }
            })?;

            match step {
                None => {
                    info!(self.log,
                        "end-of-backlog product not found before \
                         end-of-queue");
                    return Ok(());
                }
                Some(BacklogStep::Stop) => return Ok(()),
                Some(BacklogStep::Sent) => (),
                Some(BacklogStep::Failed(e)) => return Err(e),
            }
        }
    }

    fn set_queue_cursor(&mut self, spec: &BacklogSpec) -> Result<(), EngineError> {
        let pq = self.pq.as_mut().ok_or_else(|| {
            EngineError::Logic(String::from("product queue isn't open"))
        })?;

        if let Some(after) = &spec.after {
            match pq.set_cursor_from_signature(after) {
                Ok(()) => return Ok(()),
                Err(PqError::NotFound) => {
                    info!(self.log,
                        "product with signature {} wasn't found in queue",
                        after);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let offset_secs =
            Duration::seconds(spec.time_offset.min(i64::max_value() as u64) as i64);
        let target = Utc::now()
            .checked_sub_signed(offset_secs)
            .filter(|t| t.timestamp() >= 0)
            .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH));
        pq.set_cursor_from_time(target)?;
        Ok(())
    }

    fn create_virtual_circuit(
        &mut self,
        feed: Feed,
        remote_vc_end: &VcEndPoint,
    ) -> Result<(), EngineError> {
        let description = format!("{} feed", feed);
        let circuit_id = vcircuit::provision(
            &self.config.workgroup,
            &description,
            &self.config.local_vc_end,
            remote_vc_end,
            &self.log,
        )?;
        self.circuit_id = Some(circuit_id);
        Ok(())
    }

    fn destroy_virtual_circuit(&mut self) {
        if let Some(circuit_id) = self.circuit_id.take() {
            vcircuit::remove(&self.config.workgroup, &circuit_id, &self.log);
        }
    }

    /// Idempotent.
    fn release_down_fmtp_addr(&mut self) {
        if !self.feed.is_none() && self.down_fmtp_addr != Ipv4Addr::UNSPECIFIED
        {
            self.manager.unsubscribe(self.feed, self.down_fmtp_addr);
            debug!(self.log, "address released";
                "addr" => %self.down_fmtp_addr);
            self.feed = Feed::NONE;
            self.down_fmtp_addr = Ipv4Addr::UNSPECIFIED;
        }
    }

    /// Opens the product queue on first use; later handshakes on the same
    /// engine instance reuse the open handle.
    fn ensure_product_queue_open(&mut self) -> Result<(), EngineError> {
        if self.pq.is_none() {
            let pq = ProductQueue::open(
                &self.config.queue_path,
                OpenMode::ReadOnly,
            )
            .map_err(|e| {
                EngineError::System(format!(
                    "couldn't open product-queue {:?}: {}",
                    self.config.queue_path, e
                ))
            })?;
            self.pq = Some(pq);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(self.log, "session tearing down");
        self.release_down_fmtp_addr();
        self.client = None;
        self.pim = None;
        self.destroy_virtual_circuit();
        self.pq = None;
    }
}

fn queue_parent(queue_path: &Path) -> &Path {
    queue_path.parent().unwrap_or_else(|| Path::new("."))
}
