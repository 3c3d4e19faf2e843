//! DNS-01 challenge responder
//!
//! Serves the TXT values of the challenges that are currently being
//! validated. The CA delegates `_acme-challenge.<domain>` to this host and
//! queries it while an order's authorizations are pending.
//!
//! Only one set of records is hosted at a time: [`DnsResponder::start`]
//! waits for the previous [`ResponderHandle`] to be stopped or dropped, so
//! targets renewing concurrently take turns.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default listen address, the standard DNS port on all interfaces.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:53";

/// Largest datagram accepted (EDNS sized).
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("failed to bind dns responder on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("dns responder socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Owner of the challenge DNS listener.
///
/// Cloning shares the same exclusivity gate.
#[derive(Debug, Clone)]
pub struct DnsResponder {
    listen: SocketAddr,
    gate: Arc<Mutex<()>>,
}

impl DnsResponder {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a handle is currently active.
    pub fn is_hosting(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Start answering with `records`.
    ///
    /// Waits until no other handle is active, then binds the UDP socket.
    /// The records stay served until the returned handle is stopped.
    pub async fn start(&self, records: Vec<String>) -> Result<ResponderHandle, DnsError> {
        let guard = Arc::clone(&self.gate).lock_owned().await;

        let socket = UdpSocket::bind(self.listen)
            .await
            .map_err(|source| DnsError::Bind {
                addr: self.listen,
                source,
            })?;
        let local_addr = socket.local_addr()?;

        info!(
            listen = %local_addr,
            records = records.len(),
            "Started dns-01 challenge responder"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listener = Listener {
            socket,
            _guard: guard,
        };
        let task = tokio::spawn(serve(listener, Arc::new(records), shutdown_rx));

        Ok(ResponderHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A running responder. Stopping (or dropping) it releases the listener and
/// lets the next [`DnsResponder::start`] proceed.
#[derive(Debug)]
pub struct ResponderHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Socket and gate owned by the serve task. Fields drop in order, so the
/// gate opens only after the socket is closed.
struct Listener {
    socket: UdpSocket,
    _guard: OwnedMutexGuard<()>,
}

impl ResponderHandle {
    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the listener down and wait until it has exited.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "dns responder task ended abnormally");
            }
        }
        info!(listen = %self.local_addr, "Stopped dns-01 challenge responder");
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(listen = %self.local_addr, "Aborted dns-01 challenge responder");
        }
    }
}

async fn serve(listener: Listener, records: Arc<Vec<String>>, mut shutdown: oneshot::Receiver<()>) {
    let socket = &listener.socket;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "dns responder receive failed");
                        continue;
                    }
                };

                let Some(reply) = answer(&buf[..len], &records) else {
                    trace!(peer = %peer, "Ignoring malformed dns datagram");
                    continue;
                };
                if let Err(e) = socket.send_to(&reply, peer).await {
                    debug!(peer = %peer, error = %e, "Failed to send dns reply");
                }
            }
        }
    }
}

/// Build the reply to one query datagram.
///
/// Every question of a standard query is answered with one TXT record per
/// value, owned by the question's own name, TTL 0. Other opcodes get a reply
/// without answers. Returns `None` when the datagram cannot be parsed.
pub fn answer(datagram: &[u8], records: &[String]) -> Option<Vec<u8>> {
    let query = Message::from_bytes(datagram).ok()?;

    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_authoritative(true)
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(query.queries().to_vec());

    if query.op_code() == OpCode::Query {
        for question in query.queries() {
            trace!(name = %question.name(), "Answering challenge query");
            for value in records {
                reply.add_answer(Record::from_rdata(
                    question.name().clone(),
                    0,
                    RData::TXT(TXT::new(vec![value.clone()])),
                ));
            }
        }
    }

    reply.to_bytes().ok()
}
