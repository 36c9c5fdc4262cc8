//! Core traits for PeerSec.
//!
//! These traits describe the collaborators the secure-session layer is
//! embedded in: the peer transport, the reliable request/reply layer and
//! whatever consumes traffic the overlord does not own.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::error::SecurityResult;

/// A remote endpoint a security association is bound to.
///
/// The value is used as a table key and as input to cookie computation, so
/// equality and hashing must be stable for the lifetime of the connection.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// struct UdpPeer { addr: SocketAddr, socket: Arc<UdpSocket> }
///
/// impl Peer for UdpPeer {
///     fn send(&self, data: Vec<u8>) -> SecurityResult<()> {
///         self.socket.send_to(&data, self.addr)
///             .map(|_| ())
///             .map_err(|e| SecurityError::Transport(e.to_string()))
///     }
///
///     fn identity(&self) -> Vec<u8> {
///         self.addr.to_string().into_bytes()
///     }
/// }
/// ```
pub trait Peer: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Transmit raw bytes to the peer.
    fn send(&self, data: Vec<u8>) -> SecurityResult<()>;

    /// Stable identity of the remote party.
    ///
    /// Certificates presented by the peer must name this identity as subject.
    fn identity(&self) -> Vec<u8>;

    /// Whether the underlying edge provides no transport security of its own.
    fn is_insecure_edge(&self) -> bool {
        false
    }
}

/// Reply context for a request delivered by the reliability layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext<P> {
    /// Peer that issued the request.
    pub peer: P,
    /// Request id to answer.
    pub request_id: u32,
}

/// Where to send an answer to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnPath<P> {
    /// Message arrived directly from the peer (or as a reply).
    Direct(P),
    /// Message arrived as a reliable request and expects a reply.
    Request(ReplyContext<P>),
}

impl<P> ReturnPath<P> {
    /// The remote peer on the other end of this path.
    pub fn peer(&self) -> &P {
        match self {
            Self::Direct(peer) => peer,
            Self::Request(ctx) => &ctx.peer,
        }
    }

    /// Returns true when this path answers a pending request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Opaque caller state handed back with a reply or failure.
pub type RequestState = Arc<dyn Any + Send + Sync>;

/// Why a reliable request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqrepFailure {
    /// Retry budget exhausted without a reply.
    Timeout,
    /// Remote reported it cannot handle the request.
    Rejected,
}

/// Receiver of reliable-request outcomes.
pub trait ReplyHandler<P: Peer>: Send + Sync {
    /// A reply arrived for a request issued with `state`.
    fn handle_reply(&self, payload: &[u8], from: &P, state: &RequestState);

    /// The request identified by `request_id` failed.
    ///
    /// The reliability layer may still have retries in flight for the same
    /// logical exchange; check [`ReqrepManager::request_active`].
    fn handle_error(&self, request_id: u32, failure: ReqrepFailure, peer: &P, state: &RequestState);
}

/// Reliable request/reply messaging with retransmission.
pub trait ReqrepManager<P: Peer>: Send + Sync {
    /// Send `payload` as a reliable request. Returns the request id.
    fn send_request(
        &self,
        peer: &P,
        payload: Vec<u8>,
        handler: Weak<dyn ReplyHandler<P>>,
        state: RequestState,
    ) -> SecurityResult<u32>;

    /// Answer a request previously delivered with `ctx`.
    fn send_reply(&self, ctx: &ReplyContext<P>, payload: Vec<u8>) -> SecurityResult<()>;

    /// Whether the request is still awaiting a reply.
    fn request_active(&self, request_id: u32) -> bool;

    /// Feed an inbound reliability-layer frame (tag already removed).
    fn handle_data(&self, payload: &[u8], from: &P) -> SecurityResult<()>;

    /// Base retransmission timeout.
    fn timeout(&self) -> Duration;
}

/// Consumer of plain inbound traffic.
pub trait DataHandler<P: Peer>: Send + Sync {
    /// Handle `data` received over `return_path`.
    fn handle_data(&self, data: &[u8], return_path: &ReturnPath<P>);
}
