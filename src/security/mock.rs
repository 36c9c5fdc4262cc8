//! In-memory network and reliability layer for tests.
//!
//! Nodes attach to a [`MockNet`] by id. Frames are delivered synchronously
//! by default; in queued mode they wait for [`MockNet::pump`], which lets
//! tests interleave both sides of a handshake.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;

use super::association::{AssociationListener, PeerSecAssociation, SaState, SecureDataHandler};
use super::certificate::{Certificate, CertificateStore};
use super::overlord::{OverlordBuilder, PeerSecOverlord};
use crate::core::{
    DataHandler, DecodeError, PTYPE_REQREP, Peer, ReplyContext, ReplyHandler, ReqrepFailure,
    ReqrepManager, RequestState, ReturnPath, SecurityResult,
};

const MAX_PUMP: usize = 100_000;

fn identity(id: u32) -> Vec<u8> {
    format!("node-{id}").into_bytes()
}

// =============================================================================
// Network
// =============================================================================

/// Shared in-memory network.
#[derive(Default)]
pub struct MockNet {
    nodes: RwLock<HashMap<u32, Weak<dyn DataHandler<MockPeer>>>>,
    queue: Mutex<VecDeque<(u32, MockPeer, Vec<u8>)>>,
    queued: AtomicBool,
    duplicate: AtomicBool,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, id: u32, node: Weak<dyn DataHandler<MockPeer>>) {
        self.nodes.write().insert(id, node);
    }

    /// Hold frames until [`pump`](Self::pump).
    pub fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    /// Deliver every frame twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.duplicate.store(duplicate, Ordering::SeqCst);
    }

    /// Deliver queued frames until none are left.
    pub fn pump(&self) {
        for _ in 0..MAX_PUMP {
            let next = self.queue.lock().pop_front();
            match next {
                Some((to, from, data)) => self.dispatch(to, &from, &data),
                None => return,
            }
        }
        panic!("network did not settle");
    }

    fn deliver(self: &Arc<Self>, from: u32, to: u32, insecure: bool, data: Vec<u8>) {
        let sender = MockPeer {
            from: to,
            to: from,
            insecure,
            net: Arc::clone(self),
        };
        let copies = if self.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
        if self.queued.load(Ordering::SeqCst) {
            let mut queue = self.queue.lock();
            for _ in 0..copies {
                queue.push_back((to, sender.clone(), data.clone()));
            }
        } else {
            for _ in 0..copies {
                self.dispatch(to, &sender, &data);
            }
        }
    }

    fn dispatch(&self, to: u32, from: &MockPeer, data: &[u8]) {
        let node = self.nodes.read().get(&to).and_then(Weak::upgrade);
        if let Some(node) = node {
            node.handle_data(data, &ReturnPath::Direct(from.clone()));
        }
    }
}

/// View of node `to` from node `from`.
#[derive(Clone)]
pub struct MockPeer {
    pub from: u32,
    pub to: u32,
    insecure: bool,
    net: Arc<MockNet>,
}

impl MockPeer {
    /// Same peer, reached over an edge without transport security.
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

impl PartialEq for MockPeer {
    fn eq(&self, other: &Self) -> bool {
        (self.from, self.to) == (other.from, other.to)
    }
}

impl Eq for MockPeer {}

impl Hash for MockPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.from, self.to).hash(state);
    }
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

impl Peer for MockPeer {
    fn send(&self, data: Vec<u8>) -> SecurityResult<()> {
        self.net.deliver(self.from, self.to, self.insecure, data);
        Ok(())
    }

    fn identity(&self) -> Vec<u8> {
        identity(self.to)
    }

    fn is_insecure_edge(&self) -> bool {
        self.insecure
    }
}

// =============================================================================
// Reliability layer
// =============================================================================

const REQUEST: u8 = 0;
const REPLY: u8 = 1;

struct Pending {
    peer: MockPeer,
    payload: Vec<u8>,
    handler: Weak<dyn ReplyHandler<MockPeer>>,
    state: RequestState,
}

/// Request/reply layer with duplicate suppression and manual timeouts.
///
/// Frame: `['r'][kind][id:4][payload]`.
pub struct MockReqrep {
    timeout: Duration,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
    // (requester, id) -> reply, None while the request is being handled
    served: Mutex<HashMap<(u32, u32), Option<Vec<u8>>>>,
    target: RwLock<Option<Weak<dyn DataHandler<MockPeer>>>>,
}

impl MockReqrep {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            served: Mutex::new(HashMap::new()),
            target: RwLock::new(None),
        })
    }

    /// Deliver inbound requests to `target`.
    pub fn bind(&self, target: Weak<dyn DataHandler<MockPeer>>) {
        *self.target.write() = Some(target);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every outstanding request. Returns how many there were.
    pub fn fire_timeouts(&self) -> usize {
        let expired: Vec<_> = self.pending.lock().drain().collect();
        let count = expired.len();
        for (id, pending) in expired {
            if let Some(handler) = pending.handler.upgrade() {
                handler.handle_error(id, ReqrepFailure::Timeout, &pending.peer, &pending.state);
            }
        }
        count
    }

    /// Resend every outstanding request under its original id.
    pub fn retransmit(&self) -> SecurityResult<usize> {
        let frames: Vec<_> = self
            .pending
            .lock()
            .iter()
            .map(|(id, pending)| (pending.peer.clone(), Self::encode(REQUEST, *id, &pending.payload)))
            .collect();
        let count = frames.len();
        for (peer, frame) in frames {
            peer.send(frame)?;
        }
        Ok(count)
    }

    /// Whether a reply went out for request `id` from node `requester`.
    pub fn replied(&self, requester: u32, id: u32) -> bool {
        matches!(self.served.lock().get(&(requester, id)), Some(Some(_)))
    }

    fn encode(kind: u8, id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + payload.len());
        out.push(PTYPE_REQREP);
        out.push(kind);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

impl ReqrepManager<MockPeer> for MockReqrep {
    fn send_request(
        &self,
        peer: &MockPeer,
        payload: Vec<u8>,
        handler: Weak<dyn ReplyHandler<MockPeer>>,
        state: RequestState,
    ) -> SecurityResult<u32> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Self::encode(REQUEST, id, &payload);
        self.pending.lock().insert(
            id,
            Pending {
                peer: peer.clone(),
                payload,
                handler,
                state,
            },
        );
        peer.send(frame)?;
        Ok(id)
    }

    fn send_reply(&self, ctx: &ReplyContext<MockPeer>, payload: Vec<u8>) -> SecurityResult<()> {
        let frame = Self::encode(REPLY, ctx.request_id, &payload);
        self.served
            .lock()
            .insert((ctx.peer.to, ctx.request_id), Some(frame.clone()));
        ctx.peer.send(frame)
    }

    fn request_active(&self, request_id: u32) -> bool {
        self.pending.lock().contains_key(&request_id)
    }

    fn handle_data(&self, payload: &[u8], from: &MockPeer) -> SecurityResult<()> {
        if payload.len() < 5 {
            return Err(DecodeError::UnexpectedEof.into());
        }
        let kind = payload[0];
        let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let body = &payload[5..];

        match kind {
            REQUEST => {
                let key = (from.to, id);
                let seen = {
                    let mut served = self.served.lock();
                    match served.get(&key) {
                        Some(reply) => Some(reply.clone()),
                        None => {
                            served.insert(key, None);
                            None
                        }
                    }
                };
                match seen {
                    Some(Some(reply)) => from.send(reply),
                    Some(None) => Ok(()),
                    None => {
                        let target = self.target.read().as_ref().and_then(Weak::upgrade);
                        if let Some(target) = target {
                            let ctx = ReplyContext {
                                peer: from.clone(),
                                request_id: id,
                            };
                            target.handle_data(body, &ReturnPath::Request(ctx));
                        }
                        Ok(())
                    }
                }
            }
            REPLY => {
                let pending = self.pending.lock().remove(&id);
                if let Some(pending) = pending {
                    if let Some(handler) = pending.handler.upgrade() {
                        handler.handle_reply(body, from, &pending.state);
                    }
                }
                Ok(())
            }
            other => Err(DecodeError::UnknownPType(other).into()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

// =============================================================================
// Nodes and recorders
// =============================================================================

/// Records delivered payloads with the id of the sending node.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(Vec<u8>, u32)>>,
}

impl RecordingHandler {
    pub fn last(&self) -> Option<(Vec<u8>, u32)> {
        self.seen.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecureDataHandler<MockPeer> for RecordingHandler {
    fn handle_secure_data(&self, data: &[u8], sa: &Arc<PeerSecAssociation<MockPeer>>) {
        self.seen.lock().push((data.to_vec(), sa.peer().to));
    }
}

impl DataHandler<MockPeer> for RecordingHandler {
    fn handle_data(&self, data: &[u8], return_path: &ReturnPath<MockPeer>) {
        self.seen.lock().push((data.to_vec(), return_path.peer().to));
    }
}

/// An overlord wired to a [`MockNet`].
pub struct MockNode {
    pub id: u32,
    pub net: Arc<MockNet>,
    pub overlord: Arc<PeerSecOverlord<MockPeer>>,
    pub reqrep: Arc<MockReqrep>,
    pub certificates: Arc<CertificateStore>,
    pub certificate: Certificate,
    pub key: SigningKey,
    pub received: Arc<RecordingHandler>,
    pub foreign: Arc<RecordingHandler>,
}

impl MockNode {
    /// Node `id` holding a certificate for itself issued by `ca`.
    pub fn join(net: &Arc<MockNet>, id: u32, ca: &SigningKey) -> Self {
        Self::build(net, id, &identity(id), ca, |builder| builder)
    }

    /// Node `id` whose certificate names `subject`.
    pub fn join_as(net: &Arc<MockNet>, id: u32, subject: &[u8], ca: &SigningKey) -> Self {
        Self::build(net, id, subject, ca, |builder| builder)
    }

    /// Node `id` with extra builder settings.
    pub fn join_with(
        net: &Arc<MockNet>,
        id: u32,
        ca: &SigningKey,
        configure: impl FnOnce(OverlordBuilder<MockPeer>) -> OverlordBuilder<MockPeer>,
    ) -> Self {
        Self::build(net, id, &identity(id), ca, configure)
    }

    fn build(
        net: &Arc<MockNet>,
        id: u32,
        subject: &[u8],
        ca: &SigningKey,
        configure: impl FnOnce(OverlordBuilder<MockPeer>) -> OverlordBuilder<MockPeer>,
    ) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let certificate = Certificate::issue(subject, &key.verifying_key(), ca);
        let certificates = Arc::new(CertificateStore::new());
        certificates.add_ca(ca.verifying_key());
        certificates.add_certificate(certificate.clone());

        let reqrep = MockReqrep::new(Duration::from_secs(1));
        let overlord = configure(
            OverlordBuilder::new()
                .signing_key(key.clone())
                .certificates(certificates.clone())
                .reqrep(reqrep.clone()),
        )
        .build()
        .unwrap();

        let weak = Arc::downgrade(&overlord);
        let target: Weak<dyn DataHandler<MockPeer>> = weak;
        reqrep.bind(target.clone());
        net.attach(id, target);

        let received = Arc::new(RecordingHandler::default());
        let foreign = Arc::new(RecordingHandler::default());
        overlord.subscribe_secure_data(received.clone());
        overlord.set_default_handler(foreign.clone());

        Self {
            id,
            net: Arc::clone(net),
            overlord,
            reqrep,
            certificates,
            certificate,
            key,
            received,
            foreign,
        }
    }

    /// This node's view of node `to`.
    pub fn peer(&self, to: u32) -> MockPeer {
        MockPeer {
            from: self.id,
            to,
            insecure: false,
            net: Arc::clone(&self.net),
        }
    }
}

// =============================================================================
// Association-level helpers
// =============================================================================

/// Peer that keeps every frame sent to it.
#[derive(Clone)]
pub struct RecordingPeer {
    id: u32,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingPeer {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl PartialEq for RecordingPeer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RecordingPeer {}

impl Hash for RecordingPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RecordingPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordingPeer({})", self.id)
    }
}

impl Peer for RecordingPeer {
    fn send(&self, data: Vec<u8>) -> SecurityResult<()> {
        self.sent.lock().push(data);
        Ok(())
    }

    fn identity(&self) -> Vec<u8> {
        identity(self.id)
    }
}

/// Listener counting update requests and recording state changes.
#[derive(Default)]
pub struct CountingListener {
    updates: AtomicUsize,
    states: Mutex<Vec<SaState>>,
}

impl CountingListener {
    pub fn attach<P: Peer>(sa: &Arc<PeerSecAssociation<P>>) -> Arc<Self> {
        let listener = Arc::new(Self::default());
        let weak = Arc::downgrade(&listener);
        let weak: Weak<dyn AssociationListener<P>> = weak;
        sa.set_listener(weak);
        listener
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn states(&self) -> Vec<SaState> {
        self.states.lock().clone()
    }
}

impl<P: Peer> AssociationListener<P> for CountingListener {
    fn state_changed(&self, _sa: &Arc<PeerSecAssociation<P>>, state: SaState) {
        self.states.lock().push(state);
    }

    fn update_requested(&self, _sa: &Arc<PeerSecAssociation<P>>) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}
