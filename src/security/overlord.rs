//! Association table and handshake driver.
//!
//! The overlord owns every [`PeerSecAssociation`] of a node, answers the
//! cookie exchange statelessly, runs the certificate-authenticated DH
//! handshake and demultiplexes inbound frames.
//!
//! # Handshake
//!
//! ```text
//! Initiator                                        Responder
//!     |  Cookie {c_i}                                  |
//!     |----------------------------------------------->|  (no state)
//!     |  CookieResponse {c_r, echo c_i, CAs}           |
//!     |<-----------------------------------------------|
//!     |  DHEWithCertificateAndCAs {DHE, cert, CAs} sig |  request
//!     |----------------------------------------------->|  creates association
//!     |  DHEWithCertificate {DHE, cert} sig            |  reply
//!     |<-----------------------------------------------|
//!     |  Confirm {H(DHEWithCertificate)} sig           |  request
//!     |----------------------------------------------->|  enable
//!     |  Confirm {H(DHEWithCertificateAndCAs)} sig     |  reply
//!     |<-----------------------------------------------|
//!   enable                                             |
//! ```
//!
//! Every message but Cookie and NoSuchSA must echo the cookie this node
//! computed for the sender, so no association or certificate work happens
//! until the sender has proven it receives traffic at its address.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use super::association::{
    AssociationListener, PeerSecAssociation, SaState, SecureDataHandler, Transcript,
};
use super::certificate::{Certificate, CertificateHandler};
use super::policy::{SecurityPolicies, SecurityPolicy};
use crate::core::{
    COOKIE_SECRET_SIZE, CertificateError, DataHandler, DecodeError, HEARTBEAT_INTERVAL,
    PROTOCOL_VERSION, Peer, PolicyError, ReplyHandler, ReqrepFailure, ReqrepManager,
    RequestState, ReturnPath, SecurityError, SecurityResult,
};
use crate::wire::{
    CaId, ControlType, Cookie, DataHeader, PType, SecurityControlMessage, frame,
};

/// Callback fired when an association becomes Active or Closed.
pub type AnnounceCallback<P> = Arc<dyn Fn(&Arc<PeerSecAssociation<P>>, SaState) + Send + Sync>;

/// Overlord configuration.
#[derive(Debug, Clone)]
pub struct OverlordConfig {
    /// Refuse unrelated traffic arriving over edges without transport security.
    pub require_secure_edges: bool,

    /// Minimum spacing of inactivity sweeps driven by [`PeerSecOverlord::heartbeat`].
    pub heartbeat_interval: Duration,
}

impl Default for OverlordConfig {
    fn default() -> Self {
        Self {
            require_secure_edges: true,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Builder for creating a [`PeerSecOverlord`].
pub struct OverlordBuilder<P: Peer> {
    config: OverlordConfig,
    policies: Option<Arc<SecurityPolicies>>,
    certificates: Option<Arc<dyn CertificateHandler>>,
    signing_key: Option<SigningKey>,
    reqrep: Option<Arc<dyn ReqrepManager<P>>>,
}

impl<P: Peer> OverlordBuilder<P> {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: OverlordConfig::default(),
            policies: None,
            certificates: None,
            signing_key: None,
            reqrep: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: OverlordConfig) -> Self {
        self.config = config;
        self
    }

    /// Set whether insecure edges are refused.
    pub fn require_secure_edges(mut self, required: bool) -> Self {
        self.config.require_secure_edges = required;
        self
    }

    /// Set the inactivity sweep interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Share a policy registry. Defaults to a registry with SPI 0 only.
    pub fn policies(mut self, policies: Arc<SecurityPolicies>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Set the certificate handler.
    pub fn certificates(mut self, certificates: Arc<dyn CertificateHandler>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    /// Set the key matching this node's certificates.
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Set the reliability layer.
    pub fn reqrep(mut self, reqrep: Arc<dyn ReqrepManager<P>>) -> Self {
        self.reqrep = Some(reqrep);
        self
    }

    /// Build the overlord.
    pub fn build(self) -> SecurityResult<Arc<PeerSecOverlord<P>>> {
        let certificates = self
            .certificates
            .ok_or(SecurityError::Precondition("certificate handler not set"))?;
        let signing_key = self
            .signing_key
            .ok_or(SecurityError::Precondition("signing key not set"))?;
        let reqrep = self
            .reqrep
            .ok_or(SecurityError::Precondition("reliability layer not set"))?;
        let policies = self.policies.unwrap_or_default();

        let mut cookie_secret = Zeroizing::new([0u8; COOKIE_SECRET_SIZE]);
        OsRng.fill_bytes(&mut cookie_secret[..]);

        Ok(Arc::new_cyclic(|me| PeerSecOverlord {
            me: me.clone(),
            config: self.config,
            policies,
            certificates,
            signing_key,
            reqrep,
            cookie_secret,
            associations: Mutex::new(HashMap::new()),
            default_handler: RwLock::new(None),
            secure_handler: RwLock::new(None),
            announce: RwLock::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
        }))
    }
}

impl<P: Peer> Default for OverlordBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of a node's security associations.
///
/// Feed every inbound frame to [`DataHandler::handle_data`] and register the
/// overlord as the reply handler target of the reliability layer.
///
/// # Example
///
/// ```ignore
/// let overlord = OverlordBuilder::new()
///     .signing_key(key)
///     .certificates(store)
///     .reqrep(reqrep)
///     .build()?;
///
/// let sa = overlord.create_security_association(&peer, DEFAULT_SPI)?;
/// if sa.send(b"hello")? == SendStatus::NotReady {
///     // retry once the handshake completes
/// }
/// ```
pub struct PeerSecOverlord<P: Peer> {
    me: Weak<Self>,
    config: OverlordConfig,
    policies: Arc<SecurityPolicies>,
    certificates: Arc<dyn CertificateHandler>,
    signing_key: SigningKey,
    reqrep: Arc<dyn ReqrepManager<P>>,
    // Never rotated.
    cookie_secret: Zeroizing<[u8; COOKIE_SECRET_SIZE]>,
    associations: Mutex<HashMap<u32, HashMap<P, Arc<PeerSecAssociation<P>>>>>,
    default_handler: RwLock<Option<Arc<dyn DataHandler<P>>>>,
    secure_handler: RwLock<Option<Arc<dyn SecureDataHandler<P>>>>,
    announce: RwLock<Option<AnnounceCallback<P>>>,
    last_heartbeat: Mutex<Instant>,
}

impl<P: Peer> PeerSecOverlord<P> {
    /// Configuration in use.
    pub fn config(&self) -> &OverlordConfig {
        &self.config
    }

    /// Policy registry.
    pub fn policies(&self) -> &Arc<SecurityPolicies> {
        &self.policies
    }

    // =========================================================================
    // Association table
    // =========================================================================

    /// Association with `peer` under `spi`, creating it and starting the
    /// handshake if needed.
    pub fn create_security_association(
        &self,
        peer: &P,
        spi: u32,
    ) -> SecurityResult<Arc<PeerSecAssociation<P>>> {
        let (sa, created) = self.get_or_create(peer, spi)?;
        if created || sa.state() != SaState::Active {
            self.start_sa(&sa);
        }
        Ok(sa)
    }

    fn get_or_create(
        &self,
        peer: &P,
        spi: u32,
    ) -> SecurityResult<(Arc<PeerSecAssociation<P>>, bool)> {
        let policy = self.policies.get(spi)?;
        let timeout = self.reqrep.timeout();

        let sa = {
            let mut table = self.associations.lock();
            let by_peer = table.entry(spi).or_default();
            if let Some(existing) = by_peer.get(peer) {
                if !existing.is_closed() {
                    return Ok((Arc::clone(existing), false));
                }
            }
            let sa = PeerSecAssociation::new(peer.clone(), policy, timeout);
            let listener: Weak<dyn AssociationListener<P>> = self.me.clone();
            sa.set_listener(listener);
            by_peer.insert(peer.clone(), Arc::clone(&sa));
            sa
        };
        debug!(sa = %sa, "created security association");
        Ok((sa, true))
    }

    /// Live association with `peer` under `spi`.
    pub fn association(&self, peer: &P, spi: u32) -> Option<Arc<PeerSecAssociation<P>>> {
        self.associations
            .lock()
            .get(&spi)
            .and_then(|by_peer| by_peer.get(peer))
            .filter(|sa| !sa.is_closed())
            .cloned()
    }

    /// Snapshot of every association.
    pub fn associations(&self) -> Vec<Arc<PeerSecAssociation<P>>> {
        self.associations
            .lock()
            .values()
            .flat_map(|by_peer| by_peer.values().cloned())
            .collect()
    }

    /// Number of associations in the table.
    pub fn sa_count(&self) -> usize {
        self.associations.lock().values().map(HashMap::len).sum()
    }

    fn remove(&self, sa: &Arc<PeerSecAssociation<P>>) {
        let mut table = self.associations.lock();
        if let Some(by_peer) = table.get_mut(&sa.spi()) {
            if by_peer.get(sa.peer()).is_some_and(|entry| Arc::ptr_eq(entry, sa)) {
                by_peer.remove(sa.peer());
            }
            if by_peer.is_empty() {
                table.remove(&sa.spi());
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Deliver decrypted data of every association without its own subscriber
    /// to `handler`.
    pub fn subscribe_secure_data(&self, handler: Arc<dyn SecureDataHandler<P>>) {
        *self.secure_handler.write() = Some(Arc::clone(&handler));
        for sa in self.associations() {
            if sa.is_active() && !sa.has_subscriber() {
                sa.subscribe(Arc::clone(&handler));
            }
        }
    }

    /// Receiver of traffic that is not PeerSec's.
    pub fn set_default_handler(&self, handler: Arc<dyn DataHandler<P>>) {
        *self.default_handler.write() = Some(handler);
    }

    /// Call `callback` whenever an association becomes Active or Closed.
    pub fn on_announce(
        &self,
        callback: impl Fn(&Arc<PeerSecAssociation<P>>, SaState) + Send + Sync + 'static,
    ) {
        *self.announce.write() = Some(Arc::new(callback));
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Run [`sweep_inactive`](Self::sweep_inactive) if a heartbeat interval
    /// has passed since the last sweep. Returns the number of closed
    /// associations.
    pub fn heartbeat(&self, now: Instant) -> usize {
        {
            let mut last = self.last_heartbeat.lock();
            if now.saturating_duration_since(*last) < self.config.heartbeat_interval {
                return 0;
            }
            *last = now;
        }
        self.sweep_inactive()
    }

    /// Close associations idle since the previous sweep.
    pub fn sweep_inactive(&self) -> usize {
        let closed = self
            .associations()
            .into_iter()
            .filter(|sa| sa.check_state())
            .count();
        if closed > 0 {
            debug!(closed, remaining = self.sa_count(), "inactivity sweep");
        }
        closed
    }

    /// Close active associations whose remote certificate no longer verifies.
    pub fn check_certificates(&self) -> usize {
        let mut closed = 0;
        for sa in self.associations() {
            if !sa.is_active() {
                continue;
            }
            let Some(cert) = sa.remote_certificate() else {
                continue;
            };
            if let Err(e) = self.certificates.verify(&cert, &sa.peer().identity()) {
                warn!(sa = %sa, error = %e, "remote certificate no longer valid");
                if sa.close("certificate no longer valid") {
                    closed += 1;
                }
            }
        }
        closed
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Cookie this node expects `peer` to echo: `SHA1(secret || SHA1(identity))`.
    pub fn calculate_cookie(&self, peer: &P) -> Cookie {
        let mut hasher = Sha1::new();
        hasher.update(&self.cookie_secret[..]);
        hasher.update(Sha1::digest(peer.identity()));
        hasher.finalize().into()
    }

    /// Send a Cookie to open a handshake round for `sa`.
    ///
    /// The Cookie goes out as a reliable request; if it is never answered
    /// the round fails through [`ReplyHandler::handle_error`].
    pub fn start_sa(&self, sa: &Arc<PeerSecAssociation<P>>) {
        let mut msg = SecurityControlMessage::new(ControlType::Cookie, sa.spi());
        msg.local_cookie = self.calculate_cookie(sa.peer());
        debug!(sa = %sa, "starting handshake");
        if let Err(e) = self.send_control_request(sa.peer(), sa.spi(), &msg.encode()) {
            warn!(sa = %sa, error = %e, "failed to send cookie");
        }
    }

    /// Process a control message (type tags already removed).
    pub fn handle_control(&self, data: &[u8], return_path: &ReturnPath<P>) {
        let peer = return_path.peer();
        let msg = match SecurityControlMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(?peer, error = %e, "malformed control message");
                return;
            }
        };
        if let Err(e) = self.admit(&msg, peer) {
            warn!(?peer, spi = msg.spi, kind = ?msg.kind, error = %e, "rejected control message");
            return;
        }
        trace!(?peer, spi = msg.spi, kind = ?msg.kind, "control message");

        let sa = self.association(peer, msg.spi);
        let mut fresh_round = false;
        if matches!(
            msg.kind,
            ControlType::NoSuchSa
                | ControlType::Cookie
                | ControlType::CookieResponse
                | ControlType::DheWithCertificateAndCas
        ) {
            if let Some(sa) = &sa {
                fresh_round = sa.try_reset();
                if !fresh_round {
                    trace!(sa = %sa, "handshake round already in flight");
                }
            }
        }

        let result = match msg.kind {
            ControlType::Cookie => self.on_cookie(&msg, return_path),
            ControlType::CookieResponse => self.on_cookie_response(sa, &msg, peer),
            ControlType::DheWithCertificateAndCas => {
                self.on_dhe_with_certificate_and_cas(sa, &msg, data, return_path)
            }
            ControlType::DheWithCertificate => self.on_dhe_with_certificate(sa, &msg, data, peer),
            ControlType::Confirm => self.on_confirm(sa, &msg, return_path),
            ControlType::NoSuchSa => {
                self.on_no_such_sa(sa, fresh_round);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(?peer, spi = msg.spi, kind = ?msg.kind, error = %e, "handshake step failed");
            if matches!(
                msg.kind,
                ControlType::DheWithCertificateAndCas
                    | ControlType::DheWithCertificate
                    | ControlType::Confirm
            ) {
                self.send_no_such_sa(msg.spi, return_path);
            }
        }
    }

    fn admit(&self, msg: &SecurityControlMessage, peer: &P) -> SecurityResult<()> {
        if msg.version != PROTOCOL_VERSION {
            return Err(SecurityError::InvalidVersion(msg.version));
        }
        if !self.policies.supports(msg.spi) {
            return Err(PolicyError::UnsupportedSpi(msg.spi).into());
        }
        if !matches!(msg.kind, ControlType::Cookie | ControlType::NoSuchSa) {
            let expected = self.calculate_cookie(peer);
            if expected[..].ct_eq(&msg.remote_cookie[..]).unwrap_u8() != 1 {
                return Err(SecurityError::InvalidCookie);
            }
        }
        Ok(())
    }

    fn on_cookie(&self, msg: &SecurityControlMessage, return_path: &ReturnPath<P>) -> SecurityResult<()> {
        let policy = self.policies.get(msg.spi)?;
        let mut response = self.reply_to(return_path.peer(), msg, ControlType::CookieResponse);
        response.cas = self.offered_cas(&policy);
        self.send_control(&response.encode(), return_path)
    }

    fn on_cookie_response(
        &self,
        sa: Option<Arc<PeerSecAssociation<P>>>,
        msg: &SecurityControlMessage,
        peer: &P,
    ) -> SecurityResult<()> {
        let sa = sa.ok_or(SecurityError::NoAssociation)?;
        let local = self.local_certificate(sa.policy(), &msg.cas)?;
        sa.set_remote_cookie(msg.local_cookie)?;
        sa.set_local_certificate(local.clone())?;

        let mut out = self.reply_to(peer, msg, ControlType::DheWithCertificateAndCas);
        out.dhe = sa.ldhe().to_vec();
        out.certificate = local.encode();
        out.cas = self.offered_cas(sa.policy());
        out.sign(&self.signing_key);
        let bytes = out.encode();
        sa.set_transcript(Transcript::DheWithCertificateAndCasOut, transcript_hash(&bytes))?;

        debug!(sa = %sa, "sending DHEWithCertificateAndCAs");
        self.send_control_request(peer, msg.spi, &bytes)
    }

    fn on_dhe_with_certificate_and_cas(
        &self,
        sa: Option<Arc<PeerSecAssociation<P>>>,
        msg: &SecurityControlMessage,
        raw: &[u8],
        return_path: &ReturnPath<P>,
    ) -> SecurityResult<()> {
        let peer = return_path.peer();
        let remote = self.peer_certificate(msg, peer)?;
        let sa = match sa {
            Some(sa) => sa,
            None => self.get_or_create(peer, msg.spi)?.0,
        };
        let local = self.local_certificate(sa.policy(), &msg.cas)?;

        sa.set_remote_cookie(msg.local_cookie)?;
        sa.set_local_certificate(local.clone())?;
        sa.set_remote_certificate(remote)?;
        sa.set_rdhe(msg.dhe.clone())?;
        sa.set_transcript(Transcript::DheWithCertificateAndCasIn, transcript_hash(raw))?;

        let mut reply = self.reply_to(peer, msg, ControlType::DheWithCertificate);
        reply.dhe = sa.ldhe().to_vec();
        reply.certificate = local.encode();
        reply.sign(&self.signing_key);
        let bytes = reply.encode();
        sa.set_transcript(Transcript::DheWithCertificate, transcript_hash(&bytes))?;

        debug!(sa = %sa, "answering DHEWithCertificateAndCAs");
        self.send_control(&bytes, return_path)
    }

    fn on_dhe_with_certificate(
        &self,
        sa: Option<Arc<PeerSecAssociation<P>>>,
        msg: &SecurityControlMessage,
        raw: &[u8],
        peer: &P,
    ) -> SecurityResult<()> {
        let sa = sa.ok_or(SecurityError::NoAssociation)?;
        let remote = self.peer_certificate(msg, peer)?;
        sa.set_remote_certificate(remote)?;
        sa.set_rdhe(msg.dhe.clone())?;

        let mut confirm = self.reply_to(peer, msg, ControlType::Confirm);
        confirm.hash = transcript_hash(raw);
        confirm.sign(&self.signing_key);
        self.send_control_request(peer, msg.spi, &confirm.encode())
    }

    fn on_confirm(
        &self,
        sa: Option<Arc<PeerSecAssociation<P>>>,
        msg: &SecurityControlMessage,
        return_path: &ReturnPath<P>,
    ) -> SecurityResult<()> {
        let sa = sa.ok_or(SecurityError::NoAssociation)?;
        let remote = sa
            .remote_certificate()
            .ok_or(CertificateError::NoCertificate)?;
        msg.verify(&remote.public_key()?)?;

        match return_path {
            ReturnPath::Direct(_) => {
                sa.verify_response(&msg.hash)?;
                sa.enable()?;
            }
            ReturnPath::Request(_) => {
                sa.verify_request(&msg.hash)?;
                sa.enable()?;
                let mut reply = self.reply_to(return_path.peer(), msg, ControlType::Confirm);
                reply.hash = sa
                    .transcript(Transcript::DheWithCertificateAndCasIn)
                    .ok_or(SecurityError::HashNotSet)?;
                reply.sign(&self.signing_key);
                self.send_control(&reply.encode(), return_path)?;
            }
        }
        Ok(())
    }

    fn on_no_such_sa(&self, sa: Option<Arc<PeerSecAssociation<P>>>, fresh_round: bool) {
        let Some(sa) = sa else {
            trace!("NoSuchSA for unknown association");
            return;
        };
        if fresh_round {
            self.start_sa(&sa);
        } else {
            sa.request_update();
        }
    }

    fn send_no_such_sa(&self, spi: u32, return_path: &ReturnPath<P>) {
        let mut msg = SecurityControlMessage::new(ControlType::NoSuchSa, spi);
        msg.local_cookie = self.calculate_cookie(return_path.peer());
        if let Err(e) = self.send_control(&msg.encode(), return_path) {
            warn!(peer = ?return_path.peer(), spi, error = %e, "failed to send NoSuchSA");
        }
    }

    /// Skeleton of a message answering `msg` from `peer`.
    fn reply_to(
        &self,
        peer: &P,
        msg: &SecurityControlMessage,
        kind: ControlType,
    ) -> SecurityControlMessage {
        let mut out = SecurityControlMessage::new(kind, msg.spi);
        out.local_cookie = self.calculate_cookie(peer);
        out.remote_cookie = msg.local_cookie;
        out
    }

    fn offered_cas(&self, policy: &SecurityPolicy) -> Vec<CaId> {
        if policy.pre_exchanged_keys {
            Vec::new()
        } else {
            self.certificates.supported_cas()
        }
    }

    fn local_certificate(
        &self,
        policy: &SecurityPolicy,
        cas: &[CaId],
    ) -> Result<Certificate, CertificateError> {
        if policy.pre_exchanged_keys {
            self.certificates.default_certificate()
        } else {
            self.certificates.find_certificate(cas)
        }
    }

    /// Certificate carried by `msg`, after checking the message signature
    /// and the certificate itself.
    fn peer_certificate(&self, msg: &SecurityControlMessage, peer: &P) -> SecurityResult<Certificate> {
        let cert = Certificate::decode(&msg.certificate)?;
        msg.verify(&cert.public_key()?)?;
        self.certificates.verify(&cert, &peer.identity())?;
        Ok(cert)
    }

    fn send_control(&self, bytes: &[u8], return_path: &ReturnPath<P>) -> SecurityResult<()> {
        let data = control_frame(bytes);
        match return_path {
            ReturnPath::Direct(peer) => peer.send(data),
            ReturnPath::Request(ctx) => self.reqrep.send_reply(ctx, data),
        }
    }

    fn send_control_request(&self, peer: &P, spi: u32, bytes: &[u8]) -> SecurityResult<()> {
        let handler: Weak<dyn ReplyHandler<P>> = self.me.clone();
        let state: RequestState = Arc::new(spi);
        let id = self
            .reqrep
            .send_request(peer, control_frame(bytes), handler, state)?;
        trace!(?peer, spi, request_id = id, "control request sent");
        Ok(())
    }

    // =========================================================================
    // Data plane
    // =========================================================================

    fn handle_secure_data(&self, data: &[u8], return_path: &ReturnPath<P>) {
        let peer = return_path.peer();
        let header = match DataHeader::from_bytes(data) {
            Ok(header) => header,
            Err(e) => {
                warn!(?peer, error = %e, "malformed data message");
                return;
            }
        };
        let result = match self.association(peer, header.spi) {
            Some(sa) => sa.handle_data(data),
            None => Err(SecurityError::NoAssociation),
        };
        if let Err(e) = result {
            debug!(?peer, spi = header.spi, epoch = header.epoch, error = %e, "undeliverable data message");
            if self.policies.supports(header.spi) {
                self.send_no_such_sa(header.spi, return_path);
            }
        }
    }

    fn handle_foreign(&self, data: &[u8], return_path: &ReturnPath<P>) {
        if self.config.require_secure_edges && return_path.peer().is_insecure_edge() {
            warn!(peer = ?return_path.peer(), error = %SecurityError::InsecureEdge, "dropping traffic");
            return;
        }
        let handler = self.default_handler.read().clone();
        match handler {
            Some(handler) => handler.handle_data(data, return_path),
            None => trace!(peer = ?return_path.peer(), len = data.len(), "no default handler"),
        }
    }
}

impl<P: Peer> DataHandler<P> for PeerSecOverlord<P> {
    fn handle_data(&self, data: &[u8], return_path: &ReturnPath<P>) {
        let (ptype, body) = match PType::split(data) {
            Ok(split) => split,
            Err(e) => {
                trace!(peer = ?return_path.peer(), error = %e, "empty frame");
                return;
            }
        };
        match ptype {
            PType::Security => self.handle_data(body, return_path),
            PType::SecureData => self.handle_secure_data(body, return_path),
            PType::SecureControl => self.handle_control(body, return_path),
            PType::ReqRep => {
                if let Err(e) = self.reqrep.handle_data(body, return_path.peer()) {
                    warn!(peer = ?return_path.peer(), error = %e, "reliability layer rejected frame");
                }
            }
            PType::Other(_) => self.handle_foreign(data, return_path),
        }
    }
}

impl<P: Peer> ReplyHandler<P> for PeerSecOverlord<P> {
    fn handle_reply(&self, payload: &[u8], from: &P, _state: &RequestState) {
        match unwrap_security(payload) {
            Ok((PType::SecureControl, body)) => {
                self.handle_control(body, &ReturnPath::Direct(from.clone()))
            }
            Ok((other, _)) => warn!(peer = ?from, ptype = ?other, "unexpected reply type"),
            Err(e) => warn!(peer = ?from, error = %e, "malformed reply"),
        }
    }

    fn handle_error(&self, request_id: u32, failure: ReqrepFailure, peer: &P, state: &RequestState) {
        if self.reqrep.request_active(request_id) {
            return;
        }
        let Some(&spi) = state.downcast_ref::<u32>() else {
            return;
        };
        let Some(sa) = self.association(peer, spi) else {
            return;
        };
        if sa.state() == SaState::Active {
            trace!(sa = %sa, request_id, ?failure, "stale request failed");
            return;
        }
        debug!(sa = %sa, request_id, ?failure, "handshake request failed");
        sa.failure();
    }
}

impl<P: Peer> AssociationListener<P> for PeerSecOverlord<P> {
    fn state_changed(&self, sa: &Arc<PeerSecAssociation<P>>, state: SaState) {
        match state {
            SaState::Active => {
                if !sa.has_subscriber() {
                    if let Some(handler) = self.secure_handler.read().clone() {
                        sa.subscribe(handler);
                    }
                }
            }
            SaState::Closed => self.remove(sa),
            SaState::Waiting | SaState::Updating => return,
        }
        let announce = self.announce.read().clone();
        if let Some(announce) = announce {
            announce(sa, state);
        }
    }

    fn update_requested(&self, sa: &Arc<PeerSecAssociation<P>>) {
        // Requests are rate limited, so any round still in flight is at
        // least two timeouts old.
        match sa.force_reset() {
            Ok(()) => self.start_sa(sa),
            Err(e) => trace!(sa = %sa, error = %e, "update not started"),
        }
    }
}

fn control_frame(body: &[u8]) -> Vec<u8> {
    frame(&[PType::Security, PType::SecureControl], body)
}

fn transcript_hash(bytes: &[u8]) -> Vec<u8> {
    Sha1::digest(bytes).to_vec()
}

/// Peel any number of Security wrappers.
fn unwrap_security(mut data: &[u8]) -> Result<(PType, &[u8]), DecodeError> {
    loop {
        let (ptype, body) = PType::split(data)?;
        if ptype != PType::Security {
            return Ok((ptype, body));
        }
        data = body;
    }
}
