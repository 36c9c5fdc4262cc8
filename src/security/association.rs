//! A secured channel to one peer under one SPI.
//!
//! The association owns the state of the current handshake round (the
//! set-once cells filled in by the overlord as messages arrive), derives
//! session keys once both DH halves and a verified transcript hash are
//! present, and seals or opens application frames with the active keys.
//!
//! # State machine
//!
//! ```text
//!            enable                    reset
//! Waiting ───────────▶ Active ◀────────────────▶ Updating
//!    │                   │        enable            │
//!    └───────────────────┴──────────┬───────────────┘
//!                                   │ close
//!                                   ▼
//!                                 Closed
//! ```
//!
//! While Updating the previous keys stay in use, so traffic keeps flowing
//! during a rekey.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::certificate::Certificate;
use super::policy::SecurityPolicy;
use crate::core::{Peer, SecurityError, SecurityResult, UPDATE_REQUEST_FACTOR};
use crate::crypto::{
    EphemeralKeypair, FireOnce, KeyOrder, SecurityHandler, SymmetricEncryption,
    WriteOnceIdempotent, derive_session_keys,
};
use crate::wire::{Cookie, PType, SecurityDataMessage, frame};

/// Association lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaState {
    /// Never completed a handshake.
    Waiting,
    /// Renegotiating; previous keys still active.
    Updating,
    /// Keys installed.
    Active,
    /// Terminal.
    Closed,
}

/// Outcome of [`PeerSecAssociation::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Frame handed to the peer.
    Sent,
    /// No keys yet; an update was requested. Retry later.
    NotReady,
}

/// Transcript hashes stored during a handshake round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transcript {
    /// Hash of the DHEWithCertificateAndCAs this side sent.
    DheWithCertificateAndCasOut,
    /// Hash of the DHEWithCertificateAndCAs this side received.
    DheWithCertificateAndCasIn,
    /// Hash of the DHEWithCertificate this side sent.
    DheWithCertificate,
}

/// Receiver of decrypted application data.
pub trait SecureDataHandler<P: Peer>: Send + Sync {
    /// `data` arrived over `sa`.
    fn handle_secure_data(&self, data: &[u8], sa: &Arc<PeerSecAssociation<P>>);
}

/// Observer of association events, normally the overlord.
pub trait AssociationListener<P: Peer>: Send + Sync {
    /// `sa` moved to `state`.
    fn state_changed(&self, sa: &Arc<PeerSecAssociation<P>>, state: SaState);

    /// `sa` wants a new handshake round.
    fn update_requested(&self, sa: &Arc<PeerSecAssociation<P>>);
}

/// Cells for one handshake round. Replaced wholesale by `reset`.
struct Handshake {
    local_certificate: WriteOnceIdempotent<Certificate>,
    remote_certificate: WriteOnceIdempotent<Certificate>,
    rdhe: WriteOnceIdempotent<Vec<u8>>,
    remote_cookie: WriteOnceIdempotent<Cookie>,
    out_hash: WriteOnceIdempotent<Vec<u8>>,
    in_hash: WriteOnceIdempotent<Vec<u8>>,
    dhe_with_certificate_hash: WriteOnceIdempotent<Vec<u8>>,
}

impl Handshake {
    fn new() -> Self {
        Self {
            local_certificate: WriteOnceIdempotent::new("local certificate"),
            remote_certificate: WriteOnceIdempotent::new("remote certificate"),
            rdhe: WriteOnceIdempotent::new("remote DHE"),
            remote_cookie: WriteOnceIdempotent::new("remote cookie"),
            out_hash: WriteOnceIdempotent::new("DHEWithCertificateAndCAs out hash"),
            in_hash: WriteOnceIdempotent::new("DHEWithCertificateAndCAs in hash"),
            dhe_with_certificate_hash: WriteOnceIdempotent::new("DHEWithCertificate hash"),
        }
    }

    fn transcript(&self, which: Transcript) -> &WriteOnceIdempotent<Vec<u8>> {
        match which {
            Transcript::DheWithCertificateAndCasOut => &self.out_hash,
            Transcript::DheWithCertificateAndCasIn => &self.in_hash,
            Transcript::DheWithCertificate => &self.dhe_with_certificate_hash,
        }
    }
}

struct Inner {
    state: SaState,
    /// A handshake round is in flight.
    running: bool,
    called_enable: bool,
    hash_verified: bool,
    keypair: Option<EphemeralKeypair>,
    ldhe: Option<Vec<u8>>,
    handshake: Handshake,
    current_epoch: u16,
    last_epoch: u16,
    handler: Option<SecurityHandler>,
    last_update: Instant,
    last_update_request: Instant,
}

impl Inner {
    fn local_dhe(&mut self) -> &[u8] {
        if self.ldhe.is_none() {
            let keypair = EphemeralKeypair::generate();
            self.ldhe = Some(keypair.public_bytes().to_vec());
            self.keypair = Some(keypair);
        }
        self.ldhe.as_deref().unwrap_or_default()
    }
}

/// Security association with one peer under one SPI.
pub struct PeerSecAssociation<P: Peer> {
    peer: P,
    spi: u32,
    policy: Arc<SecurityPolicy>,
    timeout: Duration,
    inner: Mutex<Inner>,
    closed: FireOnce,
    active: AtomicBool,
    sending: AtomicBool,
    receiving: AtomicBool,
    listener: RwLock<Option<Weak<dyn AssociationListener<P>>>>,
    subscriber: RwLock<Option<Arc<dyn SecureDataHandler<P>>>>,
}

impl<P: Peer> PeerSecAssociation<P> {
    /// New association in the Waiting state with a fresh handshake round.
    ///
    /// `timeout` is the reliability layer's timeout; update requests are
    /// spaced at least twice that far apart.
    pub fn new(peer: P, policy: Arc<SecurityPolicy>, timeout: Duration) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            peer,
            spi: policy.index,
            policy,
            timeout,
            inner: Mutex::new(Inner {
                state: SaState::Waiting,
                running: true,
                called_enable: false,
                hash_verified: false,
                keypair: None,
                ldhe: None,
                handshake: Handshake::new(),
                current_epoch: 0,
                last_epoch: 0,
                handler: None,
                last_update: now,
                last_update_request: now,
            }),
            closed: FireOnce::new(),
            active: AtomicBool::new(false),
            sending: AtomicBool::new(true),
            receiving: AtomicBool::new(true),
            listener: RwLock::new(None),
            subscriber: RwLock::new(None),
        })
    }

    /// Remote peer.
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Security parameter index.
    pub fn spi(&self) -> u32 {
        self.spi
    }

    /// Policy selected by the SPI.
    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SaState {
        self.inner.lock().state
    }

    /// Whether session keys are installed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the association was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.has_fired()
    }

    /// Epoch of the installed keys.
    pub fn current_epoch(&self) -> u16 {
        self.inner.lock().current_epoch
    }

    /// Epoch of the keys replaced by the last `enable`.
    pub fn last_epoch(&self) -> u16 {
        self.inner.lock().last_epoch
    }

    /// Time of the last reset or enable.
    pub fn last_update(&self) -> Instant {
        self.inner.lock().last_update
    }

    /// Whether the current round's transcript hash was verified.
    pub fn hash_verified(&self) -> bool {
        self.inner.lock().hash_verified
    }

    pub(crate) fn set_listener(&self, listener: Weak<dyn AssociationListener<P>>) {
        *self.listener.write() = Some(listener);
    }

    /// Deliver decrypted data to `handler`.
    pub fn subscribe(&self, handler: Arc<dyn SecureDataHandler<P>>) {
        *self.subscriber.write() = Some(handler);
    }

    /// Whether a data handler is attached.
    pub fn has_subscriber(&self) -> bool {
        self.subscriber.read().is_some()
    }

    // =========================================================================
    // Handshake cells
    // =========================================================================

    fn with_round<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> SecurityResult<T>,
    ) -> SecurityResult<T> {
        if self.is_closed() {
            return Err(SecurityError::Closed);
        }
        f(&mut *self.inner.lock())
    }

    /// Local ephemeral DH value, generated on first read in each round.
    pub fn ldhe(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.inner.lock().local_dhe().to_vec())
    }

    /// Remote ephemeral DH value.
    pub fn rdhe(&self) -> Option<Vec<u8>> {
        self.inner.lock().handshake.rdhe.get().cloned()
    }

    /// Store the remote ephemeral DH value.
    pub fn set_rdhe(&self, value: Vec<u8>) -> SecurityResult<()> {
        self.with_round(|inner| inner.handshake.rdhe.set(value))
    }

    /// Cookie the peer issued for us.
    pub fn remote_cookie(&self) -> Option<Cookie> {
        self.inner.lock().handshake.remote_cookie.get().copied()
    }

    /// Store the cookie the peer issued for us.
    pub fn set_remote_cookie(&self, cookie: Cookie) -> SecurityResult<()> {
        self.with_round(|inner| inner.handshake.remote_cookie.set(cookie))
    }

    /// Certificate this side presents.
    pub fn local_certificate(&self) -> Option<Certificate> {
        self.inner.lock().handshake.local_certificate.get().cloned()
    }

    /// Store the certificate this side presents.
    pub fn set_local_certificate(&self, cert: Certificate) -> SecurityResult<()> {
        self.with_round(|inner| inner.handshake.local_certificate.set(cert))
    }

    /// Certificate the peer presented.
    pub fn remote_certificate(&self) -> Option<Certificate> {
        self.inner.lock().handshake.remote_certificate.get().cloned()
    }

    /// Store the certificate the peer presented.
    pub fn set_remote_certificate(&self, cert: Certificate) -> SecurityResult<()> {
        self.with_round(|inner| inner.handshake.remote_certificate.set(cert))
    }

    /// A stored transcript hash.
    pub fn transcript(&self, which: Transcript) -> Option<Vec<u8>> {
        self.inner.lock().handshake.transcript(which).get().cloned()
    }

    /// Store a transcript hash.
    pub fn set_transcript(&self, which: Transcript, hash: Vec<u8>) -> SecurityResult<()> {
        self.with_round(|inner| inner.handshake.transcript(which).set(hash))
    }

    fn verify_hash(&self, which: Transcript, hash: &[u8]) -> SecurityResult<()> {
        self.with_round(|inner| {
            let stored = inner.handshake.transcript(which).get().ok_or(SecurityError::HashNotSet)?;
            if stored.ct_eq(hash).unwrap_u8() != 1 {
                return Err(SecurityError::HashMismatch);
            }
            inner.hash_verified = true;
            Ok(())
        })
    }

    /// Check a Confirm answering our DHEWithCertificateAndCAs.
    pub fn verify_response(&self, hash: &[u8]) -> SecurityResult<()> {
        self.verify_hash(Transcript::DheWithCertificateAndCasOut, hash)
    }

    /// Check a Confirm answering our DHEWithCertificate.
    pub fn verify_request(&self, hash: &[u8]) -> SecurityResult<()> {
        self.verify_hash(Transcript::DheWithCertificate, hash)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a new handshake round.
    ///
    /// Clears the round's cells and DH state and moves Active to Updating.
    /// Fails while a round is already in flight or once closed.
    pub fn reset(self: &Arc<Self>) -> SecurityResult<()> {
        self.reset_round(false)
    }

    /// [`reset`](Self::reset), reporting only whether a new round started.
    pub fn try_reset(self: &Arc<Self>) -> bool {
        self.reset_round(false).is_ok()
    }

    /// Abandon any round in flight and start a new one.
    pub fn force_reset(self: &Arc<Self>) -> SecurityResult<()> {
        self.reset_round(true)
    }

    fn reset_round(self: &Arc<Self>, force: bool) -> SecurityResult<()> {
        let updating = {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return Err(SecurityError::Closed);
            }
            if inner.running && !force {
                return Err(SecurityError::HandshakeInProgress);
            }
            let now = Instant::now();
            inner.last_update = now;
            inner.last_update_request = now;
            inner.handshake = Handshake::new();
            inner.keypair = None;
            inner.ldhe = None;
            inner.hash_verified = false;
            inner.called_enable = false;
            inner.running = true;
            if inner.state == SaState::Active {
                inner.state = SaState::Updating;
                true
            } else {
                false
            }
        };
        trace!(sa = %self, force, "handshake round reset");
        if updating {
            self.notify_state(SaState::Updating);
        }
        Ok(())
    }

    /// Derive session keys from the completed round and install them.
    ///
    /// Runs at most once per round; later calls return immediately. Missing
    /// DH values or an unverified transcript are state machine bugs and are
    /// reported as [`SecurityError::Precondition`]. The local DH secret is
    /// consumed even when derivation fails, so a failed round stays failed
    /// until the next reset.
    pub fn enable(self: &Arc<Self>) -> SecurityResult<()> {
        let (previous, became_active, epoch) = {
            let mut inner = self.inner.lock();
            if inner.called_enable {
                return Ok(());
            }
            if self.is_closed() {
                return Err(SecurityError::Closed);
            }
            if inner.keypair.is_none() {
                return Err(SecurityError::Precondition("local DHE not set"));
            }
            let rdhe = inner
                .handshake
                .rdhe
                .get()
                .cloned()
                .ok_or(SecurityError::Precondition("remote DHE not set"))?;
            if !inner.hash_verified {
                return Err(SecurityError::Precondition("hash not verified"));
            }
            let keypair = inner
                .keypair
                .take()
                .ok_or(SecurityError::Precondition("local DHE not set"))?;
            let ldhe = Zeroizing::new(inner.ldhe.take().unwrap_or_default());
            let shared = keypair.diffie_hellman(&rdhe)?;
            let order = KeyOrder::of(&ldhe, &rdhe);
            let keys = derive_session_keys(
                self.policy.key_derivation,
                &shared,
                order,
                self.policy.key_sizes(),
            )?;

            let handler = SecurityHandler::new(
                keys.epoch,
                SymmetricEncryption::new(self.policy.create_symmetric_algorithm(&keys.out_key)?),
                SymmetricEncryption::new(self.policy.create_symmetric_algorithm(&keys.in_key)?),
                self.policy.create_hash_algorithm(&keys.out_mac)?,
                self.policy.create_hash_algorithm(&keys.in_mac)?,
            );
            inner.called_enable = true;
            let previous = inner.handler.replace(handler);
            inner.last_epoch = inner.current_epoch;
            inner.current_epoch = keys.epoch;
            inner.running = false;
            inner.last_update = Instant::now();
            let became_active = inner.state != SaState::Active;
            inner.state = SaState::Active;
            self.active.store(true, Ordering::Release);
            (previous, became_active, keys.epoch)
        };

        if let Some(mut old) = previous {
            old.close();
        }
        debug!(sa = %self, epoch, "security association enabled");
        if became_active {
            self.notify_state(SaState::Active);
        }
        Ok(())
    }

    /// A handshake failed. Updating falls back to the previous keys;
    /// an association that never became active is closed.
    pub fn failure(self: &Arc<Self>) {
        let (close, restored) = {
            let mut inner = self.inner.lock();
            match inner.state {
                SaState::Updating => {
                    inner.state = SaState::Active;
                    inner.running = false;
                    (false, true)
                }
                SaState::Active => (false, false),
                SaState::Waiting | SaState::Closed => (true, false),
            }
        };
        if restored {
            self.notify_state(SaState::Active);
        }
        if close {
            self.close("timeout");
        }
    }

    /// Close permanently. Returns false if already closed.
    pub fn close(self: &Arc<Self>, reason: &str) -> bool {
        if !self.closed.fire() {
            return false;
        }
        let handler = {
            let mut inner = self.inner.lock();
            inner.state = SaState::Closed;
            inner.keypair = None;
            inner.ldhe = None;
            self.active.store(false, Ordering::Release);
            inner.handler.take()
        };
        if let Some(mut handler) = handler {
            handler.close();
        }
        debug!(sa = %self, reason, "security association closed");
        self.notify_state(SaState::Closed);
        true
    }

    /// Inactivity check, called periodically.
    ///
    /// Closes the association if no frame was sent or received since the
    /// previous check, or if it has waited five timeouts without keys.
    /// Returns true if the association is closed.
    pub fn check_state(self: &Arc<Self>) -> bool {
        if self.is_closed() {
            return true;
        }
        let sent = self.sending.swap(false, Ordering::AcqRel);
        let received = self.receiving.swap(false, Ordering::AcqRel);
        let stalled = !self.is_active() && self.last_update().elapsed() >= self.timeout * 5;
        if !(sent || received) {
            self.close("inactivity")
        } else if stalled {
            self.close("handshake did not complete")
        } else {
            false
        }
    }

    /// Ask the listener for a new handshake, at most once per two
    /// reliability timeouts.
    pub(crate) fn request_update(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if now.duration_since(inner.last_update_request) < self.timeout * UPDATE_REQUEST_FACTOR {
                return;
            }
            inner.last_update_request = now;
        }
        if let Some(listener) = self.listener() {
            listener.update_requested(self);
        }
    }

    fn listener(&self) -> Option<Arc<dyn AssociationListener<P>>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn notify_state(self: &Arc<Self>, state: SaState) {
        if let Some(listener) = self.listener() {
            listener.state_changed(self, state);
        }
    }

    // =========================================================================
    // Data plane
    // =========================================================================

    /// Open a data message (type tags already removed).
    ///
    /// Returns `Ok(None)` when the frame is not decoded: the association
    /// has no keys yet (an update is requested), or the frame belongs to
    /// the epoch just replaced.
    pub fn handle_incoming(self: &Arc<Self>, data: &[u8]) -> SecurityResult<Option<Vec<u8>>> {
        if !self.is_active() {
            if !self.is_closed() {
                self.request_update();
            }
            return Ok(None);
        }

        let msg = SecurityDataMessage::decode(data)?;
        if msg.header.spi != self.spi {
            return Err(SecurityError::SpiMismatch {
                expected: self.spi,
                actual: msg.header.spi,
            });
        }

        let opened = {
            let mut inner = self.inner.lock();
            let last_epoch = inner.last_epoch;
            let handler = inner.handler.as_mut().ok_or(SecurityError::Closed)?;
            match handler.open(&msg) {
                Ok(payload) => Some(payload),
                Err(e) if msg.header.epoch == last_epoch => {
                    trace!(sa = %self, epoch = last_epoch, error = %e, "dropping frame from previous epoch");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        };
        if opened.is_some() {
            self.receiving.store(true, Ordering::Release);
        }
        Ok(opened)
    }

    /// Seal `app_data` into a framed data message.
    ///
    /// Returns `Ok(None)` when no keys are installed yet; an update is
    /// requested and the caller should retry later.
    pub fn handle_outgoing(self: &Arc<Self>, app_data: &[u8]) -> SecurityResult<Option<Vec<u8>>> {
        if !self.is_active() {
            if self.is_closed() {
                return Err(SecurityError::Closed);
            }
            self.request_update();
            return Ok(None);
        }

        let (msg, wants_update) = {
            let mut inner = self.inner.lock();
            let handler = inner.handler.as_mut().ok_or(SecurityError::Closed)?;
            let msg = handler.seal(self.spi, app_data)?;
            (msg, handler.take_update_request())
        };
        if wants_update {
            self.request_update();
        }
        Ok(Some(frame(&[PType::Security, PType::SecureData], &msg.encode())))
    }

    /// Seal and transmit `app_data` to the peer.
    pub fn send(self: &Arc<Self>, app_data: &[u8]) -> SecurityResult<SendStatus> {
        match self.handle_outgoing(app_data)? {
            Some(frame) => {
                self.peer.send(frame)?;
                self.sending.store(true, Ordering::Release);
                Ok(SendStatus::Sent)
            }
            None => Ok(SendStatus::NotReady),
        }
    }

    /// Open an inbound data message and hand the payload to the subscriber.
    pub fn handle_data(self: &Arc<Self>, data: &[u8]) -> SecurityResult<()> {
        if self.is_closed() {
            return Err(SecurityError::Closed);
        }
        let Some(payload) = self.handle_incoming(data)? else {
            return Ok(());
        };
        let subscriber = self.subscriber.read().clone();
        match subscriber {
            Some(handler) => handler.handle_secure_data(&payload, self),
            None => trace!(sa = %self, len = payload.len(), "no subscriber, dropping data"),
        }
        Ok(())
    }
}

impl<P: Peer> fmt::Display for PeerSecAssociation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityAssociation for {:?} SPI: {}", self.peer, self.spi)
    }
}

impl<P: Peer> fmt::Debug for PeerSecAssociation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSecAssociation")
            .field("peer", &self.peer)
            .field("spi", &self.spi)
            .field("active", &self.is_active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityPolicies;
    use crate::security::mock::{CountingListener, RecordingPeer};
    use crate::crypto::{Authenticator, Encryptor};
    use crate::core::DEFAULT_SPI;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn default_policy() -> Arc<SecurityPolicy> {
        SecurityPolicies::new().get(DEFAULT_SPI).unwrap()
    }

    fn pair_with(policy: Arc<SecurityPolicy>, timeout: Duration) -> (
        Arc<PeerSecAssociation<RecordingPeer>>,
        Arc<PeerSecAssociation<RecordingPeer>>,
    ) {
        (
            PeerSecAssociation::new(RecordingPeer::new(1), Arc::clone(&policy), timeout),
            PeerSecAssociation::new(RecordingPeer::new(0), policy, timeout),
        )
    }

    fn pair() -> (
        Arc<PeerSecAssociation<RecordingPeer>>,
        Arc<PeerSecAssociation<RecordingPeer>>,
    ) {
        pair_with(default_policy(), TIMEOUT)
    }

    /// Drive both sides through a round without an overlord.
    fn complete_round(
        a: &Arc<PeerSecAssociation<RecordingPeer>>,
        b: &Arc<PeerSecAssociation<RecordingPeer>>,
    ) {
        let (la, lb) = (a.ldhe(), b.ldhe());
        a.set_rdhe(lb.to_vec()).unwrap();
        b.set_rdhe(la.to_vec()).unwrap();

        let hash = vec![0x5a; 20];
        a.set_transcript(Transcript::DheWithCertificateAndCasOut, hash.clone())
            .unwrap();
        a.verify_response(&hash).unwrap();
        b.set_transcript(Transcript::DheWithCertificate, hash.clone())
            .unwrap();
        b.verify_request(&hash).unwrap();

        a.enable().unwrap();
        b.enable().unwrap();
    }

    /// Strip the Security and SecureData tags.
    fn body(framed: &[u8]) -> &[u8] {
        &framed[2..]
    }

    fn transfer(
        from: &Arc<PeerSecAssociation<RecordingPeer>>,
        to: &Arc<PeerSecAssociation<RecordingPeer>>,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let framed = from.handle_outgoing(payload).unwrap().unwrap();
        to.handle_incoming(body(&framed)).unwrap()
    }

    #[test]
    fn test_setup_and_rekey() {
        let (a, b) = pair();
        assert_eq!(a.state(), SaState::Waiting);
        complete_round(&a, &b);
        assert_eq!(a.state(), SaState::Active);
        assert_eq!(b.state(), SaState::Active);
        assert_eq!(a.current_epoch(), b.current_epoch());
        assert_eq!(transfer(&a, &b, b"ping").unwrap(), b"ping");
        assert_eq!(transfer(&b, &a, b"pong").unwrap(), b"pong");

        let first_epoch = a.current_epoch();
        a.reset().unwrap();
        b.reset().unwrap();
        assert_eq!(a.state(), SaState::Updating);
        assert!(a.is_active());
        // Old keys keep working during the update
        assert_eq!(transfer(&a, &b, b"still here").unwrap(), b"still here");

        complete_round(&a, &b);
        assert_eq!(a.state(), SaState::Active);
        assert_eq!(a.last_epoch(), first_epoch);
        assert_eq!(a.current_epoch(), b.current_epoch());
        assert_eq!(transfer(&a, &b, b"after rekey").unwrap(), b"after rekey");
    }

    #[test]
    fn test_enable_preconditions() {
        let (a, b) = pair();
        assert!(matches!(a.enable(), Err(SecurityError::Precondition("local DHE not set"))));
        let _ = a.ldhe();
        assert!(matches!(a.enable(), Err(SecurityError::Precondition("remote DHE not set"))));
        a.set_rdhe(b.ldhe().to_vec()).unwrap();
        assert!(matches!(a.enable(), Err(SecurityError::Precondition("hash not verified"))));
        assert_eq!(a.state(), SaState::Waiting);
    }

    #[test]
    fn test_enable_runs_once_per_round() {
        let (a, b) = pair();
        complete_round(&a, &b);
        let epoch = a.current_epoch();
        a.enable().unwrap();
        assert_eq!(a.current_epoch(), epoch);
        assert_eq!(transfer(&a, &b, b"x").unwrap(), b"x");
    }

    #[test]
    fn test_failed_enable_is_not_retried_as_success() {
        let (a, _) = pair();
        let _ = a.ldhe();
        a.set_rdhe(vec![0; 32]).unwrap();
        let hash = vec![0x5a; 20];
        a.set_transcript(Transcript::DheWithCertificateAndCasOut, hash.clone())
            .unwrap();
        a.verify_response(&hash).unwrap();

        assert!(a.enable().is_err());
        assert!(a.enable().is_err());
        assert!(!a.is_active());
        assert_eq!(a.state(), SaState::Waiting);
        assert!(a.handle_outgoing(b"x").unwrap().is_none());
    }

    #[test]
    fn test_verify_hash_errors() {
        let (a, _) = pair();
        assert!(matches!(a.verify_request(&[1; 20]), Err(SecurityError::HashNotSet)));
        a.set_transcript(Transcript::DheWithCertificate, vec![1; 20]).unwrap();
        assert!(matches!(a.verify_request(&[2; 20]), Err(SecurityError::HashMismatch)));
        assert!(!a.hash_verified());
        a.verify_request(&[1; 20]).unwrap();
        assert!(a.hash_verified());
    }

    #[test]
    fn test_cells_are_set_once_idempotent() {
        let (a, _) = pair();
        a.set_rdhe(vec![1; 32]).unwrap();
        a.set_rdhe(vec![1; 32]).unwrap();
        assert!(matches!(a.set_rdhe(vec![2; 32]), Err(SecurityError::AlreadySet(_))));

        a.set_remote_cookie([3; 20]).unwrap();
        a.set_remote_cookie([3; 20]).unwrap();
        assert!(a.set_remote_cookie([4; 20]).is_err());
        assert_eq!(a.remote_cookie(), Some([3; 20]));

        for which in [
            Transcript::DheWithCertificateAndCasOut,
            Transcript::DheWithCertificateAndCasIn,
            Transcript::DheWithCertificate,
        ] {
            a.set_transcript(which, vec![7; 20]).unwrap();
            a.set_transcript(which, vec![7; 20]).unwrap();
            assert!(a.set_transcript(which, vec![8; 20]).is_err());
            assert_eq!(a.transcript(which), Some(vec![7; 20]));
        }
    }

    #[test]
    fn test_ldhe_stable_within_round() {
        let (a, _) = pair();
        let first = a.ldhe();
        assert_eq!(*first, *a.ldhe());
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_same_order_self_association() {
        let a = PeerSecAssociation::new(RecordingPeer::new(0), default_policy(), TIMEOUT);
        let own = a.ldhe();
        a.set_rdhe(own.to_vec()).unwrap();
        a.set_transcript(Transcript::DheWithCertificate, vec![1; 20]).unwrap();
        a.verify_request(&[1; 20]).unwrap();
        a.enable().unwrap();
        // Both directions share key slot 0, so a frame opens on its sender
        assert_eq!(transfer(&a, &a, b"loopback").unwrap(), b"loopback");
    }

    #[test]
    fn test_keys_are_complementary_with_keyed_hash() {
        let policy = Arc::new(SecurityPolicy::new(5, Encryptor::Aes128Cbc, Authenticator::HmacSha256));
        let (a, b) = pair_with(policy, TIMEOUT);
        complete_round(&a, &b);
        for i in 0..5u8 {
            assert_eq!(transfer(&a, &b, &[i; 33]).unwrap(), vec![i; 33]);
            assert_eq!(transfer(&b, &a, &[i; 3]).unwrap(), vec![i; 3]);
        }
        // A frame does not open on the side that sealed it
        let framed = a.handle_outgoing(b"mine").unwrap().unwrap();
        assert!(a.handle_incoming(body(&framed)).is_err());
    }

    #[test]
    fn test_epoch_tolerance() {
        let (a, b) = pair();
        complete_round(&a, &b);
        let stale = a.handle_outgoing(b"in flight").unwrap().unwrap();

        a.reset().unwrap();
        b.reset().unwrap();
        complete_round(&a, &b);
        assert_ne!(b.current_epoch(), b.last_epoch());

        // Frame sealed under the replaced epoch is dropped quietly
        assert_eq!(b.handle_incoming(body(&stale)).unwrap(), None);

        // Frame claiming an unknown epoch is an error
        let fresh = a.handle_outgoing(b"fresh").unwrap().unwrap();
        let mut forged = body(&fresh).to_vec();
        let mut epoch = b.current_epoch().wrapping_add(1);
        while epoch == b.last_epoch() || epoch == b.current_epoch() {
            epoch = epoch.wrapping_add(1);
        }
        forged[4..6].copy_from_slice(&epoch.to_be_bytes());
        assert!(b.handle_incoming(&forged).is_err());
    }

    #[test]
    fn test_spi_mismatch() {
        let (a, b) = pair();
        complete_round(&a, &b);
        let framed = a.handle_outgoing(b"x").unwrap().unwrap();
        let mut data = body(&framed).to_vec();
        data[3] = 9;
        assert!(matches!(
            b.handle_incoming(&data),
            Err(SecurityError::SpiMismatch { expected: 0, actual: 9 })
        ));
    }

    #[test]
    fn test_reset_rules() {
        let (a, b) = pair();
        // A new association already has a round in flight
        assert!(matches!(a.reset(), Err(SecurityError::HandshakeInProgress)));
        assert!(!a.try_reset());

        complete_round(&a, &b);
        assert!(a.try_reset());
        assert_eq!(a.state(), SaState::Updating);
        assert!(a.rdhe().is_none());
        assert!(!a.hash_verified());
        assert!(!a.try_reset());

        a.force_reset().unwrap();
        assert_eq!(a.state(), SaState::Updating);

        a.close("test");
        assert!(matches!(a.reset(), Err(SecurityError::Closed)));
        assert!(matches!(a.force_reset(), Err(SecurityError::Closed)));
    }

    #[test]
    fn test_not_active_data_plane() {
        let (a, _) = pair();
        assert_eq!(a.handle_outgoing(b"early").unwrap(), None);
        assert_eq!(a.send(b"early").unwrap(), SendStatus::NotReady);
        assert_eq!(a.handle_incoming(&[0; 40]).unwrap(), None);
        assert!(a.peer().sent().is_empty());

        a.close("done");
        assert!(matches!(a.handle_outgoing(b"late"), Err(SecurityError::Closed)));
        assert!(matches!(a.send(b"late"), Err(SecurityError::Closed)));
        assert_eq!(a.handle_incoming(&[0; 40]).unwrap(), None);
    }

    #[test]
    fn test_send_hands_frame_to_peer() {
        let (a, b) = pair();
        complete_round(&a, &b);
        assert_eq!(a.send(b"over the wire").unwrap(), SendStatus::Sent);
        let sent = a.peer().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(b.handle_incoming(body(&sent[0])).unwrap().unwrap(), b"over the wire");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, b) = pair();
        complete_round(&a, &b);
        let listener = CountingListener::attach(&a);
        assert!(a.close("first"));
        assert!(!a.close("second"));
        assert_eq!(a.state(), SaState::Closed);
        assert!(!a.is_active());
        assert!(a.set_rdhe(vec![1; 32]).is_err());
        assert!(matches!(a.enable(), Err(SecurityError::Closed)));
        assert_eq!(listener.states(), vec![SaState::Closed]);
    }

    #[test]
    fn test_failure_reverts_update() {
        let (a, b) = pair();
        complete_round(&a, &b);
        a.reset().unwrap();
        a.failure();
        assert_eq!(a.state(), SaState::Active);
        assert!(a.try_reset());

        let (waiting, _) = pair();
        waiting.failure();
        assert!(waiting.is_closed());
    }

    #[test]
    fn test_update_requests_are_rate_limited() {
        let (slow, _) = pair();
        let slow_listener = CountingListener::attach(&slow);
        slow.handle_outgoing(b"x").unwrap();
        slow.handle_outgoing(b"x").unwrap();
        assert_eq!(slow_listener.updates(), 0);

        let (eager, _) = pair_with(default_policy(), Duration::ZERO);
        let eager_listener = CountingListener::attach(&eager);
        eager.handle_outgoing(b"x").unwrap();
        eager.handle_incoming(&[0; 40]).unwrap();
        assert_eq!(eager_listener.updates(), 2);
    }

    #[test]
    fn test_half_life_requests_update() {
        let (a, b) = pair_with(default_policy(), Duration::ZERO);
        complete_round(&a, &b);
        let listener = CountingListener::attach(&a);
        for _ in 1..crate::core::HALF_LIFE {
            a.handle_outgoing(b"x").unwrap();
        }
        assert_eq!(listener.updates(), 0);
        a.handle_outgoing(b"x").unwrap();
        assert_eq!(listener.updates(), 1);
    }

    #[test]
    fn test_state_notifications() {
        let (a, b) = pair();
        let listener = CountingListener::attach(&a);
        complete_round(&a, &b);
        a.reset().unwrap();
        b.reset().unwrap();
        complete_round(&a, &b);
        assert_eq!(
            listener.states(),
            vec![SaState::Active, SaState::Updating, SaState::Active]
        );
    }

    #[test]
    fn test_check_state_closes_idle() {
        let (a, b) = pair();
        complete_round(&a, &b);
        assert!(!a.check_state());
        assert_eq!(transfer(&b, &a, b"keepalive").unwrap(), b"keepalive");
        assert!(!a.check_state());
        assert!(a.check_state());
        assert!(a.is_closed());
    }

    #[test]
    fn test_check_state_closes_stalled_handshake() {
        let (a, _) = pair_with(default_policy(), Duration::ZERO);
        assert!(a.check_state());
        assert!(a.is_closed());
    }
}
