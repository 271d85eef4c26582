// Copyright (c) 2024 Botho Foundation

//! Per-peer session key lifecycle.
//!
//! Each peer has at most two key generations, newest first:
//!
//! ```text
//! NoSession ──offer sent──▶ Negotiating ──confirm──▶ Active
//!     │                                                │ rotation / expiry
//!     └──────offer received──────────────────▶ Active ─┴──▶ Retiring ──grace──▶ Expired
//! ```
//!
//! Rotation is linearized per peer by a mutex that is never held across an
//! await point. Peers are independent: the table is a sharded map.
//!
//! # Simultaneous Offers
//!
//! If an offer arrives while our own generation is still negotiating, the
//! generation with the larger session id wins. The loser installs the
//! winner's key as active and confirms it; both sides keep the losing key as
//! retiring so messages already sent under it still decrypt.

use super::{
    exchange::KeyExchange,
    key::{SessionKey, SessionKeyMaterial},
};
use crate::{
    crypto::{CryptoError, MessageCipher},
    envelope::{Envelope, SessionId},
    identity::{DeviceId, KeyStore, PeerDirectory},
};
use dashmap::DashMap;
use heapless::Vec as RingVec;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, trace};

/// Session generations kept per peer (current + retiring).
pub const MAX_GENERATIONS: usize = 2;

/// Offer session ids remembered per peer for replay rejection.
const RECENT_OFFERS: usize = 16;

/// Default rotation interval (24 hours).
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default grace window for retiring keys (5 minutes).
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(300);

/// Default maximum age of an accepted offer.
pub const DEFAULT_OFFER_MAX_AGE: Duration = Duration::from_secs(120);

/// Errors from session management.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown peer: {0}")]
    UnknownPeer(DeviceId),

    #[error("invalid key exchange")]
    InvalidKeyExchange,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Lifecycle state of one key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Offer sent, confirmation pending. Usable for sending.
    Negotiating,
    /// Confirmed or installed from the peer's offer.
    Active,
    /// Superseded; decrypt-only until its grace deadline.
    Retiring,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiating => write!(f, "negotiating"),
            Self::Active => write!(f, "active"),
            Self::Retiring => write!(f, "retiring"),
        }
    }
}

/// Session policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a session key before it is rotated.
    pub rotation_interval: Duration,
    /// How long a superseded key still decrypts.
    pub grace_window: Duration,
    /// Offers issued longer ago than this are rejected.
    pub offer_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            grace_window: DEFAULT_GRACE_WINDOW,
            offer_max_age: DEFAULT_OFFER_MAX_AGE,
        }
    }
}

impl SessionConfig {
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }
}

/// Key to encrypt with, plus an offer to transmit first if a new generation
/// was just created.
#[derive(Debug)]
pub struct OutboundSession {
    pub key: Arc<SessionKey>,
    pub offer: Option<Envelope>,
}

/// Result of processing a key-exchange envelope.
#[derive(Debug)]
pub enum KeyExchangeOutcome {
    /// The peer's key was installed as active; send `confirm` back.
    Installed { confirm: Envelope },
    /// Our concurrent generation won; the peer's key is kept as retiring.
    Superseded,
    /// The peer confirmed a generation we offered; it is now current.
    Confirmed,
    /// Nothing to do (duplicate or stale confirmation).
    Ignored,
}

impl KeyExchangeOutcome {
    pub fn reply(self) -> Option<Envelope> {
        match self {
            Self::Installed { confirm } => Some(confirm),
            _ => None,
        }
    }
}

struct Generation {
    key: Arc<SessionKey>,
    state: SessionState,
    retire_at: Option<Instant>,
    /// Offered by this device rather than installed from the peer.
    ours: bool,
}

impl Generation {
    fn usable_for_decrypt(&self, now: Instant, grace: Duration) -> bool {
        match self.state {
            SessionState::Retiring => self.retire_at.is_some_and(|deadline| now < deadline),
            _ => now < self.key.expires_at() + grace,
        }
    }

    fn retire(&mut self, now: Instant, grace: Duration) {
        if self.state != SessionState::Retiring {
            self.state = SessionState::Retiring;
            self.retire_at = Some(now + grace);
        }
    }
}

#[derive(Default)]
struct PeerSessions {
    generations: RingVec<Generation, MAX_GENERATIONS>,
    recent_offers: VecDeque<SessionId>,
}

impl PeerSessions {
    fn purge(&mut self, now: Instant, grace: Duration) {
        self.generations
            .retain(|generation| generation.usable_for_decrypt(now, grace));
    }

    /// Push a generation to the front, evicting the oldest if full.
    fn push_front(&mut self, generation: Generation) {
        if self.generations.is_full() {
            self.generations.pop();
        }
        // Capacity was freed above
        let _ = self.generations.insert(0, generation);
    }

    fn retire_all(&mut self, now: Instant, grace: Duration) {
        for generation in self.generations.iter_mut() {
            generation.retire(now, grace);
        }
    }

    fn current(&self) -> Option<&Generation> {
        self.generations
            .first()
            .filter(|g| g.state != SessionState::Retiring)
    }

    fn remember_offer(&mut self, session_id: SessionId) -> bool {
        if self.recent_offers.contains(&session_id)
            || self.generations.iter().any(|g| g.key.session_id() == session_id)
        {
            return false;
        }
        if self.recent_offers.len() == RECENT_OFFERS {
            self.recent_offers.pop_front();
        }
        self.recent_offers.push_back(session_id);
        true
    }
}

/// Derives, rotates and expires per-peer session keys.
pub struct SessionManager {
    keystore: Arc<KeyStore>,
    directory: PeerDirectory,
    config: SessionConfig,
    cipher: MessageCipher,
    peers: DashMap<DeviceId, Arc<Mutex<PeerSessions>>>,
}

impl SessionManager {
    pub fn new(keystore: Arc<KeyStore>, directory: PeerDirectory, config: SessionConfig) -> Self {
        Self {
            keystore,
            directory,
            config,
            cipher: MessageCipher::new(),
            peers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session slot for a directory peer. Strangers never get an entry.
    fn peer_sessions(&self, peer: &DeviceId) -> Result<Arc<Mutex<PeerSessions>>, SessionError> {
        if !self.directory.contains(peer) {
            return Err(SessionError::UnknownPeer(*peer));
        }
        Ok(self.peers.entry(*peer).or_default().value().clone())
    }

    /// Key for sending to `peer`, creating and offering a new generation if
    /// none is current.
    pub fn get_or_create_session(&self, peer: &DeviceId) -> Result<OutboundSession, SessionError> {
        self.get_or_create_session_at(peer, Instant::now())
    }

    pub fn get_or_create_session_at(
        &self,
        peer: &DeviceId,
        now: Instant,
    ) -> Result<OutboundSession, SessionError> {
        let sessions = self.peer_sessions(peer)?;
        let mut sessions = sessions.lock();
        sessions.purge(now, self.config.grace_window);

        if let Some(current) = sessions.current() {
            if !current.key.is_expired(now) {
                return Ok(OutboundSession {
                    key: current.key.clone(),
                    offer: None,
                });
            }
        }

        self.rotate_locked(&mut sessions, peer, now)
    }

    /// Force a new generation for `peer`.
    pub fn rotate(&self, peer: &DeviceId) -> Result<OutboundSession, SessionError> {
        self.rotate_at(peer, Instant::now())
    }

    pub fn rotate_at(&self, peer: &DeviceId, now: Instant) -> Result<OutboundSession, SessionError> {
        let sessions = self.peer_sessions(peer)?;
        let mut sessions = sessions.lock();
        sessions.purge(now, self.config.grace_window);
        self.rotate_locked(&mut sessions, peer, now)
    }

    fn rotate_locked(
        &self,
        sessions: &mut PeerSessions,
        peer: &DeviceId,
        now: Instant,
    ) -> Result<OutboundSession, SessionError> {
        let identity = self
            .directory
            .identity(peer)
            .ok_or(SessionError::UnknownPeer(*peer))?;

        let key = SessionKey::generate(
            *peer,
            self.config.rotation_interval,
            now,
            &mut rand::thread_rng(),
        );
        let wrapped = self.keystore.wrap(key.material(), &identity)?;
        let offer = KeyExchange::offer(
            &self.keystore,
            key.session_id(),
            *peer,
            unix_now(),
            wrapped,
        );

        // A previous retiring generation is purged by the next rotation
        sessions.generations.retain(|g| g.state != SessionState::Retiring);
        sessions.retire_all(now, self.config.grace_window);

        let key = Arc::new(key);
        sessions.push_front(Generation {
            key: key.clone(),
            state: SessionState::Negotiating,
            retire_at: None,
            ours: true,
        });
        debug!(peer = %peer.short(), session = %key.session_id(), "Offering new session key");

        Ok(OutboundSession {
            key,
            offer: Some(offer),
        })
    }

    /// Process a key-exchange envelope from `envelope.sender`.
    pub fn on_key_exchange_received(
        &self,
        envelope: &Envelope,
    ) -> Result<KeyExchangeOutcome, SessionError> {
        self.on_key_exchange_received_at(envelope, Instant::now())
    }

    pub fn on_key_exchange_received_at(
        &self,
        envelope: &Envelope,
        now: Instant,
    ) -> Result<KeyExchangeOutcome, SessionError> {
        let peer = envelope.sender;
        let identity = self
            .directory
            .identity(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;

        let record = KeyExchange::from_envelope(envelope).ok_or(SessionError::InvalidKeyExchange)?;
        if record.recipient() != self.keystore.device_id()
            || !record.verify(envelope.session_id, &peer, &identity)
        {
            return Err(SessionError::InvalidKeyExchange);
        }

        match record {
            KeyExchange::Offer {
                issued_at, wrapped, ..
            } => {
                if unix_now().abs_diff(issued_at) > self.config.offer_max_age.as_secs() {
                    return Err(SessionError::InvalidKeyExchange);
                }
                let material = self.keystore.unwrap(&wrapped)?;
                self.install_offer(peer, envelope.session_id, material, now)
            }
            KeyExchange::Confirm { .. } => self.apply_confirm(peer, envelope.session_id, now),
        }
    }

    fn install_offer(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        material: SessionKeyMaterial,
        now: Instant,
    ) -> Result<KeyExchangeOutcome, SessionError> {
        let grace = self.config.grace_window;
        let sessions = self.peer_sessions(&peer)?;
        let mut sessions = sessions.lock();
        sessions.purge(now, grace);

        if !sessions.remember_offer(session_id) {
            trace!(peer = %peer.short(), session = %session_id, "Ignoring replayed offer");
            return Ok(KeyExchangeOutcome::Ignored);
        }

        let key = Arc::new(SessionKey::from_material(
            peer,
            session_id,
            material,
            self.config.rotation_interval,
            now,
        ));

        let ours_negotiating = sessions
            .current()
            .filter(|g| g.state == SessionState::Negotiating)
            .map(|g| g.key.session_id());

        if let Some(ours) = ours_negotiating {
            if ours > session_id {
                // We win: keep ours, hold theirs for in-flight messages
                sessions.generations.truncate(1);
                let mut theirs = Generation {
                    key,
                    state: SessionState::Active,
                    retire_at: None,
                    ours: false,
                };
                theirs.retire(now, grace);
                let _ = sessions.generations.push(theirs);
                debug!(peer = %peer.short(), ours = %ours, theirs = %session_id, "Concurrent offer lost to ours");
                return Ok(KeyExchangeOutcome::Superseded);
            }
        }

        // Drop an older retiring generation, keep the one being superseded
        sessions.generations.truncate(1);
        sessions.retire_all(now, grace);
        sessions.push_front(Generation {
            key,
            state: SessionState::Active,
            retire_at: None,
            ours: false,
        });
        debug!(peer = %peer.short(), session = %session_id, "Installed session key from peer");

        Ok(KeyExchangeOutcome::Installed {
            confirm: KeyExchange::confirm(&self.keystore, session_id, peer),
        })
    }

    fn apply_confirm(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        now: Instant,
    ) -> Result<KeyExchangeOutcome, SessionError> {
        let grace = self.config.grace_window;
        let sessions = self.peer_sessions(&peer)?;
        let mut sessions = sessions.lock();
        sessions.purge(now, grace);

        let Some(index) = sessions
            .generations
            .iter()
            .position(|g| g.key.session_id() == session_id)
        else {
            return Ok(KeyExchangeOutcome::Ignored);
        };

        let (state, ours) = {
            let generation = &sessions.generations[index];
            (generation.state, generation.ours)
        };
        let front_is_theirs = !sessions.generations[0].ours;
        let outcome = match state {
            SessionState::Negotiating => {
                sessions.generations[index].state = SessionState::Active;
                debug!(peer = %peer.short(), session = %session_id, "Session key confirmed");
                KeyExchangeOutcome::Confirmed
            }
            // Crossing streams: we installed the peer's offer, then the peer
            // installed ours. Its confirm is the later decision, so follow it.
            SessionState::Retiring if ours && front_is_theirs => {
                let mut generation = sessions.generations.remove(index);
                generation.state = SessionState::Active;
                generation.retire_at = None;
                sessions.retire_all(now, grace);
                sessions.push_front(generation);
                debug!(peer = %peer.short(), session = %session_id, "Late confirm restored our session key");
                KeyExchangeOutcome::Confirmed
            }
            _ => KeyExchangeOutcome::Ignored,
        };
        Ok(outcome)
    }

    /// Decrypt a message envelope from `envelope.sender` with whichever
    /// stored generation it names.
    ///
    /// Returns the plaintext and the session it was sent under.
    pub fn decrypt_with_any_valid_key(
        &self,
        envelope: &Envelope,
    ) -> Result<(Vec<u8>, SessionId), SessionError> {
        self.decrypt_with_any_valid_key_at(envelope, Instant::now())
    }

    pub fn decrypt_with_any_valid_key_at(
        &self,
        envelope: &Envelope,
        now: Instant,
    ) -> Result<(Vec<u8>, SessionId), SessionError> {
        let key = {
            let Some(sessions) = self.peers.get(&envelope.sender).map(|s| s.value().clone())
            else {
                return Err(CryptoError::Authentication.into());
            };
            let mut sessions = sessions.lock();
            sessions.purge(now, self.config.grace_window);
            sessions
                .generations
                .iter()
                .find(|g| g.key.session_id() == envelope.session_id)
                .map(|g| g.key.clone())
                .ok_or(CryptoError::Authentication)?
        };

        let plaintext = self.cipher.decrypt(envelope, &key)?;
        Ok((plaintext, key.session_id()))
    }

    /// Whether `peer` has a confirmed generation.
    pub fn is_ready(&self, peer: &DeviceId) -> bool {
        self.peers.get(peer).is_some_and(|sessions| {
            sessions
                .lock()
                .current()
                .is_some_and(|g| g.state == SessionState::Active)
        })
    }

    /// Session ids and states for `peer`, newest first.
    pub fn generations(&self, peer: &DeviceId) -> Vec<(SessionId, SessionState)> {
        self.peers
            .get(peer)
            .map(|sessions| {
                sessions
                    .lock()
                    .generations
                    .iter()
                    .map(|g| (g.key.session_id(), g.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every generation for `peer`.
    pub fn remove_peer(&self, peer: &DeviceId) {
        if self.peers.remove(peer).is_some() {
            debug!(peer = %peer.short(), "Discarded session state");
        }
    }

    /// Drop generations past their deadline across all peers.
    pub fn purge_expired(&self, now: Instant) {
        let grace = self.config.grace_window;
        for entry in self.peers.iter() {
            entry.value().lock().purge(now, grace);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContactCard;

    struct Pair {
        alice: SessionManager,
        bob: SessionManager,
        alice_id: DeviceId,
        bob_id: DeviceId,
        cipher: MessageCipher,
    }

    fn pair(config: SessionConfig) -> Pair {
        let alice_keys = Arc::new(KeyStore::generate().unwrap());
        let bob_keys = Arc::new(KeyStore::generate().unwrap());

        let alice_dir = PeerDirectory::new();
        alice_dir.insert(
            ContactCard::new(bob_keys.device_id(), bob_keys.public_key().clone()),
            None,
            None,
        );
        let bob_dir = PeerDirectory::new();
        bob_dir.insert(
            ContactCard::new(alice_keys.device_id(), alice_keys.public_key().clone()),
            None,
            None,
        );

        Pair {
            alice_id: alice_keys.device_id(),
            bob_id: bob_keys.device_id(),
            alice: SessionManager::new(alice_keys, alice_dir, config.clone()),
            bob: SessionManager::new(bob_keys, bob_dir, config),
            cipher: MessageCipher::new(),
        }
    }

    #[test]
    fn test_offer_confirm_activates() {
        let p = pair(SessionConfig::default());

        let outbound = p.alice.get_or_create_session(&p.bob_id).unwrap();
        let offer = outbound.offer.expect("first contact offers");
        assert_eq!(
            p.alice.generations(&p.bob_id),
            vec![(outbound.key.session_id(), SessionState::Negotiating)]
        );

        let confirm = p.bob.on_key_exchange_received(&offer).unwrap().reply().unwrap();
        assert!(p.bob.is_ready(&p.alice_id));

        assert!(matches!(
            p.alice.on_key_exchange_received(&confirm).unwrap(),
            KeyExchangeOutcome::Confirmed
        ));
        assert!(p.alice.is_ready(&p.bob_id));
    }

    #[test]
    fn test_get_or_create_reuses_negotiating_key() {
        let p = pair(SessionConfig::default());

        let first = p.alice.get_or_create_session(&p.bob_id).unwrap();
        let second = p.alice.get_or_create_session(&p.bob_id).unwrap();
        assert!(first.offer.is_some());
        assert!(second.offer.is_none());
        assert_eq!(first.key.session_id(), second.key.session_id());
    }

    #[test]
    fn test_message_roundtrip_between_managers() {
        let p = pair(SessionConfig::default());

        let outbound = p.alice.get_or_create_session(&p.bob_id).unwrap();
        p.bob.on_key_exchange_received(&outbound.offer.unwrap()).unwrap();

        let envelope = p.cipher.encrypt(b"hello", &outbound.key, p.alice_id).unwrap();
        let (plaintext, session) = p.bob.decrypt_with_any_valid_key(&envelope).unwrap();
        assert_eq!(plaintext, b"hello");
        assert_eq!(session, outbound.key.session_id());

        // And back, under the same session
        let reply_key = p.bob.get_or_create_session(&p.alice_id).unwrap();
        assert!(reply_key.offer.is_none());
        let reply = p.cipher.encrypt(b"hi", &reply_key.key, p.bob_id).unwrap();
        assert_eq!(p.alice.decrypt_with_any_valid_key(&reply).unwrap().0, b"hi");
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let p = pair(SessionConfig::default());
        let stranger = DeviceId::random(&mut rand::thread_rng());
        assert!(matches!(
            p.alice.get_or_create_session(&stranger),
            Err(SessionError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_unknown_peer_leaves_no_state() {
        let p = pair(SessionConfig::default());
        let stranger = DeviceId::random(&mut rand::thread_rng());

        assert!(p.alice.rotate(&stranger).is_err());
        assert!(p.alice.get_or_create_session(&stranger).is_err());
        assert!(!p.alice.peers.contains_key(&stranger));
        assert!(p.alice.generations(&stranger).is_empty());
    }

    #[test]
    fn test_offer_for_someone_else_rejected() {
        let p = pair(SessionConfig::default());
        let outbound = p.alice.get_or_create_session(&p.bob_id).unwrap();
        // Alice processing her own offer: recipient mismatch and unknown sender
        assert!(p.alice.on_key_exchange_received(&outbound.offer.unwrap()).is_err());
    }

    #[test]
    fn test_replayed_offer_ignored() {
        let p = pair(SessionConfig::default());
        let offer = p.alice.get_or_create_session(&p.bob_id).unwrap().offer.unwrap();

        assert!(p.bob.on_key_exchange_received(&offer).unwrap().reply().is_some());
        assert!(matches!(
            p.bob.on_key_exchange_received(&offer).unwrap(),
            KeyExchangeOutcome::Ignored
        ));
    }

    #[test]
    fn test_tampered_offer_rejected() {
        let p = pair(SessionConfig::default());
        let mut offer = p.alice.get_or_create_session(&p.bob_id).unwrap().offer.unwrap();
        let last = offer.ciphertext.len() - 1;
        offer.ciphertext[last] ^= 0x01;
        assert!(p.bob.on_key_exchange_received(&offer).is_err());
        assert!(!p.bob.is_ready(&p.alice_id));
    }

    #[test]
    fn test_rotation_grace_window() {
        let grace = Duration::from_secs(300);
        let p = pair(SessionConfig::default().with_grace_window(grace));
        let t0 = Instant::now();

        let first = p.alice.get_or_create_session_at(&p.bob_id, t0).unwrap();
        p.bob
            .on_key_exchange_received_at(&first.offer.unwrap(), t0)
            .unwrap();
        let old_message = p.cipher.encrypt(b"old", &first.key, p.alice_id).unwrap();

        let t1 = t0 + Duration::from_secs(10);
        let second = p.alice.rotate_at(&p.bob_id, t1).unwrap();
        p.bob
            .on_key_exchange_received_at(&second.offer.unwrap(), t1)
            .unwrap();
        assert_eq!(
            p.bob.generations(&p.alice_id),
            vec![
                (second.key.session_id(), SessionState::Active),
                (first.key.session_id(), SessionState::Retiring),
            ]
        );

        let inside = t1 + grace - Duration::from_secs(1);
        assert_eq!(
            p.bob
                .decrypt_with_any_valid_key_at(&old_message, inside)
                .unwrap()
                .0,
            b"old"
        );

        let after = t1 + grace;
        assert!(matches!(
            p.bob.decrypt_with_any_valid_key_at(&old_message, after),
            Err(SessionError::Crypto(CryptoError::Authentication))
        ));
        assert_eq!(p.bob.generations(&p.alice_id).len(), 1);
    }

    #[test]
    fn test_next_rotation_purges_retiring() {
        let p = pair(SessionConfig::default());
        let t0 = Instant::now();

        let first = p.alice.rotate_at(&p.bob_id, t0).unwrap();
        let second = p.alice.rotate_at(&p.bob_id, t0).unwrap();
        let third = p.alice.rotate_at(&p.bob_id, t0).unwrap();

        let generations = p.alice.generations(&p.bob_id);
        assert_eq!(generations.len(), 2);
        assert_eq!(generations[0].0, third.key.session_id());
        assert_eq!(generations[1], (second.key.session_id(), SessionState::Retiring));
        assert!(!generations.iter().any(|g| g.0 == first.key.session_id()));
    }

    #[test]
    fn test_expired_session_rotates() {
        let lifetime = Duration::from_secs(60);
        let p = pair(SessionConfig::default().with_rotation_interval(lifetime));
        let t0 = Instant::now();

        let first = p.alice.get_or_create_session_at(&p.bob_id, t0).unwrap();
        let again = p
            .alice
            .get_or_create_session_at(&p.bob_id, t0 + Duration::from_secs(30))
            .unwrap();
        assert!(again.offer.is_none());

        let later = p.alice.get_or_create_session_at(&p.bob_id, t0 + lifetime).unwrap();
        assert!(later.offer.is_some());
        assert_ne!(later.key.session_id(), first.key.session_id());
    }

    #[test]
    fn test_simultaneous_offers_converge() {
        let p = pair(SessionConfig::default());

        let a = p.alice.get_or_create_session(&p.bob_id).unwrap();
        let b = p.bob.get_or_create_session(&p.alice_id).unwrap();
        let a_offer = a.offer.unwrap();
        let b_offer = b.offer.unwrap();

        let at_bob = p.bob.on_key_exchange_received(&a_offer).unwrap();
        let at_alice = p.alice.on_key_exchange_received(&b_offer).unwrap();

        let (winner_sid, loser_sid) = if a.key.session_id() > b.key.session_id() {
            (a.key.session_id(), b.key.session_id())
        } else {
            (b.key.session_id(), a.key.session_id())
        };

        // Exactly one side confirms; deliver it
        let confirms: Vec<Envelope> = [at_bob, at_alice]
            .into_iter()
            .filter_map(KeyExchangeOutcome::reply)
            .collect();
        assert_eq!(confirms.len(), 1);
        let confirm = &confirms[0];
        assert_eq!(confirm.session_id, winner_sid);
        if confirm.sender == p.bob_id {
            p.alice.on_key_exchange_received(confirm).unwrap();
        } else {
            p.bob.on_key_exchange_received(confirm).unwrap();
        }

        assert!(p.alice.is_ready(&p.bob_id));
        assert!(p.bob.is_ready(&p.alice_id));
        assert_eq!(p.alice.generations(&p.bob_id)[0].0, winner_sid);
        assert_eq!(p.bob.generations(&p.alice_id)[0].0, winner_sid);

        // Messages sent under the losing key before convergence still decrypt
        let loser_key = if a.key.session_id() == loser_sid { &a.key } else { &b.key };
        let sender = if loser_key.peer() == p.bob_id {
            p.alice_id
        } else {
            p.bob_id
        };
        let envelope = p.cipher.encrypt(b"early", loser_key, sender).unwrap();
        let receiver = if sender == p.alice_id { &p.bob } else { &p.alice };
        assert_eq!(receiver.decrypt_with_any_valid_key(&envelope).unwrap().0, b"early");
    }

    #[test]
    fn test_late_confirm_from_crossing_stream() {
        let p = pair(SessionConfig::default());
        let a = p.alice.rotate(&p.bob_id).unwrap();
        let b = p.bob.rotate(&p.alice_id).unwrap();

        // `high` offered the larger session id, so `low` installs its offer
        let (high, high_id, high_out, low, low_id, low_out) = if a.key.session_id() > b.key.session_id() {
            (&p.alice, p.alice_id, a, &p.bob, p.bob_id, b)
        } else {
            (&p.bob, p.bob_id, b, &p.alice, p.alice_id, a)
        };
        let low_sid = low_out.key.session_id();

        let confirm_high = low
            .on_key_exchange_received(&high_out.offer.unwrap())
            .unwrap()
            .reply()
            .unwrap();
        assert!(matches!(
            high.on_key_exchange_received(&confirm_high).unwrap(),
            KeyExchangeOutcome::Confirmed
        ));

        // The other stream delivers low's offer after high already settled
        let confirm_low = high
            .on_key_exchange_received(&low_out.offer.unwrap())
            .unwrap()
            .reply()
            .unwrap();
        assert!(matches!(
            low.on_key_exchange_received(&confirm_low).unwrap(),
            KeyExchangeOutcome::Confirmed
        ));

        assert_eq!(low.generations(&high_id)[0], (low_sid, SessionState::Active));
        assert_eq!(high.generations(&low_id)[0], (low_sid, SessionState::Active));
        assert!(low.is_ready(&high_id));
        assert!(high.is_ready(&low_id));

        assert!(matches!(
            low.on_key_exchange_received(&confirm_low).unwrap(),
            KeyExchangeOutcome::Ignored
        ));
    }

    #[test]
    fn test_remove_peer_discards_sessions() {
        let p = pair(SessionConfig::default());
        p.alice.get_or_create_session(&p.bob_id).unwrap();
        p.alice.remove_peer(&p.bob_id);
        assert!(p.alice.generations(&p.bob_id).is_empty());
    }
}
