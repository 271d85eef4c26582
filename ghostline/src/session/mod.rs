// Copyright (c) 2024 Botho Foundation

//! Session keys: generation, exchange, rotation and expiry.

mod exchange;
mod key;
mod manager;

pub use exchange::KeyExchange;
pub use key::{SessionKey, SessionKeyMaterial, SESSION_KEY_LEN};
pub use manager::{
    KeyExchangeOutcome, OutboundSession, SessionConfig, SessionError, SessionManager,
    SessionState, DEFAULT_GRACE_WINDOW, DEFAULT_OFFER_MAX_AGE, DEFAULT_ROTATION_INTERVAL,
    MAX_GENERATIONS,
};
