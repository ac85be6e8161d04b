//! # Oubliette (secret vault core)
//!
//! `oubliette` is the core of a self-hosted, single-user secret vault. A
//! caller unlocks a passphrase-protected [`secret::Vault`] into a
//! [`secret::Store`] of encrypted entries, then mediates all further access
//! through a [`session::Handler`] which enforces per-path second-factor
//! authentication and session expiration.
//!
//! ## Entries
//!
//! Entries are named by absolute slash-separated paths (`/bank/login`) and
//! persisted one file per entry under a base directory, encrypted by the
//! vault's cipher. Entry *contents* are always protected at rest; entry
//! *names* are not.
//!
//! ## Sessions
//!
//! A session is created from a passphrase alone and starts out partially
//! authenticated: it holds an unlocked store, but no path may be served
//! until a WebAuthn security-key exchange completes for that path.
//! Partially-authenticated sessions expire on a fixed schedule; completing
//! the second factor upgrades the session to a sliding timeout. Suspicious
//! lifecycle events (a session closing without ever completing its second
//! factor) are reported through an [`alert::Alerter`].
//!
//! ## Collaborators
//!
//! The HTTP handler layer, TLS termination, and configuration loading live
//! outside this crate; they consume the interfaces exposed here. Process-wide
//! singletons (the [`counter::CounterStore`] for authenticator counters and
//! the [`rate::Limiter`] admitting session creation) are injected into the
//! session handler at construction.

pub mod alert;
pub mod counter;
pub mod rate;
pub mod secret;
pub mod session;
