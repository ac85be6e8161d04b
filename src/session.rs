//! Session management: creation, per-path second-factor authentication,
//! expiration, and lifecycle alerting.
//!
//! A [`Handler`] owns every live [`Session`]. Creating a session requires
//! rate-limiter admission and a successful vault unlock; the resulting
//! session is only *partially* authenticated and expires on a fixed
//! schedule. Completing a WebAuthn security-key exchange for a path marks
//! that path authenticated and upgrades the session to a sliding timeout:
//! from then on every [`Handler::get_session`] pushes the deadline out by
//! the configured duration. Partially-authenticated sessions are never
//! extended, so an attacker who knows only the passphrase cannot keep a
//! session alive by polling.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
    time::Duration,
};

use anyhow::anyhow;
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use thiserror::Error as ThisError;
use tokio::{task::JoinHandle, time::Instant};
use tracing::warn;
use url::Url;
use uuid::Uuid;
use webauthn_rs::{
    Webauthn, WebauthnBuilder,
    prelude::{
        CreationChallengeResponse, CredentialID, PublicKeyCredential,
        RegisterPublicKeyCredential, RequestChallengeResponse, SecurityKey,
        SecurityKeyAuthentication, SecurityKeyRegistration,
    },
};

use crate::{
    alert::{Alerter, Code},
    counter::CounterStore,
    rate,
    secret::{self, Store, Vault},
};

const SESSION_ID_LENGTH: usize = 32;
const ALERT_TIME_LIMIT: Duration = Duration::from_secs(10);
const RP_NAME: &str = "Oubliette";
const USER_NAME: &str = "vault";

/// Errors surfaced by the session layer.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The passphrase did not unlock the vault.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// No session exists with the supplied ID (or it was lost to an
    /// expiration race).
    #[error("no such session")]
    NoSession,

    /// No challenge is outstanding for the supplied path.
    #[error("no current challenge")]
    NoChallenge,

    /// No registered credential verified the response.
    #[error("second-factor authentication failed")]
    SecondFactorAuthFailed,

    /// The registration response could not be verified.
    #[error("second-factor registration failed")]
    SecondFactorRegistrationFailed,

    /// The rate limiter's queue for this client is full.
    #[error("too many concurrent session attempts")]
    TooManyEvents,

    /// Anything else. Opaque to callers.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Configuration for a session [`Handler`].
pub struct HandlerConfig {
    /// The origin the browser authenticates against, e.g.
    /// `https://vault.example.com:8080`. The WebAuthn relying-party ID is
    /// its host.
    pub origin: Url,
    /// How long sessions last; must be non-zero.
    pub session_duration: Duration,
    /// The registered security-key credentials.
    pub credentials: Vec<SecurityKey>,
    /// Admission control for session creation.
    pub rate_limiter: Arc<dyn rate::Limiter>,
    /// Persistent authenticator counters; `None` disables persistence.
    pub counters: Option<Arc<CounterStore>>,
    /// Sink for lifecycle alerts.
    pub alerter: Arc<dyn Alerter>,
}

/// Manages session creation, lookup, and expiration. Safe for concurrent
/// use; cheap to clone.
#[derive(Clone)]
pub struct Handler {
    shared: Arc<Shared>,
}

struct Shared {
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    vault: Arc<dyn Vault>,
    session_duration: Duration,
    webauthn: Webauthn,
    credentials: Vec<SecurityKey>,
    user_handle: Uuid,
    counters: Option<Arc<CounterStore>>,
    rate_limiter: Arc<dyn rate::Limiter>,
    alerter: Arc<dyn Alerter>,
}

impl Handler {
    /// Creates a new session handler over the given (locked) vault.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] for a zero session duration or an origin
    /// the WebAuthn layer cannot use as a relying party.
    pub fn new(vault: Arc<dyn Vault>, config: HandlerConfig) -> Result<Self, Error> {
        if config.session_duration.is_zero() {
            return Err(anyhow!("nonpositive session duration").into());
        }
        let rp_id = config
            .origin
            .host_str()
            .ok_or_else(|| anyhow!("origin {} has no host", config.origin))?
            .to_string();
        let webauthn = WebauthnBuilder::new(&rp_id, &config.origin)
            .map_err(|err| anyhow!("could not configure relying party: {err}"))?
            .rp_name(RP_NAME)
            .build()
            .map_err(|err| anyhow!("could not configure relying party: {err}"))?;

        Ok(Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                vault,
                session_duration: config.session_duration,
                webauthn,
                credentials: config.credentials,
                user_handle: Uuid::new_v4(),
                counters: config.counters,
                rate_limiter: config.rate_limiter,
                alerter: config.alerter,
            }),
        })
    }

    /// Attempts to create a new session using the given passphrase,
    /// returning the new session's ID and the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyEvents`] if the rate limiter rejects the
    /// client, [`Error::WrongPassphrase`] if the vault does not unlock, and
    /// [`Error::Internal`] for everything else.
    pub async fn create_session(
        &self,
        client_id: &str,
        passphrase: &str,
    ) -> Result<(String, Arc<Session>), Error> {
        // Respect the rate limit before doing any expensive work.
        self.shared
            .rate_limiter
            .wait(client_id)
            .await
            .map_err(|err| match err {
                rate::Error::TooManyEvents => Error::TooManyEvents,
            })?;

        // Unlock the vault on the blocking pool; key derivation is sized to
        // take hundreds of milliseconds.
        let vault = Arc::clone(&self.shared.vault);
        let passphrase = passphrase.to_string();
        let store = tokio::task::spawn_blocking(move || vault.unlock(&passphrase))
            .await
            .map_err(|err| anyhow!("vault unlock task failed: {err}"))?
            .map_err(|err| match err {
                secret::Error::WrongPassphrase => Error::WrongPassphrase,
                other => {
                    Error::Internal(anyhow::Error::new(other).context("could not unlock vault"))
                }
            })?;

        let mut sessions = self
            .shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut session_id = random_session_id()?;
        while sessions.contains_key(&session_id) {
            // This loop body is overwhelmingly likely to never run.
            session_id = random_session_id()?;
        }

        let session = Arc::new(Session {
            id: session_id.clone(),
            store,
            shared: Arc::downgrade(&self.shared),
            timer: ExpirationTimer::arm(
                self.shared.session_duration,
                Arc::downgrade(&self.shared),
                session_id.clone(),
            ),
            state: RwLock::new(SecondFactorState::default()),
        });
        sessions.insert(session_id.clone(), Arc::clone(&session));
        Ok((session_id, session))
    }

    /// Gets an existing session. If the session has completed its second
    /// factor, its expiration timeout is pushed out by a full duration;
    /// partially-authenticated sessions are returned without touching the
    /// timer so they expire on schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSession`] if the session does not exist or its
    /// expiration timer has already fired.
    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>, Error> {
        let sessions = self
            .shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get(session_id).ok_or(Error::NoSession)?;
        let state = session.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.authed_paths.is_empty()
            && !session.timer.try_refresh(self.shared.session_duration)
        {
            // The timer fired concurrently; the session is being closed.
            return Err(Error::NoSession);
        }
        Ok(Arc::clone(session))
    }
}

impl Shared {
    fn close_session(&self, session_id: &str) {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(session) = session {
            session.timer.stop();
            if !session.is_authenticated() {
                self.dispatch_alert(
                    Code::UnauthenticatedSessionClosed,
                    "session closed without completing second-factor authentication",
                );
            }
        }
    }

    /// Fires an alert without blocking or failing the caller.
    fn dispatch_alert(&self, code: Code, details: &str) {
        let alerter = Arc::clone(&self.alerter);
        let details = details.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ALERT_TIME_LIMIT, alerter.alert(code, &details)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(code = %code, "could not send alert: {err:#}"),
                Err(_) => warn!(code = %code, "alert dispatch timed out"),
            }
        });
    }
}

fn random_session_id() -> Result<String, Error> {
    let mut bytes = [0u8; SESSION_ID_LENGTH];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| anyhow!("could not generate session ID: {err}"))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// All data associated with one active session. Safe for concurrent use.
pub struct Session {
    id: String,
    store: Box<dyn Store>,
    shared: Weak<Shared>,
    timer: ExpirationTimer,
    state: RwLock<SecondFactorState>,
}

#[derive(Default)]
struct SecondFactorState {
    authed_paths: HashSet<String>,
    challenge: Option<OutstandingChallenge>,
    registration: Option<OutstandingRegistration>,
}

struct OutstandingChallenge {
    path: String,
    request: RequestChallengeResponse,
    state: SecurityKeyAuthentication,
}

struct OutstandingRegistration {
    request: CreationChallengeResponse,
    state: SecurityKeyRegistration,
}

impl Session {
    /// The session's opaque identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The unlocked store backing this session.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Closes this session, freeing all resources it holds.
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close_session(&self.id);
        }
    }

    /// Whether the session has completed second-factor authentication for
    /// any path.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .authed_paths
            .is_empty()
    }

    /// Whether the session has completed second-factor authentication for
    /// the given path.
    #[must_use]
    pub fn is_authenticated_for(&self, path: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .authed_paths
            .contains(path)
    }

    /// Whether any security-key credential is registered with the handler.
    #[must_use]
    pub fn has_registered_credential(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.credentials.is_empty())
    }

    /// Generates a new second-factor challenge for the given path,
    /// replacing any challenge that may exist for this or any other path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the challenge cannot be generated
    /// (for example, because no credentials are registered).
    pub fn generate_second_factor_challenge(
        &self,
        path: &str,
    ) -> Result<RequestChallengeResponse, Error> {
        let shared = self.shared()?;
        let (request, auth_state) = shared
            .webauthn
            .start_securitykey_authentication(&shared.credentials)
            .map_err(|err| anyhow!("could not generate second-factor challenge: {err}"))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.challenge = Some(OutstandingChallenge {
            path: path.to_string(),
            request: request.clone(),
            state: auth_state,
        });
        Ok(request)
    }

    /// Gets the outstanding second-factor challenge for the given path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChallenge`] if no challenge is outstanding for
    /// exactly this path.
    pub fn get_second_factor_challenge(
        &self,
        path: &str,
    ) -> Result<RequestChallengeResponse, Error> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.challenge {
            Some(challenge) if challenge.path == path => Ok(challenge.request.clone()),
            _ => Err(Error::NoChallenge),
        }
    }

    /// Authenticates the user for the given path with the given
    /// security-key response. On success the path is recorded as
    /// authenticated and the challenge is consumed; on verification failure
    /// the challenge stays in place so the user may retry.
    ///
    /// When a counter store is configured, the authenticator's new counter
    /// is persisted before success is recorded; a persistence failure fails
    /// the authentication.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChallenge`] if no challenge is outstanding for
    /// exactly this path, and [`Error::SecondFactorAuthFailed`] if no
    /// registered credential verifies the response.
    pub fn authenticate_second_factor(
        &self,
        path: &str,
        response: &PublicKeyCredential,
    ) -> Result<(), Error> {
        let shared = self.shared()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let challenge = match &state.challenge {
            Some(challenge) if challenge.path == path => challenge,
            _ => return Err(Error::NoChallenge),
        };

        let result = shared
            .webauthn
            .finish_securitykey_authentication(response, &challenge.state)
            .map_err(|_| Error::SecondFactorAuthFailed)?;

        // Persist the authenticator's counter before acknowledging success.
        if let Some(counters) = &shared.counters {
            let handle =
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result.cred_id().as_slice());
            counters
                .set(&handle, result.counter())
                .map_err(|err| err.context("could not persist authenticator counter"))?;
        }

        if state.authed_paths.is_empty() {
            shared.dispatch_alert(Code::Login, "new session completed second-factor authentication");
        }
        state.authed_paths.insert(path.to_string());
        state.challenge = None;
        Ok(())
    }

    /// Generates a new security-key registration challenge, replacing any
    /// previous registration challenge. Already-registered credentials are
    /// excluded from re-registration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the challenge cannot be generated.
    pub fn generate_registration_challenge(&self) -> Result<CreationChallengeResponse, Error> {
        let shared = self.shared()?;
        let exclude: Option<Vec<CredentialID>> = if shared.credentials.is_empty() {
            None
        } else {
            Some(
                shared
                    .credentials
                    .iter()
                    .map(|credential| credential.cred_id().clone())
                    .collect(),
            )
        };
        let (request, reg_state) = shared
            .webauthn
            .start_securitykey_registration(
                shared.user_handle,
                USER_NAME,
                USER_NAME,
                exclude,
                None,
                None,
            )
            .map_err(|err| anyhow!("could not generate registration challenge: {err}"))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.registration = Some(OutstandingRegistration {
            request: request.clone(),
            state: reg_state,
        });
        Ok(request)
    }

    /// Gets the outstanding registration challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChallenge`] if there is none.
    pub fn get_registration_challenge(&self) -> Result<CreationChallengeResponse, Error> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .registration
            .as_ref()
            .map(|registration| registration.request.clone())
            .ok_or(Error::NoChallenge)
    }

    /// Completes registration of a new security-key credential. On success
    /// the credential is returned for the configuration tooling to persist;
    /// it takes effect the next time a handler is constructed with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChallenge`] if no registration challenge is
    /// outstanding, and [`Error::SecondFactorRegistrationFailed`] if the
    /// response does not verify.
    pub fn complete_registration(
        &self,
        response: &RegisterPublicKeyCredential,
    ) -> Result<SecurityKey, Error> {
        let shared = self.shared()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let registration = state.registration.as_ref().ok_or(Error::NoChallenge)?;
        let credential = shared
            .webauthn
            .finish_securitykey_registration(response, &registration.state)
            .map_err(|_| Error::SecondFactorRegistrationFailed)?;
        state.registration = None;
        Ok(credential)
    }

    fn shared(&self) -> Result<Arc<Shared>, Error> {
        self.shared.upgrade().ok_or(Error::NoSession)
    }
}

/// A one-shot expiration timer with the reset semantics the session
/// lifecycle needs: refreshing the deadline succeeds only while the timer
/// has not fired, and a failed refresh is definitive evidence that the
/// session is (being) closed.
struct ExpirationTimer {
    state: Arc<Mutex<TimerState>>,
    reaper: JoinHandle<()>,
}

enum TimerState {
    Armed(Instant),
    Fired,
}

impl ExpirationTimer {
    fn arm(duration: Duration, shared: Weak<Shared>, session_id: String) -> Self {
        let state = Arc::new(Mutex::new(TimerState::Armed(Instant::now() + duration)));
        let reaper = tokio::spawn(Self::reap(Arc::clone(&state), shared, session_id));
        Self { state, reaper }
    }

    async fn reap(state: Arc<Mutex<TimerState>>, shared: Weak<Shared>, session_id: String) {
        loop {
            let deadline = match *state.lock().unwrap_or_else(PoisonError::into_inner) {
                TimerState::Armed(deadline) => deadline,
                TimerState::Fired => return,
            };
            tokio::time::sleep_until(deadline).await;
            let fired = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match *state {
                    // A refresh may have pushed the deadline out while we
                    // slept; only fire once the latest deadline has passed.
                    TimerState::Armed(deadline) if Instant::now() >= deadline => {
                        *state = TimerState::Fired;
                        true
                    }
                    TimerState::Armed(_) => false,
                    TimerState::Fired => return,
                }
            };
            if fired {
                if let Some(shared) = shared.upgrade() {
                    shared.close_session(&session_id);
                }
                return;
            }
        }
    }

    fn try_refresh(&self, duration: Duration) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            TimerState::Fired => false,
            TimerState::Armed(_) => {
                *state = TimerState::Armed(Instant::now() + duration);
                true
            }
        }
    }

    fn stop(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = TimerState::Fired;
        self.reaper.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{collections::HashMap, fs, sync::Mutex};

    use async_trait::async_trait;
    use tokio::time::advance;
    use webauthn_authenticator_rs::{WebauthnAuthenticator, softpasskey::SoftPasskey};

    use super::*;
    use crate::rate::{NoopLimiter, PerClientLimiter};

    const ORIGIN: &str = "https://vault.example.com";
    const PASSPHRASE: &str = "password";

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<String, String>>,
    }

    impl Store for MemoryStore {
        fn list(&self) -> Result<Vec<String>, secret::Error> {
            Ok(self.entries.lock().unwrap().keys().cloned().collect())
        }

        fn get(&self, entry: &str) -> Result<String, secret::Error> {
            self.entries
                .lock()
                .unwrap()
                .get(entry)
                .cloned()
                .ok_or(secret::Error::NoEntry)
        }

        fn put(&self, entry: &str, content: &str) -> Result<(), secret::Error> {
            self.entries
                .lock()
                .unwrap()
                .insert(entry.to_string(), content.to_string());
            Ok(())
        }

        fn delete(&self, entry: &str) -> Result<(), secret::Error> {
            self.entries
                .lock()
                .unwrap()
                .remove(entry)
                .map(|_| ())
                .ok_or(secret::Error::NoEntry)
        }
    }

    struct FakeVault;

    impl Vault for FakeVault {
        fn unlock(&self, passphrase: &str) -> Result<Box<dyn Store>, secret::Error> {
            if passphrase == PASSPHRASE {
                Ok(Box::new(MemoryStore::default()))
            } else {
                Err(secret::Error::WrongPassphrase)
            }
        }
    }

    #[derive(Default)]
    struct RecordingAlerter {
        codes: Mutex<Vec<Code>>,
    }

    impl RecordingAlerter {
        fn codes(&self) -> Vec<Code> {
            self.codes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Alerter for RecordingAlerter {
        async fn alert(&self, code: Code, _details: &str) -> anyhow::Result<()> {
            self.codes.lock().unwrap().push(code);
            Ok(())
        }
    }

    struct TestHandler {
        handler: Handler,
        alerter: Arc<RecordingAlerter>,
    }

    fn origin() -> Url {
        Url::parse(ORIGIN).unwrap()
    }

    fn new_handler(
        credentials: Vec<SecurityKey>,
        counters: Option<Arc<CounterStore>>,
        rate_limiter: Arc<dyn rate::Limiter>,
        session_duration: Duration,
    ) -> TestHandler {
        let alerter = Arc::new(RecordingAlerter::default());
        let handler = Handler::new(
            Arc::new(FakeVault),
            HandlerConfig {
                origin: origin(),
                session_duration,
                credentials,
                rate_limiter,
                counters,
                alerter: Arc::clone(&alerter) as Arc<dyn Alerter>,
            },
        )
        .unwrap();
        TestHandler { handler, alerter }
    }

    fn default_handler(credentials: Vec<SecurityKey>) -> TestHandler {
        new_handler(
            credentials,
            None,
            Arc::new(NoopLimiter),
            Duration::from_secs(300),
        )
    }

    /// Drive spawned tasks (alert dispatch, expiration reapers) to
    /// completion.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Registers a fresh credential through a throwaway handler, the way
    /// the configuration tooling would.
    async fn enroll(authenticator: &mut WebauthnAuthenticator<SoftPasskey>) -> SecurityKey {
        let enrollment = default_handler(Vec::new());
        let (_, session) = enrollment
            .handler
            .create_session("enroll", PASSPHRASE)
            .await
            .unwrap();
        let creation = session.generate_registration_challenge().unwrap();
        assert!(session.get_registration_challenge().is_ok());
        let response = authenticator.do_registration(origin(), creation).unwrap();
        let credential = session.complete_registration(&response).unwrap();
        session.close();
        credential
    }

    fn authenticate(
        authenticator: &mut WebauthnAuthenticator<SoftPasskey>,
        session: &Session,
        path: &str,
    ) {
        let challenge = session.generate_second_factor_challenge(path).unwrap();
        let response = authenticator.do_authentication(origin(), challenge).unwrap();
        session.authenticate_second_factor(path, &response).unwrap();
    }

    #[tokio::test]
    async fn wrong_passphrase_creates_no_session() {
        let TestHandler { handler, alerter } = default_handler(Vec::new());
        assert!(matches!(
            handler.create_session("client", "wrong").await,
            Err(Error::WrongPassphrase)
        ));
        settle().await;
        assert!(alerter.codes().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_id_is_no_session() {
        let TestHandler { handler, .. } = default_handler(Vec::new());
        assert!(matches!(
            handler.get_session("missing"),
            Err(Error::NoSession)
        ));
    }

    #[tokio::test]
    async fn session_exposes_its_store() {
        let TestHandler { handler, .. } = default_handler(Vec::new());
        let (id, session) = handler.create_session("client", PASSPHRASE).await.unwrap();
        session.store().put("/bank/login", "hunter2").unwrap();
        let fetched = handler.get_session(&id).unwrap();
        assert_eq!(fetched.store().get("/bank/login").unwrap(), "hunter2");
        assert_eq!(fetched.id(), id);
    }

    #[tokio::test]
    async fn explicit_close_of_partial_session_alerts_once() {
        let TestHandler { handler, alerter } = default_handler(Vec::new());
        let (id, session) = handler.create_session("client", PASSPHRASE).await.unwrap();
        session.close();
        settle().await;
        assert!(matches!(handler.get_session(&id), Err(Error::NoSession)));
        assert_eq!(alerter.codes(), vec![Code::UnauthenticatedSessionClosed]);

        // Closing again is a no-op.
        session.close();
        settle().await;
        assert_eq!(alerter.codes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_session_expires_on_schedule() {
        let TestHandler { handler, alerter } = new_handler(
            Vec::new(),
            None,
            Arc::new(NoopLimiter),
            Duration::from_secs(60),
        );
        let (id, _session) = handler.create_session("client", PASSPHRASE).await.unwrap();

        advance(Duration::from_secs(30)).await;
        settle().await;
        // Polling a partial session must not extend its life.
        handler.get_session(&id).unwrap();

        advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(matches!(handler.get_session(&id), Err(Error::NoSession)));
        assert_eq!(alerter.codes(), vec![Code::UnauthenticatedSessionClosed]);

        advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(alerter.codes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_session_slides_on_access() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, alerter } = new_handler(
            vec![credential],
            None,
            Arc::new(NoopLimiter),
            Duration::from_secs(60),
        );
        let (id, session) = handler.create_session("client", PASSPHRASE).await.unwrap();
        authenticate(&mut authenticator, &session, "/p/a");

        // Two accesses 45 s apart keep the session alive well past the
        // configured duration.
        advance(Duration::from_secs(45)).await;
        settle().await;
        handler.get_session(&id).unwrap();
        advance(Duration::from_secs(45)).await;
        settle().await;
        handler.get_session(&id).unwrap();

        // Left alone, it expires one duration after the last access.
        advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(matches!(handler.get_session(&id), Err(Error::NoSession)));
        assert_eq!(alerter.codes(), vec![Code::Login]);
    }

    #[tokio::test]
    async fn per_path_authentication() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, alerter } = default_handler(vec![credential]);
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();
        assert!(session.has_registered_credential());
        assert!(!session.is_authenticated());

        authenticate(&mut authenticator, &session, "/p/a");
        assert!(session.is_authenticated());
        assert!(session.is_authenticated_for("/p/a"));
        assert!(!session.is_authenticated_for("/p/b"));

        authenticate(&mut authenticator, &session, "/p/b");
        assert!(session.is_authenticated_for("/p/a"));
        assert!(session.is_authenticated_for("/p/b"));

        settle().await;
        assert_eq!(alerter.codes(), vec![Code::Login]);
    }

    #[tokio::test]
    async fn challenges_are_bound_to_their_path() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, .. } = default_handler(vec![credential]);
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();

        let challenge = session.generate_second_factor_challenge("/p/a").unwrap();
        assert!(session.get_second_factor_challenge("/p/a").is_ok());
        assert!(matches!(
            session.get_second_factor_challenge("/p/b"),
            Err(Error::NoChallenge)
        ));

        let response = authenticator.do_authentication(origin(), challenge).unwrap();
        assert!(matches!(
            session.authenticate_second_factor("/p/b", &response),
            Err(Error::NoChallenge)
        ));

        // A later challenge replaces the earlier one entirely.
        session.generate_second_factor_challenge("/p/c").unwrap();
        assert!(matches!(
            session.get_second_factor_challenge("/p/a"),
            Err(Error::NoChallenge)
        ));
    }

    #[tokio::test]
    async fn authentication_without_challenge_fails() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, .. } = default_handler(vec![credential]);
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();

        let challenge = session.generate_second_factor_challenge("/p/a").unwrap();
        let response = authenticator.do_authentication(origin(), challenge).unwrap();
        session.authenticate_second_factor("/p/a", &response).unwrap();

        // The challenge was consumed by the successful authentication.
        let stale = authenticator
            .do_authentication(origin(), {
                session.generate_second_factor_challenge("/p/b").unwrap()
            })
            .unwrap();
        session.authenticate_second_factor("/p/b", &stale).unwrap();
        assert!(matches!(
            session.authenticate_second_factor("/p/b", &stale),
            Err(Error::NoChallenge)
        ));
    }

    #[tokio::test]
    async fn failed_verification_keeps_the_challenge() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, alerter } = default_handler(vec![credential]);
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();

        let challenge = session.generate_second_factor_challenge("/p/a").unwrap();
        let stale_response = authenticator.do_authentication(origin(), challenge).unwrap();

        // Replacing the challenge invalidates responses to the old one.
        session.generate_second_factor_challenge("/p/a").unwrap();
        assert!(matches!(
            session.authenticate_second_factor("/p/a", &stale_response),
            Err(Error::SecondFactorAuthFailed)
        ));
        assert!(!session.is_authenticated_for("/p/a"));

        // The outstanding challenge survives the failure; a fresh response
        // succeeds.
        let retry = session.get_second_factor_challenge("/p/a").unwrap();
        let response = authenticator.do_authentication(origin(), retry).unwrap();
        session.authenticate_second_factor("/p/a", &response).unwrap();
        assert!(session.is_authenticated_for("/p/a"));

        settle().await;
        assert_eq!(alerter.codes(), vec![Code::Login]);
    }

    #[tokio::test]
    async fn counter_write_failure_blocks_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let counter_dir = dir.path().join("counters");
        fs::create_dir(&counter_dir).unwrap();
        let counters = Arc::new(CounterStore::open(counter_dir.join("mfa")).unwrap());

        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let credential = enroll(&mut authenticator).await;
        let TestHandler { handler, alerter } = new_handler(
            vec![credential],
            Some(counters),
            Arc::new(NoopLimiter),
            Duration::from_secs(300),
        );
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();

        let challenge = session.generate_second_factor_challenge("/p/a").unwrap();
        let response = authenticator.do_authentication(origin(), challenge).unwrap();

        // Destroy the counter directory: persistence fails, so the
        // authentication must not be recorded.
        fs::remove_dir_all(&counter_dir).unwrap();
        assert!(matches!(
            session.authenticate_second_factor("/p/a", &response),
            Err(Error::Internal(_))
        ));
        assert!(!session.is_authenticated_for("/p/a"));
        assert!(session.get_second_factor_challenge("/p/a").is_ok());
        settle().await;
        assert!(alerter.codes().is_empty());
    }

    #[tokio::test]
    async fn registration_without_challenge_fails() {
        let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
        let TestHandler { handler, .. } = default_handler(Vec::new());
        let (_, session) = handler.create_session("client", PASSPHRASE).await.unwrap();
        assert!(!session.has_registered_credential());
        assert!(matches!(
            session.get_registration_challenge(),
            Err(Error::NoChallenge)
        ));

        let creation = session.generate_registration_challenge().unwrap();
        let response = authenticator.do_registration(origin(), creation).unwrap();
        session.complete_registration(&response).unwrap();

        // The registration challenge was consumed.
        assert!(matches!(
            session.complete_registration(&response),
            Err(Error::NoChallenge)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn session_creation_is_rate_limited() {
        let TestHandler { handler, .. } = new_handler(
            Vec::new(),
            None,
            Arc::new(PerClientLimiter::new(1.0, 1)),
            Duration::from_secs(300),
        );
        handler.create_session("x", PASSPHRASE).await.unwrap();

        let queued = tokio::spawn({
            let handler = handler.clone();
            async move { handler.create_session("x", PASSPHRASE).await }
        });
        settle().await;

        assert!(matches!(
            handler.create_session("x", PASSPHRASE).await,
            Err(Error::TooManyEvents)
        ));
        queued.await.unwrap().unwrap();

        // A different client is admitted immediately.
        handler.create_session("y", PASSPHRASE).await.unwrap();
    }

    #[tokio::test]
    async fn zero_session_duration_is_rejected() {
        let result = Handler::new(
            Arc::new(FakeVault),
            HandlerConfig {
                origin: origin(),
                session_duration: Duration::ZERO,
                credentials: Vec::new(),
                rate_limiter: Arc::new(NoopLimiter),
                counters: None,
                alerter: Arc::new(RecordingAlerter::default()),
            },
        );
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
