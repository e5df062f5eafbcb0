use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::ceremony::{
    self, AuthenticationCredential, COSE_ALG_EDDSA, ClientDataExpectation, CreationOptions,
    CredentialDescriptor, CredentialParameter, RegistrationCredential, RelyingParty,
    RequestOptions, UserEntity,
};
use super::session::{
    AuthState, AuthStats, CeremonyKind, CleanupReport, Credential, PendingChallenge, Session,
};
use crate::error::{AgentError, Result};
use crate::store::{BUCKET_SESSIONS, Store};

pub const BUCKET_CREDENTIALS: &str = "credentials";

const CHALLENGE_PREFIX: &str = "challenge:";
const SESSION_PREFIX: &str = "session:";
const CURRENT_SESSION_KEY: &str = "current_session";

/// Relying-party and lifetime settings for the ceremonies
///
/// `user_id` and `community_id` are the only identity this agent accepts.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub user_id: String,
    pub community_id: String,
    pub rp_id: String,
    pub rp_name: String,
    pub origin: String,
    pub challenge_ttl: Duration,
    pub session_ttl: Duration,
}

/// Binds one (user, community) pair to this agent and owns the current session
pub struct Authenticator {
    store: Store,
    settings: AuthSettings,
    current: RwLock<Option<Session>>,
    /// Serializes challenge consumption and sign-count updates
    ceremony: Mutex<()>,
}

fn challenge_key(kind: CeremonyKind, user_id: &str) -> String {
    format!("{CHALLENGE_PREFIX}{}:{user_id}", kind.as_str())
}

fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

const CREDENTIAL_SEPARATOR: char = '/';

fn credential_key(user_id: &str, credential_id: &str) -> String {
    format!("{user_id}{CREDENTIAL_SEPARATOR}{credential_id}")
}

/// Reject user ids that could alias another user's credential keys
pub fn check_user_id(user_id: &str) -> std::result::Result<(), String> {
    if user_id.trim().is_empty() {
        return Err("user id is required".to_string());
    }
    if user_id.contains(CREDENTIAL_SEPARATOR) || user_id.chars().any(char::is_control) {
        return Err(format!(
            "user id must not contain '{CREDENTIAL_SEPARATOR}' or control characters"
        ));
    }
    Ok(())
}

/// Normalize a client-supplied credential id; it must be non-empty base64url
fn credential_id_of(raw: &str) -> std::result::Result<&str, String> {
    let id = raw.trim_end_matches('=');
    if ceremony::decode("id", id)?.is_empty() {
        return Err("credential id is empty".to_string());
    }
    Ok(id)
}

fn ttl_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl.max(Duration::from_millis(1)))
        .unwrap_or_else(|_| chrono::Duration::days(1));
    now + ttl
}

impl Authenticator {
    /// Create the authenticator, restoring the current session from the store
    pub fn new(store: Store, settings: AuthSettings) -> Result<Self> {
        store.create_bucket(BUCKET_CREDENTIALS)?;

        let current = match store.get(BUCKET_SESSIONS, CURRENT_SESSION_KEY) {
            Ok(id) => {
                let id = String::from_utf8_lossy(&id).into_owned();
                store.get_json::<Session>(BUCKET_SESSIONS, &session_key(&id))?
            }
            Err(AgentError::KeyNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(session) = &current {
            tracing::info!(
                session_id = %session.id,
                user_id = %session.user_id,
                valid = session.is_valid(),
                "Restored current session"
            );
        }

        Ok(Self {
            store,
            settings,
            current: RwLock::new(current),
            ceremony: Mutex::new(()),
        })
    }

    /// Only the configured (user, community) pair may hold credentials here
    fn check_identity(&self, user_id: &str, community_id: Option<&str>) -> Result<()> {
        let user_matches = user_id == self.settings.user_id;
        let community_matches = community_id.is_none_or(|c| c == self.settings.community_id);
        if user_matches && community_matches {
            return Ok(());
        }

        tracing::warn!(
            user_id,
            community_id = community_id.unwrap_or("-"),
            "Ceremony requested for an identity this agent is not bound to"
        );
        Err(AgentError::InvalidCredentials(format!(
            "this agent is bound to user {} in community {}",
            self.settings.user_id, self.settings.community_id
        )))
    }

    /// Issue a creation challenge for `user_id` in `community_id`
    pub async fn start_registration(&self, user_id: &str, community_id: &str) -> Result<CreationOptions> {
        check_user_id(user_id).map_err(AgentError::RegistrationFailed)?;
        if community_id.trim().is_empty() {
            return Err(AgentError::RegistrationFailed("community id is required".to_string()));
        }
        self.check_identity(user_id, Some(community_id))?;

        let existing = self.credentials_for(user_id)?;
        let pending = self.issue_challenge(CeremonyKind::Registration, user_id, community_id)?;

        tracing::info!(user_id, community_id, "Registration ceremony started");

        Ok(CreationOptions {
            challenge: pending.challenge,
            rp: RelyingParty {
                id: self.settings.rp_id.clone(),
                name: self.settings.rp_name.clone(),
            },
            user: UserEntity {
                id: ceremony::encode(user_id.as_bytes()),
                name: user_id.to_string(),
                display_name: user_id.to_string(),
            },
            pub_key_cred_params: vec![CredentialParameter {
                kind: "public-key".to_string(),
                alg: COSE_ALG_EDDSA,
            }],
            timeout: self.settings.challenge_ttl.as_millis() as u64,
            attestation: "none".to_string(),
            exclude_credentials: existing
                .iter()
                .map(|c| CredentialDescriptor::public_key(&c.id))
                .collect(),
        })
    }

    /// Validate a new credential against the stored challenge and open a session
    pub async fn complete_registration(
        &self,
        user_id: &str,
        credential: &RegistrationCredential,
    ) -> Result<Session> {
        let _guard = self.ceremony.lock().await;
        let reject = AgentError::RegistrationFailed;

        let pending = self.take_challenge(CeremonyKind::Registration, user_id)?;

        let client_data_json = ceremony::decode("clientDataJSON", &credential.response.client_data_json)
            .map_err(reject)?;
        ceremony::verify_client_data(
            &client_data_json,
            &ClientDataExpectation {
                kind: ceremony::CLIENT_DATA_CREATE,
                challenge: &pending.challenge,
                origin: &self.settings.origin,
            },
            reject,
        )?;

        if credential.kind != "public-key" {
            return Err(reject(format!("unsupported credential type {}", credential.kind)));
        }
        if credential.response.public_key_algorithm != COSE_ALG_EDDSA {
            return Err(reject(format!(
                "unsupported public key algorithm {}",
                credential.response.public_key_algorithm
            )));
        }

        let auth_data = ceremony::decode("authenticatorData", &credential.response.authenticator_data)
            .map_err(reject)?;
        let auth_data = ceremony::verify_authenticator_data(&auth_data, &self.settings.rp_id, reject)?;

        let public_key = ceremony::decode("publicKey", &credential.response.public_key).map_err(reject)?;
        let public_key = ceremony::parse_public_key(&public_key).map_err(reject)?;

        let credential_id = credential_id_of(&credential.id).map_err(reject)?;
        if self
            .store
            .exists(BUCKET_CREDENTIALS, &credential_key(user_id, credential_id))?
        {
            return Err(reject("credential is already registered".to_string()));
        }

        let stored = Credential {
            id: credential_id.to_string(),
            user_id: user_id.to_string(),
            community_id: pending.community_id.clone(),
            public_key: ceremony::encode(public_key.as_bytes()),
            sign_count: auth_data.sign_count,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.store
            .set_json(BUCKET_CREDENTIALS, &credential_key(user_id, credential_id), &stored)?;

        tracing::info!(user_id, credential_id, "Credential registered");

        self.open_session(user_id, &pending.community_id, credential_id).await
    }

    /// Issue an assertion challenge for the user's registered credentials
    pub async fn start_authentication(&self, user_id: &str) -> Result<RequestOptions> {
        check_user_id(user_id).map_err(AgentError::InvalidCredentials)?;
        self.check_identity(user_id, None)?;

        let credentials = self.credentials_for(user_id)?;
        let Some(latest) = credentials.iter().max_by_key(|c| c.created_at) else {
            return Err(AgentError::CredentialNotFound(user_id.to_string()));
        };

        let pending = self.issue_challenge(CeremonyKind::Authentication, user_id, &latest.community_id)?;

        tracing::info!(user_id, credentials = credentials.len(), "Authentication ceremony started");

        Ok(RequestOptions {
            challenge: pending.challenge,
            rp_id: self.settings.rp_id.clone(),
            timeout: self.settings.challenge_ttl.as_millis() as u64,
            allow_credentials: credentials
                .iter()
                .map(|c| CredentialDescriptor::public_key(&c.id))
                .collect(),
            user_verification: "preferred".to_string(),
        })
    }

    /// Verify an assertion and replace the current session
    ///
    /// The sign counter must strictly increase; a counter that does not is
    /// rejected as a replay before the signature is looked at.
    pub async fn complete_authentication(
        &self,
        user_id: &str,
        credential: &AuthenticationCredential,
    ) -> Result<Session> {
        let _guard = self.ceremony.lock().await;
        let reject = AgentError::InvalidCredentials;

        let pending = self.take_challenge(CeremonyKind::Authentication, user_id)?;

        let credential_id = credential_id_of(&credential.id).map_err(reject)?;
        let key = credential_key(user_id, credential_id);
        let Some(mut stored) = self.store.get_json::<Credential>(BUCKET_CREDENTIALS, &key)? else {
            return Err(AgentError::CredentialNotFound(user_id.to_string()));
        };
        if stored.user_id != user_id || stored.id != credential_id {
            return Err(reject("credential belongs to another user".to_string()));
        }

        let client_data_json = ceremony::decode("clientDataJSON", &credential.response.client_data_json)
            .map_err(reject)?;
        ceremony::verify_client_data(
            &client_data_json,
            &ClientDataExpectation {
                kind: ceremony::CLIENT_DATA_GET,
                challenge: &pending.challenge,
                origin: &self.settings.origin,
            },
            reject,
        )?;

        let raw_auth_data = ceremony::decode("authenticatorData", &credential.response.authenticator_data)
            .map_err(reject)?;
        let auth_data = ceremony::verify_authenticator_data(&raw_auth_data, &self.settings.rp_id, reject)?;

        if auth_data.sign_count <= stored.sign_count {
            tracing::warn!(
                user_id,
                credential_id,
                stored = stored.sign_count,
                received = auth_data.sign_count,
                "Sign count did not increase, possible cloned credential"
            );
            return Err(AgentError::SignCountReplay {
                stored: stored.sign_count,
                received: auth_data.sign_count,
            });
        }

        let public_key = ceremony::decode("publicKey", &stored.public_key)
            .and_then(|bytes| ceremony::parse_public_key(&bytes))
            .map_err(reject)?;
        let signature = ceremony::decode("signature", &credential.response.signature).map_err(reject)?;
        ceremony::verify_assertion_signature(&public_key, &raw_auth_data, &client_data_json, &signature)?;

        stored.sign_count = auth_data.sign_count;
        stored.last_used_at = Some(Utc::now());
        self.store.set_json(BUCKET_CREDENTIALS, &key, &stored)?;

        tracing::info!(user_id, credential_id, sign_count = stored.sign_count, "Authentication succeeded");

        self.open_session(user_id, &stored.community_id, credential_id).await
    }

    /// The current session, if it is still valid
    pub async fn get_current_session(&self) -> Result<Session> {
        let current = self.current.read().await;
        match current.as_ref() {
            None => Err(AgentError::SessionNotFound),
            Some(session) if !session.is_valid() => Err(AgentError::SessionExpired),
            Some(session) => Ok(session.clone()),
        }
    }

    /// Bearer token of the current valid session
    pub async fn bearer_token(&self) -> Result<String> {
        Ok(self.get_current_session().await?.token)
    }

    pub async fn revoke_session(&self, id: &str) -> Result<()> {
        let mut current = self.current.write().await;
        let key = session_key(id);
        let is_current = current.as_ref().is_some_and(|s| s.id == id);

        if !is_current && !self.store.exists(BUCKET_SESSIONS, &key)? {
            return Err(AgentError::SessionNotFound);
        }

        self.store.delete(BUCKET_SESSIONS, &key)?;
        if is_current {
            self.store.delete(BUCKET_SESSIONS, CURRENT_SESSION_KEY)?;
            *current = None;
        }

        tracing::info!(session_id = id, "Session revoked");
        Ok(())
    }

    /// All stored sessions that have not expired
    pub async fn get_active_sessions(&self) -> Result<Vec<Session>> {
        let now = Utc::now();
        Ok(self
            .stored_sessions()?
            .into_iter()
            .filter(|s| s.is_valid_at(now))
            .collect())
    }

    pub async fn get_stats(&self) -> Result<AuthStats> {
        let now = Utc::now();
        let credentials = self.store.list(BUCKET_CREDENTIALS, "")?.len();
        let active_sessions = self.get_active_sessions().await?.len();
        let challenges = self.stored_challenges()?;
        let live_challenges: Vec<_> = challenges.iter().filter(|c| !c.is_expired_at(now)).collect();
        let authenticating = live_challenges
            .iter()
            .any(|c| c.kind == CeremonyKind::Authentication);

        let current = self.current.read().await;
        let state = match current.as_ref() {
            Some(s) if s.is_valid_at(now) => AuthState::Authenticated,
            _ if authenticating => AuthState::Authenticating,
            Some(_) => AuthState::Expired,
            None if credentials > 0 => AuthState::Registered,
            None => AuthState::Unregistered,
        };

        Ok(AuthStats {
            state,
            credentials,
            active_sessions,
            pending_challenges: live_challenges.len(),
            current_session_id: current.as_ref().map(|s| s.id.clone()),
            current_session_expires_at: current.as_ref().map(|s| s.expires_at),
        })
    }

    /// Remove expired sessions and challenges from the store
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let _guard = self.ceremony.lock().await;
        let mut current = self.current.write().await;
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for session in self.stored_sessions()? {
            if session.is_valid_at(now) {
                continue;
            }
            self.store.delete(BUCKET_SESSIONS, &session_key(&session.id))?;
            if current.as_ref().is_some_and(|c| c.id == session.id) {
                self.store.delete(BUCKET_SESSIONS, CURRENT_SESSION_KEY)?;
                *current = None;
            }
            report.sessions_removed += 1;
        }

        for challenge in self.stored_challenges()? {
            if challenge.is_expired_at(now) {
                self.store
                    .delete(BUCKET_SESSIONS, &challenge_key(challenge.kind, &challenge.user_id))?;
                report.challenges_removed += 1;
            }
        }

        if report != CleanupReport::default() {
            tracing::info!(
                sessions = report.sessions_removed,
                challenges = report.challenges_removed,
                "Expired authentication state removed"
            );
        }
        Ok(report)
    }

    fn credentials_for(&self, user_id: &str) -> Result<Vec<Credential>> {
        let mut credentials = Vec::new();
        let prefix = credential_key(user_id, "");
        for key in self.store.list(BUCKET_CREDENTIALS, &prefix)? {
            if key[prefix.len()..].contains(CREDENTIAL_SEPARATOR) {
                continue;
            }
            if let Some(credential) = self.store.get_json::<Credential>(BUCKET_CREDENTIALS, &key)?
                && credential.user_id == user_id
            {
                credentials.push(credential);
            }
        }
        Ok(credentials)
    }

    fn stored_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.store.list(BUCKET_SESSIONS, SESSION_PREFIX)? {
            if let Some(session) = self.store.get_json::<Session>(BUCKET_SESSIONS, &key)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn stored_challenges(&self) -> Result<Vec<PendingChallenge>> {
        let mut challenges = Vec::new();
        for key in self.store.list(BUCKET_SESSIONS, CHALLENGE_PREFIX)? {
            if let Some(challenge) = self.store.get_json::<PendingChallenge>(BUCKET_SESSIONS, &key)? {
                challenges.push(challenge);
            }
        }
        Ok(challenges)
    }

    fn issue_challenge(&self, kind: CeremonyKind, user_id: &str, community_id: &str) -> Result<PendingChallenge> {
        let now = Utc::now();
        let pending = PendingChallenge {
            challenge: ceremony::new_challenge(),
            kind,
            user_id: user_id.to_string(),
            community_id: community_id.to_string(),
            issued_at: now,
            expires_at: ttl_after(now, self.settings.challenge_ttl),
        };
        self.store
            .set_json(BUCKET_SESSIONS, &challenge_key(kind, user_id), &pending)?;
        Ok(pending)
    }

    /// Load and consume a challenge; challenges are single use
    fn take_challenge(&self, kind: CeremonyKind, user_id: &str) -> Result<PendingChallenge> {
        let key = challenge_key(kind, user_id);
        let Some(pending) = self.store.get_json::<PendingChallenge>(BUCKET_SESSIONS, &key)? else {
            return Err(AgentError::ChallengeExpired);
        };
        self.store.delete(BUCKET_SESSIONS, &key)?;

        if pending.is_expired_at(Utc::now()) {
            tracing::debug!(user_id, kind = kind.as_str(), "Challenge expired");
            return Err(AgentError::ChallengeExpired);
        }
        Ok(pending)
    }

    /// Create a session and make it current, superseding the previous one
    async fn open_session(&self, user_id: &str, community_id: &str, credential_id: &str) -> Result<Session> {
        use rand::RngCore;

        let mut token = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut token);

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            community_id: community_id.to_string(),
            credential_id: credential_id.to_string(),
            token: ceremony::encode(&token),
            issued_at: now,
            expires_at: ttl_after(now, self.settings.session_ttl),
        };

        let mut current = self.current.write().await;
        if let Some(previous) = current.take() {
            self.store.delete(BUCKET_SESSIONS, &session_key(&previous.id))?;
            tracing::debug!(session_id = %previous.id, "Previous session superseded");
        }

        self.store
            .set_json(BUCKET_SESSIONS, &session_key(&session.id), &session)?;
        self.store
            .set(BUCKET_SESSIONS, CURRENT_SESSION_KEY, session.id.as_bytes())?;
        *current = Some(session.clone());

        tracing::info!(
            session_id = %session.id,
            user_id,
            community_id,
            expires_at = %session.expires_at,
            "Session established"
        );
        Ok(session)
    }
}
