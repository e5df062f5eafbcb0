use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated binding between this agent and a (user, community) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub community_id: String,
    pub credential_id: String,
    /// Bearer token presented to the control plane
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// A registered public-key credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub community_id: String,
    /// Raw Ed25519 public key, base64url
    pub public_key: String,
    pub sign_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CeremonyKind::Registration => "registration",
            CeremonyKind::Authentication => "authentication",
        }
    }
}

/// An issued, not yet consumed challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChallenge {
    pub challenge: String,
    pub kind: CeremonyKind,
    pub user_id: String,
    pub community_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle position of the authenticator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unregistered,
    Registered,
    Authenticating,
    Authenticated,
    Expired,
}

/// Counters reported by the authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStats {
    pub state: AuthState,
    pub credentials: usize,
    pub active_sessions: usize,
    pub pending_challenges: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session_expires_at: Option<DateTime<Utc>>,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions_removed: usize,
    pub challenges_removed: usize,
}
