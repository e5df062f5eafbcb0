//! WebAuthn-shaped ceremony payloads and their verification.
//!
//! Only Ed25519 credentials (COSE algorithm -8) with `none` attestation are
//! accepted. Binary fields travel as unpadded base64url strings.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};

/// COSE algorithm identifier for EdDSA
pub const COSE_ALG_EDDSA: i64 = -8;

pub const CLIENT_DATA_CREATE: &str = "webauthn.create";
pub const CLIENT_DATA_GET: &str = "webauthn.get";

/// User-present flag in the authenticator data flags byte
const FLAG_USER_PRESENT: u8 = 0x01;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo, followed by the 32 key bytes
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelyingParty {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialParameter {
    #[serde(rename = "type")]
    pub kind: String,
    pub alg: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl CredentialDescriptor {
    pub fn public_key(id: &str) -> Self {
        Self {
            kind: "public-key".to_string(),
            id: id.to_string(),
        }
    }
}

/// Options handed to the browser to create a credential
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationOptions {
    pub challenge: String,
    pub rp: RelyingParty,
    pub user: UserEntity,
    pub pub_key_cred_params: Vec<CredentialParameter>,
    /// Milliseconds
    pub timeout: u64,
    pub attestation: String,
    pub exclude_credentials: Vec<CredentialDescriptor>,
}

/// Options handed to the browser to produce an assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub challenge: String,
    pub rp_id: String,
    /// Milliseconds
    pub timeout: u64,
    pub allow_credentials: Vec<CredentialDescriptor>,
    pub user_verification: String,
}

/// Credential returned by `navigator.credentials.create()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCredential {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AttestationResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub authenticator_data: String,
    pub public_key: String,
    pub public_key_algorithm: i64,
}

/// Credential returned by `navigator.credentials.get()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationCredential {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AssertionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_handle: Option<String>,
}

/// Decoded `clientDataJSON`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(rename = "type")]
    pub kind: String,
    pub challenge: String,
    pub origin: String,
}

/// Fixed-size prefix of the authenticator data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
}

impl AuthenticatorData {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 37 {
            return None;
        }
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..32]);
        let flags = bytes[32];
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

        Some(Self {
            rp_id_hash,
            flags,
            sign_count,
        })
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }
}

/// What a client data blob must contain to be accepted
pub struct ClientDataExpectation<'a> {
    pub kind: &'a str,
    pub challenge: &'a str,
    pub origin: &'a str,
}

pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode(field: &str, value: &str) -> std::result::Result<Vec<u8>, String> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| format!("{field} is not valid base64url: {e}"))
}

/// Generate a fresh 32-byte challenge
pub fn new_challenge() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    encode(&bytes)
}

pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}

/// Decode and check `clientDataJSON`
///
/// A wrong ceremony type or origin is reported through `reject`, so the
/// caller decides between `RegistrationFailed` and `InvalidCredentials`. A
/// challenge that does not match is always `ChallengeMismatch`.
pub fn verify_client_data(
    raw: &[u8],
    expected: &ClientDataExpectation<'_>,
    reject: fn(String) -> AgentError,
) -> Result<ClientData> {
    let client_data: ClientData = serde_json::from_slice(raw)
        .map_err(|e| reject(format!("malformed clientDataJSON: {e}")))?;

    if client_data.kind != expected.kind {
        return Err(reject(format!(
            "unexpected ceremony type {} (expected {})",
            client_data.kind, expected.kind
        )));
    }

    if client_data.challenge.trim_end_matches('=') != expected.challenge {
        return Err(AgentError::ChallengeMismatch);
    }

    if client_data.origin != expected.origin {
        return Err(reject(format!("origin {} is not allowed", client_data.origin)));
    }

    Ok(client_data)
}

/// Parse authenticator data and check it belongs to this relying party
pub fn verify_authenticator_data(
    raw: &[u8],
    rp_id: &str,
    reject: fn(String) -> AgentError,
) -> Result<AuthenticatorData> {
    let data = AuthenticatorData::parse(raw)
        .ok_or_else(|| reject("authenticator data too short".to_string()))?;

    if data.rp_id_hash != rp_id_hash(rp_id) {
        return Err(reject("relying party id hash mismatch".to_string()));
    }

    if !data.user_present() {
        return Err(reject("user presence flag not set".to_string()));
    }

    Ok(data)
}

/// Accept a raw 32-byte Ed25519 key or its SPKI DER encoding
pub fn parse_public_key(bytes: &[u8]) -> std::result::Result<VerifyingKey, String> {
    let raw: &[u8] = if bytes.len() == ED25519_SPKI_PREFIX.len() + 32
        && bytes.starts_with(&ED25519_SPKI_PREFIX)
    {
        &bytes[ED25519_SPKI_PREFIX.len()..]
    } else {
        bytes
    };

    let key: [u8; 32] = raw
        .try_into()
        .map_err(|_| format!("unsupported public key length {}", bytes.len()))?;

    VerifyingKey::from_bytes(&key).map_err(|e| format!("invalid Ed25519 public key: {e}"))
}

/// Verify an assertion signature over `authenticatorData || SHA-256(clientDataJSON)`
pub fn verify_assertion_signature(
    public_key: &VerifyingKey,
    authenticator_data: &[u8],
    client_data_json: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature = Signature::from_slice(signature)
        .map_err(|_| AgentError::InvalidCredentials("malformed signature".to_string()))?;

    let message = signed_message(authenticator_data, client_data_json);
    public_key
        .verify(&message, &signature)
        .map_err(|_| AgentError::InvalidCredentials("signature verification failed".to_string()))
}

pub fn signed_message(authenticator_data: &[u8], client_data_json: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(authenticator_data.len() + 32);
    message.extend_from_slice(authenticator_data);
    message.extend_from_slice(&Sha256::digest(client_data_json));
    message
}

#[cfg(test)]
pub(crate) mod testing {
    //! A software authenticator for exercising the ceremonies in tests.

    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub struct SoftAuthenticator {
        pub key: SigningKey,
        pub credential_id: String,
        pub rp_id: String,
        pub origin: String,
        pub counter: u32,
    }

    impl SoftAuthenticator {
        pub fn new(rp_id: &str, origin: &str) -> Self {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            let credential_id = encode(&key.verifying_key().to_bytes()[..16]);
            Self {
                key,
                credential_id,
                rp_id: rp_id.to_string(),
                origin: origin.to_string(),
                counter: 0,
            }
        }

        pub fn authenticator_data(&self, counter: u32) -> Vec<u8> {
            let mut data = rp_id_hash(&self.rp_id).to_vec();
            data.push(FLAG_USER_PRESENT);
            data.extend_from_slice(&counter.to_be_bytes());
            data
        }

        pub fn client_data(&self, kind: &str, challenge: &str) -> Vec<u8> {
            serde_json::to_vec(&ClientData {
                kind: kind.to_string(),
                challenge: challenge.to_string(),
                origin: self.origin.clone(),
            })
            .unwrap()
        }

        pub fn register(&self, options: &CreationOptions) -> RegistrationCredential {
            let client_data = self.client_data(CLIENT_DATA_CREATE, &options.challenge);
            RegistrationCredential {
                id: self.credential_id.clone(),
                kind: "public-key".to_string(),
                response: AttestationResponse {
                    client_data_json: encode(&client_data),
                    authenticator_data: encode(&self.authenticator_data(0)),
                    public_key: encode(&self.key.verifying_key().to_bytes()),
                    public_key_algorithm: COSE_ALG_EDDSA,
                },
            }
        }

        /// Produce an assertion carrying an explicit counter value
        pub fn assert_with_counter(&self, challenge: &str, counter: u32) -> AuthenticationCredential {
            let client_data = self.client_data(CLIENT_DATA_GET, challenge);
            let auth_data = self.authenticator_data(counter);
            let signature = self.key.sign(&signed_message(&auth_data, &client_data));

            AuthenticationCredential {
                id: self.credential_id.clone(),
                kind: "public-key".to_string(),
                response: AssertionResponse {
                    client_data_json: encode(&client_data),
                    authenticator_data: encode(&auth_data),
                    signature: encode(&signature.to_bytes()),
                    user_handle: None,
                },
            }
        }

        /// Produce an assertion with the next counter value
        pub fn assert(&mut self, options: &RequestOptions) -> AuthenticationCredential {
            self.counter += 1;
            self.assert_with_counter(&options.challenge, self.counter)
        }
    }
}
