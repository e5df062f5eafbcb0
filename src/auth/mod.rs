// Credential ceremonies and session management
//
// The operator registers a public-key credential once, then proves possession
// of it through challenge/response assertions. Each successful ceremony
// produces a new current session whose token the poller presents to the
// control plane.

mod authenticator;
pub mod ceremony;
mod session;

pub use authenticator::{AuthSettings, Authenticator, BUCKET_CREDENTIALS, check_user_id};
pub use ceremony::{AuthenticationCredential, CreationOptions, RegistrationCredential, RequestOptions};
pub use session::{AuthState, AuthStats, CleanupReport, Credential, Session};
