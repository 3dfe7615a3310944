// Authentication module
// Credential persistence, token refresh and the session lifecycle

mod credentials;
mod refresh;
mod session;
mod types;

pub use credentials::{CredentialStore, StoredSession};
pub use refresh::RefreshCoordinator;
pub use session::{Session, SessionController, SessionEvent, SessionState};
pub use types::{
    AuthEndpoints, AuthResponse, ChangePasswordRequest, Credential, LoginRequest,
    RegisterRequest, TokenResponse, TokenValidation, UserProfile,
};
