// Recon Session - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{CredentialStore, SessionController};
pub use error::{ClientError, ErrorKind};
pub use http_client::ApiClient;
