// Bearer Session - client-side token pair with single-flight refresh

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{CredentialPair, CredentialRefreshCoordinator};
pub use error::{AuthError, TransportError};
pub use http_client::{RequestSpec, TransportResponse};
