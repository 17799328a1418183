// Authentication module
// Manages the token pair lifecycle and single-flight refresh

mod background;
mod expiry;
mod manager;
mod refresh;
mod store;
mod types;

pub use background::{check_and_refresh, spawn_auto_refresh, AutoRefreshConfig, RefreshCheck};
pub use expiry::{ExpiryExtractor, JwtExpiry};
pub use manager::{CoordinatorBuilder, CredentialRefreshCoordinator};
pub use refresh::{HttpAuthTransport, RefreshTransport};
pub use store::{CredentialStore, MemoryStore, SqliteStore};
pub use types::{CredentialPair, TokenInfo, TokenKind, TokenStatus};
