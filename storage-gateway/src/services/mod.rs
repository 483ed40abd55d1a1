pub mod auth;
pub mod azure;
pub mod credential_store;
pub mod directory;
pub mod error;
pub mod invites;
pub mod jwt;
pub mod metrics;
pub mod object_store;
pub mod sas;
pub mod timeout;

pub use auth::AuthService;
pub use azure::AzureBlobStore;
pub use credential_store::{CredentialStore, MemoryCredentialStore, PgCredentialStore};
pub use directory::{Listing, ObjectDirectory};
pub use error::ServiceError;
pub use invites::InviteLedger;
pub use jwt::{JwtService, SessionClaims};
pub use object_store::{MemoryObjectStore, ObjectStore, StoreError};
pub use sas::SasSigner;
