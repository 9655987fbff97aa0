pub mod import;
pub mod model;

pub use model::{
    AccountProfile, ApiKeyCredentials, AuthType, Credential, CredentialResponse,
    CredentialSecret, HealthStatus, OAuthCredentials, Pool, UpstreamAuth,
};
