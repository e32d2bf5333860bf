use tracing::{info, warn};

use crate::api::models::User;
use crate::api::{ApiClient, ApiError};

/// A signed-in backend session: the authorized client plus the user it
/// belongs to. Dropping it drops the credential.
#[derive(Debug, Clone)]
pub struct AuthSession {
    client: ApiClient,
    token: String,
    user: User,
}

impl AuthSession {
    /// Exchanges an identity-provider token for a backend access token and
    /// fetches the user it resolves to.
    pub async fn exchange(client: &ApiClient, id_token: &str) -> Result<Self, ApiError> {
        let token = client.without_token().google_sso(id_token).await?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            warn!("Unexpected token type {}; sending it as a bearer token", token.token_type);
        }
        let session = Self::resume(client, &token.access_token).await?;
        info!("Signed in as {}", session.user.email);
        Ok(session)
    }

    /// Validates an access token obtained earlier.
    pub async fn resume(client: &ApiClient, access_token: &str) -> Result<Self, ApiError> {
        let client = client.with_token(access_token);
        let user = client.current_user().await?;
        Ok(Self {
            client,
            token: access_token.to_string(),
            user,
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn access_token(&self) -> &str {
        &self.token
    }

    /// Invalidates the server session. The credential is gone either way.
    pub async fn sign_out(self) -> Result<(), ApiError> {
        let result = self.client.logout().await;
        if let Err(e) = &result {
            warn!("Logout request failed: {}", e);
        }
        result
    }
}
