//! Production `TokenRefresher`: a standard OAuth2 refresh-token POST
//! against whichever token endpoint the resolved configuration names for
//! the given provider (§4.2/§6).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use xsync_config::ResolvedConfig;
use xsync_schemas::{EngineError, EngineResult, Provider};
use xsync_token::{RefreshedTokens, TokenRefresher};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

pub struct HttpOAuthRefresher {
    http: reqwest::Client,
    config: ResolvedConfig,
}

impl HttpOAuthRefresher {
    pub fn new(config: ResolvedConfig) -> Self {
        Self { http: reqwest::Client::new(), config }
    }

    fn endpoint_and_credentials(&self, provider: Provider) -> (&str, &str, &str) {
        match provider {
            Provider::Sor => (
                self.config.sor_oauth_token_url.as_str(),
                self.config.sor_client_id.as_str(),
                self.config.sor_client_secret.as_str(),
            ),
            Provider::Grid => (
                self.config.grid_oauth_token_url.as_str(),
                self.config.grid_client_id.as_str(),
                self.config.grid_client_secret.as_str(),
            ),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpOAuthRefresher {
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> EngineResult<RefreshedTokens> {
        let (url, client_id, client_secret) = self.endpoint_and_credentials(provider);

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| EngineError::network(format!("{} token refresh request failed: {e}", provider.as_str())))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::network(format!("{} token refresh response read failed: {e}", provider.as_str())))?;

        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::oauth(format!("{} refresh rejected ({status}): {text}", provider.as_str()))
                .with_provider(provider.as_str()));
        }
        if !status.is_success() {
            return Err(EngineError::network(format!("{} refresh failed ({status}): {text}", provider.as_str()))
                .with_provider(provider.as_str()));
        }

        let parsed: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| EngineError::validation(format!("{} refresh response decode failed: {e}", provider.as_str())))?;

        Ok(RefreshedTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: Duration::from_secs(parsed.expires_in),
        })
    }
}
