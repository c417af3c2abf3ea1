//! HTTP client for NoChat API
//!
//! Handles all communication with the NoChat backend server.

use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use urlencoding::encode;

use crate::api::ServerApi;
use crate::config::Config;
use crate::crypto::keys::IdentityPublicKey;
use crate::crypto::x3dh::PreKeyBundle;
use crate::error::{AppError, AppResult};
use crate::models::{KeyExchangeRecord, OutboundMessage, PrekeyUpload, WrappedKeyEntry};

#[derive(Debug, Deserialize)]
struct SessionBlobResponse {
    session_data: String,
}

#[derive(Debug, Deserialize)]
struct PrekeyCountResponse {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    identity: IdentityPublicKey,
}

/// API client for NoChat backend
#[derive(Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Set the bearer token used for every request
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    /// Build URL for endpoint
    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> AppResult<RequestBuilder> {
        let token = self
            .token
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(AppError::NotAuthenticated)?;
        Ok(request.header("Authorization", format!("Bearer {}", token)))
    }

    async fn send(&self, request: RequestBuilder) -> AppResult<Response> {
        let response = self.authorize(request)?.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                AppError::Network(e.to_string())
            } else {
                AppError::Http(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::SessionExpired);
        }
        Ok(response)
    }

    /// Handle response and parse JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> AppResult<T> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let data = response.json().await?;
        Ok(data)
    }

    /// Like `handle_response`, but 404 means "absent"
    async fn handle_optional<T: DeserializeOwned>(&self, response: Response) -> AppResult<Option<T>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    async fn handle_empty(&self, response: Response) -> AppResult<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> AppResult<T> {
        let response = self.send(self.client.get(self.url(endpoint))).await?;
        self.handle_response(response).await
    }

    async fn get_optional<T: DeserializeOwned>(&self, endpoint: &str) -> AppResult<Option<T>> {
        let response = self.send(self.client.get(self.url(endpoint))).await?;
        self.handle_optional(response).await
    }

    async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> AppResult<()> {
        let response = self
            .send(self.client.post(self.url(endpoint)).json(body))
            .await?;
        self.handle_empty(response).await
    }

    async fn put<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> AppResult<()> {
        let response = self
            .send(self.client.put(self.url(endpoint)).json(body))
            .await?;
        self.handle_empty(response).await
    }

    async fn delete(&self, endpoint: &str) -> AppResult<()> {
        let response = self.send(self.client.delete(self.url(endpoint))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.handle_empty(response).await
    }
}

#[async_trait]
impl ServerApi for ApiClient {
    // ========================================================================
    // Session Endpoints
    // ========================================================================

    async fn get_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<Option<String>> {
        let response: Option<SessionBlobResponse> = self
            .get_optional(&format!(
                "/api/crypto/sessions/{}/{}",
                encode(conversation_id),
                encode(peer_id)
            ))
            .await?;
        Ok(response.map(|r| r.session_data))
    }

    async fn save_session_blob(&self, conversation_id: &str, peer_id: &str, blob: &str) -> AppResult<()> {
        #[derive(Serialize)]
        struct SaveSessionRequest<'a> {
            session_data: &'a str,
        }

        self.put(
            &format!(
                "/api/crypto/sessions/{}/{}",
                encode(conversation_id),
                encode(peer_id)
            ),
            &SaveSessionRequest { session_data: blob },
        )
        .await
    }

    async fn delete_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<()> {
        self.delete(&format!(
            "/api/crypto/sessions/{}/{}",
            encode(conversation_id),
            encode(peer_id)
        ))
        .await
    }

    // ========================================================================
    // Key Endpoints
    // ========================================================================

    async fn get_prekey_bundle(&self, user_id: &str) -> AppResult<Option<PreKeyBundle>> {
        self.get_optional(&format!("/api/crypto/bundles/{}", encode(user_id)))
            .await
    }

    async fn get_identity_key(&self, user_id: &str) -> AppResult<Option<IdentityPublicKey>> {
        let response: Option<IdentityResponse> = self
            .get_optional(&format!("/api/crypto/identity/{}", encode(user_id)))
            .await?;
        Ok(response.map(|r| r.identity))
    }

    async fn publish_identity(&self, identity: &IdentityPublicKey) -> AppResult<()> {
        self.put("/api/crypto/identity", identity).await
    }

    async fn get_prekey_count(&self) -> AppResult<usize> {
        let response: PrekeyCountResponse = self.get("/api/crypto/prekeys/count").await?;
        Ok(response.count)
    }

    async fn upload_prekeys(&self, upload: &PrekeyUpload) -> AppResult<()> {
        self.post("/api/crypto/prekeys", upload).await
    }

    // ========================================================================
    // Key Exchange Endpoints
    // ========================================================================

    async fn initiate_key_exchange(&self, record: &KeyExchangeRecord) -> AppResult<()> {
        self.post("/api/crypto/exchanges", record).await
    }

    async fn get_pending_key_exchanges(&self) -> AppResult<Vec<KeyExchangeRecord>> {
        self.get("/api/crypto/exchanges/pending").await
    }

    async fn accept_key_exchange(&self, exchange_id: &str) -> AppResult<()> {
        self.post(
            &format!("/api/crypto/exchanges/{}/accept", encode(exchange_id)),
            &serde_json::json!({}),
        )
        .await
    }

    // ========================================================================
    // Message Endpoints
    // ========================================================================

    async fn send_message(&self, message: &OutboundMessage) -> AppResult<()> {
        self.post(
            &format!(
                "/api/conversations/{}/messages",
                encode(&message.payload.conversation_id)
            ),
            message,
        )
        .await
    }

    async fn fetch_wrapped_key(&self, message_id: &str, revision: u32) -> AppResult<Option<WrappedKeyEntry>> {
        self.get_optional(&format!(
            "/api/messages/{}/keys/me?revision={}",
            encode(message_id),
            revision
        ))
        .await
    }

    async fn edit_message(&self, message: &OutboundMessage) -> AppResult<()> {
        self.put(
            &format!(
                "/api/conversations/{}/messages/{}",
                encode(&message.payload.conversation_id),
                encode(&message.payload.message_id)
            ),
            message,
        )
        .await
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> AppResult<()> {
        self.delete(&format!(
            "/api/conversations/{}/messages/{}",
            encode(conversation_id),
            encode(message_id)
        ))
        .await
    }

    async fn add_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.post(
            &format!(
                "/api/conversations/{}/messages/{}/reactions",
                encode(conversation_id),
                encode(message_id)
            ),
            &serde_json::json!({ "emoji": emoji }),
        )
        .await
    }

    async fn remove_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.delete(&format!(
            "/api/conversations/{}/messages/{}/reactions/{}",
            encode(conversation_id),
            encode(message_id),
            encode(emoji)
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_require_token() {
        let client = ApiClient::new(&Config::default()).unwrap();
        assert!(matches!(
            client.get_prekey_count().await,
            Err(AppError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_url_building() {
        let config = Config {
            api_url: "https://example.test/".to_string(),
            ..Config::default()
        };
        let client = ApiClient::new(&config).unwrap();
        assert_eq!(client.url("/api/x"), "https://example.test/api/x");
    }
}
