use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, HeaderValue};
use serde_json::json;
use url::Url;

use crate::error::{ClientError, Result};
use crate::session::{Conversation, ConversationSummary, Exercise, Identity, ResultRecord, StreamRequest};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub const LLM_MODE_HEADER: &str = "x-llm-mode";

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Never fails: any problem resolving the session reads as "not logged in".
    async fn current_user(&self) -> Identity;
}

#[async_trait]
pub trait ExerciseCatalog: Send + Sync {
    async fn list_exercises(&self) -> Result<Vec<Exercise>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Conversation>;
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>>;
    async fn delete_conversation(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ResultRecorder: Send + Sync {
    async fn record_result(&self, record: &ResultRecord) -> Result<()>;
}

/// Opens the streamed reply for one user message. Dropping the returned
/// stream closes the connection.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream>;
}

/// Every collaborator the chat controller talks to, over plain HTTP with a
/// cookie-backed session.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: Url,
    llm_mode: String,
    jar: Arc<Jar>,
    client: reqwest::Client,
}

impl HttpBackend {
    /// `saved_cookies` is a `Cookie` header value persisted from an earlier run.
    pub fn new(base_url: &str, llm_mode: &str, saved_cookies: Option<&str>) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        let jar = Arc::new(Jar::default());
        if let Some(cookies) = saved_cookies {
            for pair in cookies.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                jar.add_cookie_str(pair, &base_url);
            }
        }
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base_url, llm_mode: llm_mode.to_string(), jar, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Current cookies for the backend origin, in `Cookie` header form.
    pub fn cookies(&self) -> Option<String> {
        self.jar
            .cookies(&self.base_url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
            .filter(|v| !v.is_empty())
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// `prefix` with `id` appended as one percent-encoded path segment.
    fn resource_url(&self, prefix: &str, id: &str) -> Result<Url> {
        if matches!(id, "" | "." | "..") {
            return Err(ClientError::InvalidId(id.to_string()));
        }
        let mut url = self.url(prefix)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidId(id.to_string()))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), %body, "backend request failed");
        Err(ClientError::Status { status: status.as_u16(), body })
    }

    /// Starts a demo session; `demo_key` keeps the same demo user across logins.
    pub async fn demo_login(&self, demo_key: &str) -> Result<Identity> {
        let resp = self
            .client
            .post(self.url("/api/auth/dev-login")?)
            .json(&json!({ "demoKey": demo_key }))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<Identity>().await.unwrap_or_default())
    }

    pub async fn logout(&self) -> Result<()> {
        let resp = self.client.get(self.url("/api/auth/logout")?).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn fetch_identity(&self) -> Result<Identity> {
        let resp = self.client.get(self.url("/api/auth/me")?).send().await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl IdentityProvider for HttpBackend {
    async fn current_user(&self) -> Identity {
        match self.fetch_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!(error = %e, "identity check failed, treating as logged out");
                Identity::anonymous()
            }
        }
    }
}

#[async_trait]
impl ExerciseCatalog for HttpBackend {
    async fn list_exercises(&self) -> Result<Vec<Exercise>> {
        let resp = self.client.get(self.url("/api/ejercicios")?).send().await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ConversationStore for HttpBackend {
    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let resp = self.client.get(self.resource_url("/api/interacciones", id)?).send().await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let resp = self
            .client
            .get(self.resource_url("/api/interacciones/user", user_id)?)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        let resp = self.client.delete(self.resource_url("/api/interacciones", id)?).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultRecorder for HttpBackend {
    async fn record_result(&self, record: &ResultRecord) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/api/resultados/finalizar")?)
            .json(record)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for HttpBackend {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream> {
        let mut body = request.clone();
        if body.llm_mode.is_none() {
            body.llm_mode = Some(self.llm_mode.clone());
        }
        let mode = HeaderValue::from_str(body.llm_mode.as_deref().unwrap_or_default())
            .unwrap_or_else(|_| HeaderValue::from_static("upv"));
        let resp = self
            .client
            .post(self.url("/api/ollama/chat/stream")?)
            .header(LLM_MODE_HEADER, mode)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(Box::pin(resp.bytes_stream().map(|item| item.map_err(|e| ClientError::Stream(e.to_string())))))
    }
}
