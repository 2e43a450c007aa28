use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::StoreError};

/// How many comments one listing asks for.
pub const LIST_PAGE_SIZE: u32 = 200;

const ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("chat-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommentUser {
    pub login: String,
    pub avatar_url: String,
}

/// An issue comment as the store returns it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Comment {
    pub id: u64,
    /// `None` for comments whose author account was deleted.
    #[serde(default)]
    pub user: Option<CommentUser>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub body: Option<String>,
    pub html_url: String,
}

#[derive(Serialize)]
struct CreateComment<'a> {
    body: &'a str,
}

/// The comment thread the relay reads from and appends to.
#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn list_comments(&self) -> Result<Vec<Comment>, StoreError>;
    async fn create_comment(&self, body: &str) -> Result<Comment, StoreError>;
}

/// GitHub issue comments over the REST API.
#[derive(Debug, Clone)]
pub struct GithubCommentStore {
    client: reqwest::Client,
    comments_url: String,
}

impl GithubCommentStore {
    pub fn new(config: &Config) -> Result<GithubCommentStore, StoreError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
            .map_err(|_| StoreError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.store_timeout)
            .build()?;

        let thread = &config.thread;
        Ok(GithubCommentStore {
            client,
            comments_url: format!(
                "{}/repos/{}/{}/issues/{}/comments",
                config.api_base, thread.owner, thread.repo, thread.number
            ),
        })
    }

    pub fn comments_url(&self) -> &str {
        &self.comments_url
    }
}

// Non-2xx responses become `StoreError::Status` with the body kept for the log.
async fn read_json<T>(response: reqwest::Response) -> Result<T, StoreError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(StoreError::Status { status, body });
    }
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl CommentStore for GithubCommentStore {
    async fn list_comments(&self) -> Result<Vec<Comment>, StoreError> {
        let response = self
            .client
            .get(&self.comments_url)
            .query(&[("per_page", LIST_PAGE_SIZE)])
            .send()
            .await?;
        read_json(response).await
    }

    async fn create_comment(&self, body: &str) -> Result<Comment, StoreError> {
        let response = self
            .client
            .post(&self.comments_url)
            .json(&CreateComment { body })
            .send()
            .await?;
        read_json(response).await
    }
}
