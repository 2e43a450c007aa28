//! Chat semantics on top of the comment thread.
//!
//! Posting turns a display name and message into one comment; listing turns
//! the thread's comments back into chat messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, MessageLimits},
    error::RelayError,
    rate_limit::{ClientKey, RateLimiter},
    store::{Comment, CommentStore},
};

pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub avatar_url: String,
}

/// One entry of the chat log, derived from a comment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    pub author: Option<Author>,
    pub created_at: String,
    pub body: String,
    pub permalink: String,
}

impl From<Comment> for ChatMessage {
    fn from(comment: Comment) -> Self {
        ChatMessage {
            id: comment.id,
            author: comment.user.map(|user| Author {
                name: user.login,
                avatar_url: user.avatar_url,
            }),
            created_at: comment.created_at,
            body: comment.body.unwrap_or_default(),
            permalink: comment.html_url,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRequest {
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PostRequest {
    /// Parses a raw request body. Anything that is not a JSON object with
    /// string fields is invalid input.
    pub fn from_slice(bytes: &[u8]) -> Result<PostRequest, RelayError> {
        const NOT_AN_OBJECT: RelayError =
            RelayError::InvalidInput("request body must be a JSON object with a string `message`");
        // derived Deserialize would also fill the fields from a JSON array
        match serde_json::from_slice(bytes) {
            Ok(value @ serde_json::Value::Object(_)) => {
                serde_json::from_value(value).map_err(|_| NOT_AN_OBJECT)
            }
            _ => Err(NOT_AN_OBJECT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentRef {
    pub id: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostReceipt {
    pub ok: bool,
    pub comment: CommentRef,
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Escapes what the comment renderer would otherwise treat as structure:
/// backslashes, inline code fences and block quotes.
pub fn escape_message(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let indent = line.len() - line.trim_start_matches(' ').len();
        out.push_str(&line[..indent]);
        let rest = &line[indent..];
        if rest.starts_with('>') {
            out.push('\\');
        }
        for c in rest.chars() {
            if c == '\\' || c == '`' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Like [`escape_message`] but for the bold author line: emphasis markers
/// are escaped and line breaks flattened.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        match c {
            '\\' | '`' | '*' | '_' => {
                out.push('\\');
                out.push(c);
            }
            '\r' | '\n' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// Validates a post and renders the comment body for it.
pub fn compose_body(request: &PostRequest, limits: &MessageLimits) -> Result<String, RelayError> {
    let message = request
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or(RelayError::InvalidInput("message required"))?;
    let name = request
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME);

    let name = escape_name(truncate(name, limits.max_name_chars));
    let message = escape_message(truncate(message, limits.max_message_chars));
    Ok(format!("**{}**\n\n{}", name, message))
}

/// The relay service: rate limiting, validation and store calls.
pub struct Relay {
    store: Arc<dyn CommentStore>,
    limiter: RateLimiter,
    limits: MessageLimits,
}

impl Relay {
    pub fn new(config: &Config, store: Arc<dyn CommentStore>) -> Relay {
        Relay {
            store,
            limiter: RateLimiter::new(config.rate_limit),
            limits: config.limits,
        }
    }

    pub async fn list_messages(&self) -> Result<Vec<ChatMessage>, RelayError> {
        let comments = self.store.list_comments().await?;
        Ok(comments.into_iter().map(ChatMessage::from).collect())
    }

    /// Rate limit first, so malformed posts count against the window too.
    pub async fn post_message(&self, client: ClientKey, body: &[u8]) -> Result<PostReceipt, RelayError> {
        if !self.limiter.check(client).await {
            log::warn!("rate limit hit for {}", describe(client));
            return Err(RelayError::RateLimited);
        }
        let request = PostRequest::from_slice(body)?;
        let rendered = compose_body(&request, &self.limits)?;

        let created = self.store.create_comment(&rendered).await?;
        log::info!("posted comment {} for {}", created.id, describe(client));
        Ok(PostReceipt {
            ok: true,
            comment: CommentRef {
                id: created.id,
                url: created.html_url,
            },
        })
    }
}

fn describe(client: ClientKey) -> String {
    client.map_or_else(|| "unknown client".to_owned(), |ip| ip.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::{AllowedOrigin, RateLimit, Thread},
        error::StoreError,
        store::CommentUser,
    };

    /// In-memory store that records every call.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub comments: Mutex<Vec<Comment>>,
        pub created: Mutex<Vec<String>>,
        pub calls: AtomicUsize,
        pub fail_with: Mutex<Option<u16>>,
    }

    impl FakeStore {
        pub fn failing(status: u16) -> FakeStore {
            let store = FakeStore::default();
            *store.fail_with.lock().unwrap() = Some(status);
            store
        }

        fn failure(&self) -> Option<StoreError> {
            self.fail_with.lock().unwrap().map(|code| StoreError::Status {
                status: reqwest::StatusCode::from_u16(code).unwrap(),
                body: "{\"message\":\"Bad credentials\"}".to_owned(),
            })
        }
    }

    #[async_trait]
    impl CommentStore for FakeStore {
        async fn list_comments(&self) -> Result<Vec<Comment>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failure() {
                Some(err) => Err(err),
                None => Ok(self.comments.lock().unwrap().clone()),
            }
        }

        async fn create_comment(&self, body: &str) -> Result<Comment, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failure() {
                return Err(err);
            }
            self.created.lock().unwrap().push(body.to_owned());
            let id = 1000 + self.created.lock().unwrap().len() as u64;
            Ok(Comment {
                id,
                user: None,
                created_at: "2024-05-01T10:00:00Z".to_owned(),
                body: Some(body.to_owned()),
                html_url: format!("https://github.com/octo/site/issues/7#issuecomment-{}", id),
            })
        }
    }

    pub(crate) fn test_config(max_requests: u32) -> Config {
        Config {
            access_token: "ghp_secret".to_owned(),
            thread: Thread {
                owner: "octo".to_owned(),
                repo: "site".to_owned(),
                number: 7,
            },
            allowed_origin: AllowedOrigin::Any,
            port: 0,
            api_base: "http://127.0.0.1:1".to_owned(),
            static_dir: None,
            limits: MessageLimits::default(),
            rate_limit: RateLimit {
                max_requests,
                window: Duration::from_secs(60),
            },
            store_timeout: Duration::from_secs(1),
        }
    }

    fn post(name: Option<&str>, message: Option<&str>) -> PostRequest {
        PostRequest {
            display_name: name.map(str::to_owned),
            message: message.map(str::to_owned),
        }
    }

    #[test]
    fn composes_bold_author_then_message() {
        let body = compose_body(&post(Some("Ann"), Some("hello")), &MessageLimits::default()).unwrap();
        assert_eq!(body, "**Ann**\n\nhello");
    }

    #[test]
    fn blank_or_missing_name_is_anonymous() {
        let limits = MessageLimits::default();
        for name in &[None, Some(""), Some("   ")] {
            let body = compose_body(&post(*name, Some("hi")), &limits).unwrap();
            assert!(body.starts_with("**Anonymous**"), "{}", body);
        }
    }

    #[test]
    fn blank_message_is_invalid() {
        let limits = MessageLimits::default();
        for message in &[None, Some(""), Some(" \n\t ")] {
            assert!(matches!(
                compose_body(&post(Some("Ann"), *message), &limits),
                Err(RelayError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn truncates_to_caps_by_character() {
        let limits = MessageLimits {
            max_message_chars: 4000,
            max_name_chars: 100,
        };
        let name = "é".repeat(150);
        let message = "ü".repeat(5000);
        let body = compose_body(&post(Some(&name), Some(&message)), &limits).unwrap();

        let expected = format!("**{}**\n\n{}", "é".repeat(100), "ü".repeat(4000));
        assert_eq!(body, expected);
    }

    #[test]
    fn message_is_trimmed() {
        let body = compose_body(&post(Some(" Ann "), Some("  hi there \n")), &MessageLimits::default()).unwrap();
        assert_eq!(body, "**Ann**\n\nhi there");
    }

    #[test]
    fn escapes_quotes_and_code() {
        assert_eq!(escape_message("> quoted"), "\\> quoted");
        assert_eq!(escape_message("a\n  > nested"), "a\n  \\> nested");
        assert_eq!(escape_message("a > b"), "a > b");
        assert_eq!(escape_message("run `rm -rf`"), "run \\`rm -rf\\`");
        assert_eq!(escape_message("```\ncode\n```"), "\\`\\`\\`\ncode\n\\`\\`\\`");
        assert_eq!(escape_message("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn name_cannot_break_out_of_bold() {
        assert_eq!(escape_name("**evil**"), "\\*\\*evil\\*\\*");
        assert_eq!(escape_name("two\nlines"), "two lines");
        assert_eq!(escape_name("snake_case"), "snake\\_case");

        let body = compose_body(&post(Some("a**b"), Some("x")), &MessageLimits::default()).unwrap();
        assert!(body.starts_with("**a\\*\\*b**"));
    }

    #[test]
    fn parses_request_bodies() {
        let request = PostRequest::from_slice(br#"{"displayName":"Ann","message":"hi"}"#).unwrap();
        assert_eq!(request.display_name.as_deref(), Some("Ann"));
        assert_eq!(request.message.as_deref(), Some("hi"));

        let legacy = PostRequest::from_slice(br#"{"name":"Bob","message":"yo"}"#).unwrap();
        assert_eq!(legacy.display_name.as_deref(), Some("Bob"));

        let missing = PostRequest::from_slice(b"{}").unwrap();
        assert_eq!(missing.message, None);

        let bad: [&[u8]; 5] = [
            b"not json",
            br#"{"message": 5}"#,
            br#"["hi"]"#,
            br#"["Ann","hello"]"#,
            br#""hello""#,
        ];
        for bad in bad.iter() {
            assert!(matches!(
                PostRequest::from_slice(bad),
                Err(RelayError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn comment_maps_to_chat_message() {
        let comment = Comment {
            id: 5,
            user: Some(CommentUser {
                login: "ann".into(),
                avatar_url: "https://avatars/ann".into(),
            }),
            created_at: "2024-05-01T10:00:00Z".into(),
            body: Some("**Ann**\n\nhello".into()),
            html_url: "https://github.com/octo/site/issues/7#issuecomment-5".into(),
        };
        let message = ChatMessage::from(comment);
        assert_eq!(message.id, 5);
        assert_eq!(
            message.author,
            Some(Author {
                name: "ann".into(),
                avatar_url: "https://avatars/ann".into()
            })
        );
        assert_eq!(message.created_at, "2024-05-01T10:00:00Z");
        assert_eq!(message.body, "**Ann**\n\nhello");
        assert_eq!(message.permalink, "https://github.com/octo/site/issues/7#issuecomment-5");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["author"]["avatarUrl"], "https://avatars/ann");
        assert_eq!(json["createdAt"], "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn lists_in_store_order_with_ghost_authors() {
        let store = Arc::new(FakeStore::default());
        *store.comments.lock().unwrap() = vec![
            Comment {
                id: 1,
                user: None,
                created_at: "2024-05-01T10:00:00Z".into(),
                body: None,
                html_url: "u1".into(),
            },
            Comment {
                id: 2,
                user: Some(CommentUser {
                    login: "bob".into(),
                    avatar_url: "a".into(),
                }),
                created_at: "2024-05-01T10:01:00Z".into(),
                body: Some("second".into()),
                html_url: "u2".into(),
            },
        ];
        let relay = Relay::new(&test_config(6), store);

        let messages = relay.list_messages().await.unwrap();
        assert_eq!(messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(messages[0].author, None);
        assert_eq!(messages[0].body, "");
        assert_eq!(messages[1].body, "second");
    }

    #[tokio::test]
    async fn posts_and_echoes_store_ids() {
        let store = Arc::new(FakeStore::default());
        let relay = Relay::new(&test_config(6), store.clone());

        let receipt = relay
            .post_message(None, br#"{"displayName":"Ann","message":"hello"}"#)
            .await
            .unwrap();
        assert_eq!(
            receipt,
            PostReceipt {
                ok: true,
                comment: CommentRef {
                    id: 1001,
                    url: "https://github.com/octo/site/issues/7#issuecomment-1001".into()
                }
            }
        );
        let created = store.created.lock().unwrap();
        assert!(created[0].starts_with("**Ann**"));
        assert!(created[0].contains("hello"));
    }

    #[tokio::test]
    async fn invalid_post_never_reaches_store() {
        let store = Arc::new(FakeStore::default());
        let relay = Relay::new(&test_config(6), store.clone());

        let err = relay
            .post_message(None, br#"{"displayName":"Ann","message":"   "}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn array_body_is_invalid_and_never_reaches_store() {
        let store = Arc::new(FakeStore::default());
        let relay = Relay::new(&test_config(6), store.clone());

        let err = relay
            .post_message(None, br#"["Ann","hello"]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(store.created.lock().unwrap().is_empty());
    }

    #[test]
    fn escaped_message_at_most_doubles_the_cap() {
        let limits = MessageLimits::default();
        let message = "`".repeat(limits.max_message_chars + 500);
        let body = compose_body(&post(None, Some(&message)), &limits).unwrap();

        let text = body.strip_prefix("**Anonymous**\n\n").unwrap();
        assert_eq!(text.chars().count(), 2 * limits.max_message_chars);
        assert!(body.chars().count() <= "**Anonymous**\n\n".len() + 2 * limits.max_message_chars);
    }

    #[tokio::test]
    async fn rate_limited_post_never_reaches_store() {
        let store = Arc::new(FakeStore::default());
        let relay = Relay::new(&test_config(2), store.clone());
        let client = Some("203.0.113.9".parse().unwrap());
        let body = br#"{"message":"hi"}"#;

        relay.post_message(client, body).await.unwrap();
        relay.post_message(client, body).await.unwrap();
        assert!(matches!(
            relay.post_message(client, body).await,
            Err(RelayError::RateLimited)
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_failures_surface_as_upstream() {
        let relay = Relay::new(&test_config(6), Arc::new(FakeStore::failing(401)));

        assert!(matches!(relay.list_messages().await, Err(RelayError::Upstream(_))));
        assert!(matches!(
            relay.post_message(None, br#"{"message":"hi"}"#).await,
            Err(RelayError::Upstream(_))
        ));
    }
}
