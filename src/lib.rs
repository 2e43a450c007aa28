//! Relays browser chat messages into the comment thread of a GitHub issue,
//! which doubles as the chat's persistent history.

pub mod api;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod relay;
pub mod store;

pub use config::Config;
pub use error::{ConfigError, RelayError, StoreError};
pub use rate_limit::RateLimiter;
pub use relay::{ChatMessage, PostReceipt, PostRequest, Relay};
pub use store::{Comment, CommentStore, GithubCommentStore};
