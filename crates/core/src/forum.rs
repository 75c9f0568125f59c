//! Persistence boundary: read/write access to forum entities.
//!
//! The runtime never issues storage queries itself. Script tools reach
//! these through the sandbox's curated host API, which checks
//! [`ForumRepository::can_perform`] before any mutation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ForumError;
use crate::message::UserRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub topic_id: i64,
    pub user_id: i64,
    pub post_number: i32,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub posts_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: i64,
    pub url: String,
    pub original_filename: String,
    #[serde(default)]
    pub short_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub topic_id: i64,
    pub raw: String,
    #[serde(default)]
    pub reply_to_post_number: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTopic {
    pub title: String,
    pub raw: String,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUpload {
    pub filename: String,
    /// Base64 or plain text content, as supplied by the tool
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub post_id: i64,
    pub topic_id: i64,
    pub title: String,
    pub excerpt: String,
}

/// A mutation the acting user must be permitted to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForumAction {
    CreatePost { topic_id: i64 },
    EditPost { post_id: i64 },
    CreateTopic { category_id: Option<i64> },
    CreateUpload,
}

/// Opaque repository over forum content, supplied by the embedding
/// application.
#[async_trait]
pub trait ForumRepository: Send + Sync {
    async fn post(&self, id: i64) -> Result<Post, ForumError>;

    async fn topic(&self, id: i64) -> Result<Topic, ForumError>;

    async fn user(&self, username: &str) -> Result<User, ForumError>;

    async fn upload(&self, id: i64) -> Result<Upload, ForumError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ForumError>;

    async fn create_post(&self, author: &UserRef, post: NewPost) -> Result<Post, ForumError>;

    async fn update_post(&self, editor: &UserRef, id: i64, raw: &str) -> Result<Post, ForumError>;

    async fn create_topic(&self, author: &UserRef, topic: NewTopic) -> Result<Topic, ForumError>;

    async fn create_upload(&self, author: &UserRef, upload: NewUpload)
    -> Result<Upload, ForumError>;

    /// Whether `user` may perform `action`.
    async fn can_perform(&self, user: &UserRef, action: &ForumAction) -> bool;
}
