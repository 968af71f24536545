//! Remote sync API
//!
//! The [`RemoteApi`] trait is the seam between the sync engine and the
//! server. [`HttpRemote`] speaks the JSON protocol over HTTP:
//!
//! - `GET {base}/sync/incremental?since=<rfc3339>` returns [`RemoteChanges`]
//! - `POST {base}/sync` with a [`PushRequest`] returns a [`PushResponse`]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Book, Bookmark, EntityKind, Note, ReadingPosition, UserPreferences};

/// One entity as exchanged with the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum SyncRecord {
    Book(Book),
    Note(Note),
    Position(ReadingPosition),
    Bookmark(Bookmark),
    Preferences(UserPreferences),
    /// A deletion
    Deleted {
        entity: EntityKind,
        id: String,
        deleted_at: DateTime<Utc>,
    },
}

impl SyncRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            SyncRecord::Book(_) => EntityKind::Book,
            SyncRecord::Note(_) => EntityKind::Note,
            SyncRecord::Position(_) => EntityKind::Position,
            SyncRecord::Bookmark(_) => EntityKind::Bookmark,
            SyncRecord::Preferences(_) => EntityKind::Preferences,
            SyncRecord::Deleted { entity, .. } => *entity,
        }
    }

    pub fn id(&self) -> String {
        match self {
            SyncRecord::Book(book) => book.id.to_string(),
            SyncRecord::Note(note) => note.id.to_string(),
            SyncRecord::Position(position) => position.id.to_string(),
            SyncRecord::Bookmark(bookmark) => bookmark.id.to_string(),
            SyncRecord::Preferences(_) => UserPreferences::ID.to_string(),
            SyncRecord::Deleted { id, .. } => id.clone(),
        }
    }

    /// Timestamp compared during conflict resolution
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            SyncRecord::Book(book) => book.updated_at,
            SyncRecord::Note(note) => note.updated_at,
            SyncRecord::Position(position) => position.updated_at,
            SyncRecord::Bookmark(bookmark) => bookmark.updated_at,
            SyncRecord::Preferences(preferences) => preferences.updated_at,
            SyncRecord::Deleted { deleted_at, .. } => *deleted_at,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, SyncRecord::Deleted { .. })
    }

    /// Order in which remote records are applied: parents before children,
    /// deletions last
    pub(crate) fn apply_rank(&self) -> u8 {
        match self {
            SyncRecord::Book(_) => 0,
            SyncRecord::Preferences(_) => 1,
            SyncRecord::Note(_) | SyncRecord::Position(_) | SyncRecord::Bookmark(_) => 2,
            SyncRecord::Deleted { .. } => 3,
        }
    }
}

/// Changes the remote has seen since a watermark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChanges {
    pub records: Vec<SyncRecord>,
    /// Server clock at the time of the response; the next watermark
    pub server_time: DateTime<Utc>,
}

/// Outcome of pushing one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckStatus {
    /// The remote stored the record
    Committed,
    /// The remote holds a different version
    Conflict { remote: SyncRecord },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub kind: EntityKind,
    pub id: String,
    #[serde(flatten)]
    pub status: AckStatus,
}

impl PushAck {
    pub fn committed(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            status: AckStatus::Committed,
        }
    }

    pub fn conflict(remote: SyncRecord) -> Self {
        Self {
            kind: remote.kind(),
            id: remote.id(),
            status: AckStatus::Conflict { remote },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub changes: Vec<SyncRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub acks: Vec<PushAck>,
}

/// Failure of a remote call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Connection failed or was interrupted
    #[error("Network error: {0}")]
    Network(String),

    /// The server failed (5xx, 429)
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server refused the request (4xx)
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Server { .. } | RemoteError::Timeout(_)
        )
    }
}

/// The remote side of synchronization
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Changes recorded by the remote after `since` (everything when `None`)
    async fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<RemoteChanges, RemoteError>;

    /// Push local changes; returns one ack per record the remote processed
    async fn push_changes(&self, changes: &[SyncRecord]) -> Result<Vec<PushAck>, RemoteError>;
}

/// [`RemoteApi`] over HTTP with JSON bodies
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    /// Build a client for `base_url`
    ///
    /// `request_timeout` bounds a single HTTP request; the engine applies the
    /// per-operation timeouts on top.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("airis/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<RemoteChanges, RemoteError> {
        let url = format!("{}/sync/incremental", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(since) = since {
            let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
            request = request.query(&[("since", since)]);
        }

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        serde_json::from_slice(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid changes payload: {e}")))
    }

    async fn push_changes(&self, changes: &[SyncRecord]) -> Result<Vec<PushAck>, RemoteError> {
        let url = format!("{}/sync", self.base_url);
        let body = PushRequest {
            changes: changes.to_vec(),
        };

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        let decoded: PushResponse = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid push payload: {e}")))?;
        Ok(decoded.acks)
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Network(format!("request timed out: {error}"))
    } else if error.is_decode() {
        RemoteError::InvalidResponse(error.to_string())
    } else {
        RemoteError::Network(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> RemoteError {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let message: String = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREVIEW_CHAR_LIMIT)
        .collect();
    let code = status.as_u16();

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RemoteError::Server {
            status: code,
            message,
        },
        _ if status.is_client_error() => RemoteError::Rejected {
            status: code,
            message,
        },
        _ => RemoteError::Server {
            status: code,
            message,
        },
    }
}
