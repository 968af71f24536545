//! Data models for Airis
//!
//! Defines the persisted entities: Book, Note, ReadingPosition, Bookmark,
//! UserPreferences and the cached AI Summary. Invariants that only need the
//! entity itself are checked here; cross-entity invariants (book references,
//! immutable format) are checked by the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::LimitSettings;
use crate::error::ValidationError;
use crate::events::StoreEvent;

/// The kinds of entity the store persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Book,
    Note,
    Position,
    Bookmark,
    Preferences,
    Summary,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Book => "book",
            EntityKind::Note => "note",
            EntityKind::Position => "position",
            EntityKind::Bookmark => "bookmark",
            EntityKind::Preferences => "preferences",
            EntityKind::Summary => "summary",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed entity stored in its own collection
///
/// Implemented by the entities that support generic CRUD through the store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    const KIND: EntityKind;
    /// Backing table name
    const TABLE: &'static str;

    fn id(&self) -> Uuid;
    fn set_id(&mut self, id: Uuid);
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_created_at(&mut self, at: DateTime<Utc>);
    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// The book this record belongs to, if any
    fn book_id(&self) -> Option<Uuid> {
        None
    }

    /// Invariants that only depend on the record itself
    fn validate(&self, limits: &LimitSettings) -> Result<(), ValidationError>;

    /// Case-insensitive match used by list filters
    fn matches_query(&self, query: &str) -> bool;

    /// Invariants relating this record to the stored version it replaces
    fn validate_update(&self, _previous: &Self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Event published after this record is written
    fn saved_event(&self, created: bool) -> StoreEvent;

    /// Event published after this record is deleted
    fn deleted_event(&self) -> StoreEvent;
}

// ==================== Book ====================

/// Supported book file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    Pdf,
    Epub,
    Txt,
}

impl BookFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Pdf => "pdf",
            BookFormat::Epub => "epub",
            BookFormat::Txt => "txt",
        }
    }
}

impl fmt::Display for BookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(BookFormat::Pdf),
            "epub" => Ok(BookFormat::Epub),
            "txt" => Ok(BookFormat::Txt),
            _ => Err(ValidationError::InvalidValue {
                field: "format",
                value: s.to_string(),
            }),
        }
    }
}

/// Descriptive metadata supplied by the document parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookMetadata {
    pub isbn: Option<String>,
    pub publisher: Option<String>,
    pub published_date: Option<String>,
    pub language: String,
    pub page_count: Option<u32>,
    pub description: Option<String>,
    pub cover_image: Option<String>,
    pub source: Option<String>,
    pub original_url: Option<String>,
}

impl Default for BookMetadata {
    fn default() -> Self {
        Self {
            isbn: None,
            publisher: None,
            published_date: None,
            language: "vi".to_string(),
            page_count: None,
            description: None,
            cover_image: None,
            source: None,
            original_url: None,
        }
    }
}

/// A book in the local library
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub author: Option<String>,
    /// Immutable once the book has been stored
    pub format: BookFormat,
    pub file_url: String,
    /// Size of the original file in bytes
    pub file_size: u64,
    /// Extracted text, supplied by the parsing collaborator
    pub text_content: Option<String>,
    #[serde(default)]
    pub metadata: BookMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// Create a new book with the given title and format
    pub fn new(title: impl Into<String>, format: BookFormat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            author: None,
            format,
            file_url: String::new(),
            file_size: 0,
            text_content: None,
            metadata: BookMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_file(mut self, file_url: impl Into<String>, file_size: u64) -> Self {
        self.file_url = file_url.into();
        self.file_size = file_size;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BookMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Record for Book {
    const KIND: EntityKind = EntityKind::Book;
    const TABLE: &'static str = "books";

    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn validate(&self, limits: &LimitSettings) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::Empty { field: "title" });
        }
        if self.file_size > limits.max_file_size {
            return Err(ValidationError::FileTooLarge {
                size: self.file_size,
                max: limits.max_file_size,
            });
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        Ok(())
    }

    fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.title.to_lowercase().contains(&query)
            || self
                .author
                .as_deref()
                .is_some_and(|a| a.to_lowercase().contains(&query))
    }

    fn validate_update(&self, previous: &Self) -> Result<(), ValidationError> {
        if self.format != previous.format {
            return Err(ValidationError::FormatChanged {
                from: previous.format.to_string(),
                to: self.format.to_string(),
            });
        }
        Ok(())
    }

    fn saved_event(&self, created: bool) -> StoreEvent {
        if created {
            StoreEvent::BookAdded(self.clone())
        } else {
            StoreEvent::BookUpdated(self.clone())
        }
    }

    fn deleted_event(&self) -> StoreEvent {
        StoreEvent::BookDeleted { id: self.id }
    }
}

// ==================== Positions ====================

/// A location inside a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub chapter: Option<u32>,
    pub page: Option<u32>,
    /// Absolute character offset into the text
    pub offset: u64,
    /// Progress through the book in [0, 1]
    pub percentage: f64,
}

impl Location {
    pub fn at(offset: u64, percentage: f64) -> Self {
        Self {
            chapter: None,
            page: None,
            offset,
            percentage,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("percentage", self.percentage, 0.0, 1.0)
    }
}

/// Where the reader is in a book
///
/// Progress may move backwards; the store-assigned `timestamp` strictly
/// increases on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub id: Uuid,
    pub book_id: Uuid,
    #[serde(flatten)]
    pub location: Location,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReadingPosition {
    pub fn new(book_id: Uuid, location: Location) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            book_id,
            location,
            timestamp: now,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for ReadingPosition {
    const KIND: EntityKind = EntityKind::Position;
    const TABLE: &'static str = "reading_positions";

    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.timestamp = at;
    }
    fn book_id(&self) -> Option<Uuid> {
        Some(self.book_id)
    }

    fn validate(&self, _limits: &LimitSettings) -> Result<(), ValidationError> {
        self.location.validate()?;
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        Ok(())
    }

    fn matches_query(&self, _query: &str) -> bool {
        false
    }

    fn saved_event(&self, _created: bool) -> StoreEvent {
        StoreEvent::PositionUpdated(self.clone())
    }

    fn deleted_event(&self) -> StoreEvent {
        StoreEvent::PositionDeleted {
            id: self.id,
            book_id: self.book_id,
        }
    }
}

// ==================== Note ====================

/// A reader's note attached to a book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: Uuid,
    pub book_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Where in the book the note was taken
    pub position: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(book_id: Uuid, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            book_id,
            content: content.into(),
            tags: Vec::new(),
            position: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.position = Some(location);
        self
    }

    /// Add a tag
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
}

impl Record for Note {
    const KIND: EntityKind = EntityKind::Note;
    const TABLE: &'static str = "notes";

    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
    fn book_id(&self) -> Option<Uuid> {
        Some(self.book_id)
    }

    fn validate(&self, _limits: &LimitSettings) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::Empty { field: "content" });
        }
        if let Some(ref location) = self.position {
            location.validate()?;
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        Ok(())
    }

    fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.content.to_lowercase().contains(&query)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&query))
    }

    fn saved_event(&self, created: bool) -> StoreEvent {
        if created {
            StoreEvent::NoteAdded(self.clone())
        } else {
            StoreEvent::NoteUpdated(self.clone())
        }
    }

    fn deleted_event(&self) -> StoreEvent {
        StoreEvent::NoteDeleted {
            id: self.id,
            book_id: self.book_id,
        }
    }
}

// ==================== Bookmark ====================

/// A named location the reader wants to come back to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bookmark {
    pub id: Uuid,
    pub book_id: Uuid,
    pub name: String,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(book_id: Uuid, name: impl Into<String>, location: Location) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            book_id,
            name: name.into().trim().to_string(),
            location,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for Bookmark {
    const KIND: EntityKind = EntityKind::Bookmark;
    const TABLE: &'static str = "bookmarks";

    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
    fn book_id(&self) -> Option<Uuid> {
        Some(self.book_id)
    }

    fn validate(&self, _limits: &LimitSettings) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        self.location.validate()?;
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        Ok(())
    }

    fn matches_query(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(&query.to_lowercase())
    }

    fn saved_event(&self, created: bool) -> StoreEvent {
        if created {
            StoreEvent::BookmarkAdded(self.clone())
        } else {
            StoreEvent::BookmarkUpdated(self.clone())
        }
    }

    fn deleted_event(&self) -> StoreEvent {
        StoreEvent::BookmarkDeleted {
            id: self.id,
            book_id: self.book_id,
        }
    }
}

// ==================== Preferences ====================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Vi,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Vi => "vi",
            Language::En => "en",
        }
    }
}

impl FromStr for Language {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vi" => Ok(Language::Vi),
            "en" => Ok(Language::En),
            _ => Err(ValidationError::InvalidValue {
                field: "language",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

impl FromStr for Theme {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            _ => Err(ValidationError::InvalidValue {
                field: "theme",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLength {
    Short,
    #[default]
    Medium,
    Long,
}

impl SummaryLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryLength::Short => "short",
            SummaryLength::Medium => "medium",
            SummaryLength::Long => "long",
        }
    }
}

impl FromStr for SummaryLength {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(SummaryLength::Short),
            "medium" => Ok(SummaryLength::Medium),
            "long" => Ok(SummaryLength::Long),
            _ => Err(ValidationError::InvalidValue {
                field: "summary_length",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStyle {
    Bullet,
    #[default]
    Paragraph,
}

impl SummaryStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStyle::Bullet => "bullet",
            SummaryStyle::Paragraph => "paragraph",
        }
    }
}

impl FromStr for SummaryStyle {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullet" => Ok(SummaryStyle::Bullet),
            "paragraph" => Ok(SummaryStyle::Paragraph),
            _ => Err(ValidationError::InvalidValue {
                field: "summary_style",
                value: s.to_string(),
            }),
        }
    }
}

/// Text-to-speech settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Speech rate in [0.5, 2.0]
    pub rate: f64,
    /// Volume in [0, 1]
    pub volume: f64,
    /// Pitch in [0, 2]
    pub pitch: f64,
    pub voice_id: Option<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            volume: 1.0,
            pitch: 1.0,
            voice_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub summary_length: SummaryLength,
    pub summary_style: SummaryStyle,
}

/// The user's preferences (one per store)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub language: Language,
    pub theme: Theme,
    pub voice: VoiceSettings,
    pub ai: AiSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: Language::default(),
            theme: Theme::default(),
            voice: VoiceSettings::default(),
            ai: AiSettings::default(),
            created_at: DateTime::UNIX_EPOCH,
            updated_at: DateTime::UNIX_EPOCH,
        }
    }
}

impl UserPreferences {
    /// Stable id of the singleton in storage and on the wire
    pub const ID: &'static str = "user";

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("voice.rate", self.voice.rate, 0.5, 2.0)?;
        check_range("voice.volume", self.voice.volume, 0.0, 1.0)?;
        check_range("voice.pitch", self.voice.pitch, 0.0, 2.0)?;
        if self.updated_at < self.created_at {
            return Err(ValidationError::TimestampOrder);
        }
        Ok(())
    }

    /// Merge a partial update onto these preferences
    pub fn apply(&mut self, patch: &PreferencesPatch) {
        if let Some(language) = patch.language {
            self.language = language;
        }
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(ref voice) = patch.voice {
            if let Some(rate) = voice.rate {
                self.voice.rate = rate;
            }
            if let Some(volume) = voice.volume {
                self.voice.volume = volume;
            }
            if let Some(pitch) = voice.pitch {
                self.voice.pitch = pitch;
            }
            if let Some(ref voice_id) = voice.voice_id {
                self.voice.voice_id = Some(voice_id.clone());
            }
        }
        if let Some(ref ai) = patch.ai {
            if let Some(length) = ai.summary_length {
                self.ai.summary_length = length;
            }
            if let Some(style) = ai.summary_style {
                self.ai.summary_style = style;
            }
        }
    }
}

/// A partial update to [`UserPreferences`]; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesPatch {
    pub language: Option<Language>,
    pub theme: Option<Theme>,
    pub voice: Option<VoicePatch>,
    pub ai: Option<AiPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePatch {
    pub rate: Option<f64>,
    pub volume: Option<f64>,
    pub pitch: Option<f64>,
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiPatch {
    pub summary_length: Option<SummaryLength>,
    pub summary_style: Option<SummaryStyle>,
}

impl PreferencesPatch {
    pub fn voice_rate(rate: f64) -> Self {
        Self {
            voice: Some(VoicePatch {
                rate: Some(rate),
                ..VoicePatch::default()
            }),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// ==================== Summary ====================

/// Generation options that are part of a summary's cache key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryOptions {
    pub language: Language,
    pub length: SummaryLength,
    pub style: SummaryStyle,
}

impl SummaryOptions {
    /// Cache key for a summary of `content_hash` with these options
    pub fn cache_key(&self, content_hash: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            content_hash,
            self.language.as_str(),
            self.length.as_str(),
            self.style.as_str()
        )
    }
}

/// A cached AI summary
///
/// Created by the summarizing collaborator and never edited; it leaves the
/// cache only by expiry or eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Content-addressed key of the summarized text
    pub content_hash: String,
    pub summary: String,
    /// Ordered key points
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub options: SummaryOptions,
    /// Book the summarized text came from, if known
    pub book_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Summary {
    pub fn new(content_hash: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            summary: summary.into(),
            key_points: Vec::new(),
            options: SummaryOptions::default(),
            book_id: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Content hash for a piece of text (hex SHA-256)
    pub fn hash_content(text: &str) -> String {
        format!("{:x}", Sha256::digest(text.as_bytes()))
    }

    pub fn with_options(mut self, options: SummaryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_key_points(mut self, key_points: Vec<String>) -> Self {
        self.key_points = key_points;
        self
    }

    pub fn for_book(mut self, book_id: Uuid) -> Self {
        self.book_id = Some(book_id);
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn cache_key(&self) -> String {
        self.options.cache_key(&self.content_hash)
    }

    /// An entry is expired once `now` is past `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content_hash.is_empty() {
            return Err(ValidationError::Empty {
                field: "content_hash",
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value.is_nan() || value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}
