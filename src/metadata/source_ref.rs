//! Parsing of catalog references into their canonical `spotify:<kind>:<id>` form.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
    static ref URL_RE: Regex = Regex::new(
        r"^https?://open\.spotify\.com/(?:intl-[A-Za-z]{2}(?:-[A-Za-z]{2})?/)?(track|album|playlist)/([A-Za-z0-9]{22})(?:[/?#].*)?$"
    )
    .expect("Invalid source URL regex");
    static ref URI_RE: Regex = Regex::new(r"^spotify:(track|album|playlist):([A-Za-z0-9]{22})$")
        .expect("Invalid source URI regex");
    static ref BARE_ID_RE: Regex =
        Regex::new(r"^[A-Za-z0-9]{22}$").expect("Invalid bare id regex");
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceReferenceError {
    #[error("Empty source reference")]
    Empty,

    #[error("Unsupported source reference: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Track,
    Album,
    Playlist,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Track => "track",
            ReferenceKind::Album => "album",
            ReferenceKind::Playlist => "playlist",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "track" => Some(ReferenceKind::Track),
            "album" => Some(ReferenceKind::Album),
            "playlist" => Some(ReferenceKind::Playlist),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated catalog reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceReference {
    kind: ReferenceKind,
    id: String,
}

impl SourceReference {
    pub fn new(kind: ReferenceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Accepts share URLs, `spotify:` URIs and bare track ids.
    pub fn parse(input: &str) -> Result<Self, SourceReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SourceReferenceError::Empty);
        }

        let captures = URL_RE
            .captures(input)
            .or_else(|| URI_RE.captures(input));
        if let Some(captures) = captures {
            let kind = ReferenceKind::from_str(&captures[1])
                .ok_or_else(|| SourceReferenceError::Unsupported(input.to_string()))?;
            return Ok(Self::new(kind, &captures[2]));
        }

        if BARE_ID_RE.is_match(input) {
            return Ok(Self::new(ReferenceKind::Track, input));
        }

        Err(SourceReferenceError::Unsupported(input.to_string()))
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_collection(&self) -> bool {
        self.kind != ReferenceKind::Track
    }

    /// The form used as queue key, e.g. `spotify:track:4uLU6hMCjMI75M1A2tKUQC`.
    pub fn canonical(&self) -> String {
        format!("spotify:{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for SourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spotify:{}:{}", self.kind, self.id)
    }
}

impl FromStr for SourceReference {
    type Err = SourceReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
