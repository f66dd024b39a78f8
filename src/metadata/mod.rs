//! Catalog metadata: reference parsing and the HTTP resolver.

mod client;
mod models;
mod source_ref;

pub use client::HttpMetadataResolver;
pub use models::{CollectionResponse, CollectionTrack, TrackResponse};
pub use source_ref::{ReferenceKind, SourceReference, SourceReferenceError};
