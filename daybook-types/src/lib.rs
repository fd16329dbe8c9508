//! Core type definitions for the Daybook plugin runtime.
//!
//! This crate defines the fundamental, plugin-agnostic types used throughout
//! the runtime:
//! - Record and message identifiers (UUID v7)
//! - Actor identities for call attribution
//! - Plugin manifests with dependency/conflict declarations
//! - The fixed-capacity newest-first ring log
//! - Collaborator traits (registry, conflict lookup, event bus)
//!
//! All domain-specific types (calendar entities, view models, storage rows)
//! belong to their respective plugins or host layers, not here.

mod ids;
mod manifest;
mod ports;
mod ringlog;

pub use ids::{ActorId, MessageId, RecordId};
pub use manifest::{
    ConflictInfo, ConflictRef, DependencyRef, ManifestError, PluginInfo, PluginManifest,
};
pub use ports::{topics, ConflictLookup, EventBus, PluginRegistry};
pub use ringlog::RingLog;
