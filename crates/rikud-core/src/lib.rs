//! Rikud Core - Playback coordination for the dance catalog
//!
//! This crate provides the playback core used by every Rikud front end:
//! an adapter over a pluggable audio engine, a shared playback state store
//! with observer fan-out, the coordinator that ties transport control to
//! catalog entries, and the best-effort play statistics recorder.

pub mod adapter;
pub mod catalog;
pub mod command;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod recorder;
pub mod state;

pub use adapter::{ AdapterStatus, AudioAdapter, Generation, LoadOutcome, Track };
pub use catalog::{ format_duration, Catalog, CatalogEntry, CatalogError, PlayStats, Variant };
pub use command::{ Command, CommandError };
pub use coordinator::{ Coordinator, StatsUpdate };
pub use engine::{ AudioEngine, EngineConfig, EngineError, EngineHandle, EngineStatus, LoadedSource };
pub use engine::local::LocalEngine;
pub use error::{ LoadError, PlaybackError };
pub use recorder::{ LocalRecorder, PlayRecorder, RestRecorder, StatsError };
pub use state::{ PlaybackState, PlaybackStore, StatePatch, Subscription };
