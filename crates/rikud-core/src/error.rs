//! Errors surfaced by playback operations.

use thiserror::Error;

use crate::catalog::Variant;
use crate::engine::EngineError;


/// Why a track could not be loaded.
#[derive( Debug, Error )]
pub enum LoadError {
    #[error( "Audio source URL is missing" )]
    MissingSource,

    #[error( "{0}" )]
    Engine( #[from] EngineError ),
}


/// Errors returned to callers of the adapter and coordinator.
#[derive( Debug, Error )]
pub enum PlaybackError {
    #[error( "No {variant} audio available for {entry_id}" )]
    NoSource { entry_id: String, variant: Variant },

    #[error( "Failed to load track: {0}" )]
    Load( #[from] LoadError ),

    #[error( "Playback command failed: {0}" )]
    Transport( EngineError ),

    #[error( "Player has been disposed" )]
    Disposed,
}
