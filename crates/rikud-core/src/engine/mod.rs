//! Audio engine capability
//!
//! The playback core drives any engine that can load a source URL into a
//! handle, apply transport commands to that handle, and report status for
//! it asynchronously. [`local::LocalEngine`] is the bundled implementation.

pub mod decoder;
pub mod local;
pub mod output;

#[cfg( test )]
pub(crate) mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;


/// Errors reported by an audio engine.
#[derive( Debug, Error )]
pub enum EngineError {
    #[error( "Source unavailable: {0}" )]
    SourceUnavailable( String ),

    #[error( "Unsupported format: {0}" )]
    UnsupportedFormat( String ),

    #[error( "No output device available" )]
    NoDevice,

    #[error( "Audio output error: {0}" )]
    Output( String ),

    #[error( "Command rejected: {0}" )]
    Rejected( String ),

    #[error( "Unknown engine handle {0:?}" )]
    UnknownHandle( EngineHandle ),
}


/// Opaque identifier of a loaded engine resource.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub struct EngineHandle( u64 );


impl EngineHandle {
    pub fn new( raw: u64 ) -> Self {
        Self( raw )
    }


    pub fn raw( self ) -> u64 {
        self.0
    }
}


/// Status reported by the engine for one handle.
#[derive( Debug, Clone, PartialEq )]
pub enum EngineStatus {
    Progress {
        position: Duration,
        duration: Option<Duration>,
        playing: bool,
    },
    /// Reached the end of the source.
    Finished,
    /// The resource is dead (stream dropped, device lost).
    Failed { message: String },
}


/// A freshly loaded resource.
#[derive( Debug )]
pub struct LoadedSource {
    pub handle: EngineHandle,
    /// Duration, if the engine can tell yet.
    pub duration: Option<Duration>,
    /// Status channel for this handle; closed when the handle is released.
    pub status: mpsc::UnboundedReceiver<EngineStatus>,
}


/// Engine configuration.
#[derive( Debug, Clone )]
pub struct EngineConfig {
    /// How often a playing handle reports its position.
    pub status_interval: Duration,
    /// Timeout for fetching remote sources.
    pub fetch_timeout: Duration,
}


impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_millis( 250 ),
            fetch_timeout: Duration::from_secs( 30 ),
        }
    }
}


/// An audio engine the playback core can drive.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Loads `url`, paused, at `volume`.
    async fn load( &self, url: &str, volume: f32 ) -> Result<LoadedSource, EngineError>;

    async fn play( &self, handle: EngineHandle ) -> Result<(), EngineError>;

    async fn pause( &self, handle: EngineHandle ) -> Result<(), EngineError>;

    async fn seek( &self, handle: EngineHandle, position: Duration ) -> Result<(), EngineError>;

    async fn set_volume( &self, handle: EngineHandle, volume: f32 ) -> Result<(), EngineError>;

    /// Frees the resource behind `handle`.
    async fn release( &self, handle: EngineHandle ) -> Result<(), EngineError>;
}
