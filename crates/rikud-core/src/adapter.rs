//! Audio engine adapter
//!
//! Holds at most one engine resource at a time and turns engine status
//! into [`AdapterStatus`] updates. Every load bumps a generation counter;
//! results and status events that belong to an older generation are
//! dropped, so the most recent load always wins regardless of the order
//! in which engine calls complete.

use std::sync::{ Arc, Mutex, MutexGuard, RwLock };
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::{ CatalogEntry, Variant };
use crate::engine::{ AudioEngine, EngineError, EngineHandle, EngineStatus };
use crate::error::{ LoadError, PlaybackError };
use crate::state::clamp_volume;


/// Load request tag. Strictly increasing per adapter.
pub type Generation = u64;


/// One playable unit, built fresh for every play request.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct Track {
    pub id: String,
    pub source_url: String,
    /// Used until the engine reports a real duration.
    pub nominal_duration_ms: u64,
}


impl Track {
    /// Resolves the audio URL for `variant` of a catalog entry.
    pub fn for_entry( entry: &CatalogEntry, variant: Variant ) -> Result<Self, PlaybackError> {
        let url = entry.audio_url( variant ).ok_or_else( || PlaybackError::NoSource {
            entry_id: entry.id.clone(),
            variant,
        })?;

        Ok( Self {
            id: entry.id.clone(),
            source_url: url.to_string(),
            nominal_duration_ms: entry.nominal_duration_ms(),
        })
    }
}


/// Status reported by the adapter to its listener.
#[derive( Debug, Clone, PartialEq )]
pub enum AdapterStatus {
    /// A load started; the previous resource is being released.
    Loading { generation: Generation, track_id: String },
    Loaded { generation: Generation, track_id: String, duration_ms: u64 },
    Progress { generation: Generation, position_ms: u64, duration_ms: u64, is_playing: bool },
    /// No resource is held anymore. `error` is set when it died or failed to load.
    Cleared { generation: Generation, error: Option<String> },
}


impl AdapterStatus {
    pub fn generation( &self ) -> Generation {
        match self {
            AdapterStatus::Loading { generation, .. }
            | AdapterStatus::Loaded { generation, .. }
            | AdapterStatus::Progress { generation, .. }
            | AdapterStatus::Cleared { generation, .. } => *generation,
        }
    }
}


/// Result of [`AudioAdapter::load`].
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum LoadOutcome {
    Ready( Generation ),
    /// A newer load started before this one finished.
    Superseded,
}


type StatusCallback = Arc<dyn Fn( AdapterStatus ) + Send + Sync>;


struct Resource {
    handle: EngineHandle,
    duration_ms: u64,
    position_ms: u64,
    playing: bool,
    /// Reached the end; the next play starts over.
    finished: bool,
}


impl Resource {
    fn progress( &self, generation: Generation ) -> AdapterStatus {
        AdapterStatus::Progress {
            generation,
            position_ms: self.position_ms,
            duration_ms: self.duration_ms,
            is_playing: self.playing,
        }
    }
}


#[derive( Default )]
struct Slot {
    generation: Generation,
    resource: Option<Resource>,
    pump: Option<JoinHandle<()>>,
    /// A load for the current generation is in flight.
    pending: bool,
}


impl Slot {
    /// Starts a new generation and hands back whatever it held.
    fn advance( &mut self ) -> ( Generation, Option<Resource> ) {
        self.generation += 1;
        if let Some( pump ) = self.pump.take() {
            pump.abort();
        }
        ( self.generation, self.resource.take() )
    }


    fn current_mut( &mut self, generation: Generation ) -> Option<&mut Resource> {
        if self.generation == generation { self.resource.as_mut() } else { None }
    }
}


struct Shared {
    engine: Arc<dyn AudioEngine>,
    slot: Mutex<Slot>,
    volume: Mutex<f32>,
    listener: RwLock<Option<StatusCallback>>,
}


impl Shared {
    fn slot( &self ) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Delivers `status` unless its generation has been superseded.
    fn emit( &self, status: AdapterStatus ) {
        if status.generation() != self.slot().generation {
            tracing::debug!( "Dropping stale status {:?}", status );
            return;
        }
        let listener = self.listener.read().unwrap_or_else( |e| e.into_inner() ).clone();
        if let Some( listener ) = listener {
            listener( status );
        }
    }


    async fn release_quietly( &self, handle: EngineHandle ) {
        if let Err( e ) = self.engine.release( handle ).await {
            tracing::warn!( "Failed to release {:?}: {}", handle, e );
        }
    }
}


/// Adapter owning the single live engine resource.
///
/// Cloning yields another handle to the same adapter.
#[derive( Clone )]
pub struct AudioAdapter {
    shared: Arc<Shared>,
}


impl AudioAdapter {
    pub fn new( engine: Arc<dyn AudioEngine> ) -> Self {
        Self {
            shared: Arc::new( Shared {
                engine,
                slot: Mutex::new( Slot::default() ),
                volume: Mutex::new( 1.0 ),
                listener: RwLock::new( None ),
            }),
        }
    }


    /// Sets the status listener, replacing any previous one.
    pub fn on_status<F>( &self, callback: F )
    where
        F: Fn( AdapterStatus ) + Send + Sync + 'static,
    {
        let mut listener = self.shared.listener.write().unwrap_or_else( |e| e.into_inner() );
        *listener = Some( Arc::new( callback ) );
    }


    /// Removes the status listener.
    pub fn clear_listener( &self ) {
        let mut listener = self.shared.listener.write().unwrap_or_else( |e| e.into_inner() );
        *listener = None;
    }


    pub fn generation( &self ) -> Generation {
        self.shared.slot().generation
    }


    pub fn is_current( &self, generation: Generation ) -> bool {
        self.generation() == generation
    }


    /// True while a resource is held.
    pub fn is_loaded( &self ) -> bool {
        self.shared.slot().resource.is_some()
    }


    pub fn volume( &self ) -> f32 {
        *self.shared.volume.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Releases the current resource and loads `track` in its place, paused
    /// at position 0.
    ///
    /// Returns [`LoadOutcome::Superseded`] if another load started meanwhile;
    /// the resource acquired by this call is then released again.
    pub async fn load( &self, track: &Track ) -> Result<LoadOutcome, PlaybackError> {
        let ( generation, previous ) = {
            let mut slot = self.shared.slot();
            let advanced = slot.advance();
            slot.pending = true;
            advanced
        };

        self.shared.emit( AdapterStatus::Loading { generation, track_id: track.id.clone() } );
        if let Some( previous ) = previous {
            self.shared.release_quietly( previous.handle ).await;
        }

        if track.source_url.trim().is_empty() {
            return self.fail_load( generation, LoadError::MissingSource );
        }

        let loaded = match self.shared.engine.load( &track.source_url, self.volume() ).await {
            Ok( loaded ) => loaded,
            Err( e ) => return self.fail_load( generation, LoadError::Engine( e ) ),
        };

        let duration_ms = loaded.duration
            .map( as_millis )
            .filter( |ms| *ms > 0 )
            .unwrap_or( track.nominal_duration_ms );

        let installed = {
            let mut slot = self.shared.slot();
            if slot.generation == generation {
                slot.pending = false;
                slot.resource = Some( Resource {
                    handle: loaded.handle,
                    duration_ms,
                    position_ms: 0,
                    playing: false,
                    finished: false,
                });
                true
            } else {
                false
            }
        };

        if !installed {
            tracing::debug!( "Load of {} (generation {}) was superseded", track.id, generation );
            self.shared.release_quietly( loaded.handle ).await;
            return Ok( LoadOutcome::Superseded );
        }

        tracing::info!( "Loaded {} ({} ms)", track.id, duration_ms );
        self.shared.emit( AdapterStatus::Loaded {
            generation,
            track_id: track.id.clone(),
            duration_ms,
        });

        let pump = tokio::spawn( pump_status( Arc::clone( &self.shared ), generation, loaded.status ) );
        let mut slot = self.shared.slot();
        if slot.generation == generation {
            slot.pump = Some( pump );
        } else {
            pump.abort();
        }

        Ok( LoadOutcome::Ready( generation ) )
    }


    fn fail_load( &self, generation: Generation, error: LoadError ) -> Result<LoadOutcome, PlaybackError> {
        {
            let mut slot = self.shared.slot();
            if slot.generation != generation {
                tracing::debug!( "Ignoring failure of superseded load: {}", error );
                return Ok( LoadOutcome::Superseded );
            }
            slot.pending = false;
        }

        tracing::warn!( "Load failed: {}", error );
        self.shared.emit( AdapterStatus::Cleared { generation, error: Some( error.to_string() ) } );
        Err( PlaybackError::Load( error ) )
    }


    /// Starts or resumes playback. No-op when nothing is loaded.
    ///
    /// Returns whether the resource that is current when the engine answers
    /// was started; false when nothing is loaded or a load overtook the call.
    pub async fn play( &self ) -> Result<bool, PlaybackError> {
        self.start( None ).await
    }


    /// Starts playback only if `generation` is still current.
    /// Returns whether playback was started.
    pub async fn play_generation( &self, generation: Generation ) -> Result<bool, PlaybackError> {
        self.start( Some( generation ) ).await
    }


    async fn start( &self, expected: Option<Generation> ) -> Result<bool, PlaybackError> {
        let ( generation, handle, rewind ) = {
            let slot = self.shared.slot();
            if expected.is_some_and( |g| g != slot.generation ) {
                return Ok( false );
            }
            match slot.resource.as_ref() {
                Some( res ) => ( slot.generation, res.handle, res.finished ),
                None => return Ok( false ),
            }
        };

        if rewind {
            self.transport( generation, self.shared.engine.seek( handle, Duration::ZERO ).await )?;
        }
        if !self.transport( generation, self.shared.engine.play( handle ).await )? {
            return Ok( false );
        }

        let status = self.shared.slot().current_mut( generation ).map( |res| {
            res.playing = true;
            if rewind {
                res.finished = false;
                res.position_ms = 0;
            }
            res.progress( generation )
        });

        match status {
            Some( status ) => {
                self.shared.emit( status );
                Ok( true )
            }
            None => Ok( false ),
        }
    }


    /// Pauses playback. No-op when nothing is loaded.
    /// Returns whether the current resource was paused.
    pub async fn pause( &self ) -> Result<bool, PlaybackError> {
        let Some( ( generation, handle ) ) = self.current_handle() else {
            return Ok( false );
        };

        if !self.transport( generation, self.shared.engine.pause( handle ).await )? {
            return Ok( false );
        }

        let status = self.shared.slot().current_mut( generation ).map( |res| {
            res.playing = false;
            res.progress( generation )
        });
        match status {
            Some( status ) => {
                self.shared.emit( status );
                Ok( true )
            }
            None => Ok( false ),
        }
    }


    /// Seeks, clamping to `[0, duration]`. Returns the applied position,
    /// or None when nothing is loaded.
    pub async fn seek( &self, position_ms: i64 ) -> Result<Option<u64>, PlaybackError> {
        let ( generation, handle, target ) = {
            let slot = self.shared.slot();
            match slot.resource.as_ref() {
                Some( res ) => ( slot.generation, res.handle, clamp_position( position_ms, res.duration_ms ) ),
                None => return Ok( None ),
            }
        };

        let seek = self.shared.engine.seek( handle, Duration::from_millis( target ) ).await;
        if !self.transport( generation, seek )? {
            return Ok( None );
        }

        let status = self.shared.slot().current_mut( generation ).map( |res| {
            res.position_ms = target;
            res.finished = false;
            res.progress( generation )
        });
        if let Some( status ) = status {
            self.shared.emit( status );
        }
        Ok( Some( target ) )
    }


    /// Sets the volume, clamped to `[0, 1]`. The value is kept for later
    /// loads even when nothing is loaded. Returns the applied volume.
    pub async fn set_volume( &self, volume: f32 ) -> Result<f32, PlaybackError> {
        let volume = clamp_volume( volume );
        *self.shared.volume.lock().unwrap_or_else( |e| e.into_inner() ) = volume;

        if let Some( ( generation, handle ) ) = self.current_handle() {
            self.transport( generation, self.shared.engine.set_volume( handle, volume ).await )?;
        }
        Ok( volume )
    }


    /// Releases the resource, if any, and supersedes loads in flight.
    /// Safe to call repeatedly.
    pub async fn unload( &self ) {
        let ( generation, previous, was_pending ) = {
            let mut slot = self.shared.slot();
            let was_pending = slot.pending;
            slot.pending = false;
            let ( generation, previous ) = slot.advance();
            ( generation, previous, was_pending )
        };

        let had_resource = previous.is_some();
        if let Some( previous ) = previous {
            self.shared.release_quietly( previous.handle ).await;
            tracing::info!( "Unloaded" );
        }
        if had_resource || was_pending {
            self.shared.emit( AdapterStatus::Cleared { generation, error: None } );
        }
    }


    fn current_handle( &self ) -> Option<( Generation, EngineHandle )> {
        let slot = self.shared.slot();
        slot.resource.as_ref().map( |res| ( slot.generation, res.handle ) )
    }


    /// Maps an engine transport result. Errors against a resource that has
    /// since been superseded are not the caller's concern: they yield
    /// `Ok(false)`.
    fn transport( &self, generation: Generation, result: Result<(), EngineError> ) -> Result<bool, PlaybackError> {
        match result {
            Ok(()) => Ok( true ),
            Err( e ) if !self.is_current( generation ) => {
                tracing::debug!( "Ignoring error from superseded resource: {}", e );
                Ok( false )
            }
            Err( e ) => Err( PlaybackError::Transport( e ) ),
        }
    }
}


/// Forwards engine status for one generation until the channel closes.
async fn pump_status(
    shared: Arc<Shared>,
    generation: Generation,
    mut status: mpsc::UnboundedReceiver<EngineStatus>,
) {
    while let Some( event ) = status.recv().await {
        match event {
            EngineStatus::Progress { position, duration, playing } => {
                let update = shared.slot().current_mut( generation ).map( |res| {
                    if let Some( ms ) = duration.map( as_millis ).filter( |ms| *ms > 0 ) {
                        res.duration_ms = ms;
                    }
                    res.position_ms = clamp_position( as_millis( position ) as i64, res.duration_ms );
                    res.playing = playing;
                    if playing {
                        res.finished = false;
                    }
                    res.progress( generation )
                });
                match update {
                    Some( update ) => shared.emit( update ),
                    None => tracing::debug!( "Dropping progress for generation {}", generation ),
                }
            }

            EngineStatus::Finished => {
                let update = shared.slot().current_mut( generation ).map( |res| {
                    res.playing = false;
                    res.finished = true;
                    res.position_ms = res.duration_ms;
                    res.progress( generation )
                });
                if let Some( update ) = update {
                    tracing::info!( "Track finished" );
                    shared.emit( update );
                }
            }

            EngineStatus::Failed { message } => {
                let dead = {
                    let mut slot = shared.slot();
                    if slot.generation == generation {
                        // Detach rather than abort: this is the pump's own task
                        slot.pump = None;
                        slot.resource.take()
                    } else {
                        None
                    }
                };
                if let Some( dead ) = dead {
                    tracing::error!( "Playback failed: {}", message );
                    shared.release_quietly( dead.handle ).await;
                    shared.emit( AdapterStatus::Cleared { generation, error: Some( message ) } );
                }
                break;
            }
        }
    }
}


fn as_millis( duration: Duration ) -> u64 {
    u64::try_from( duration.as_millis() ).unwrap_or( u64::MAX )
}


/// Clamps a requested position to `[0, duration]`. An unknown (zero)
/// duration only clamps the lower bound.
fn clamp_position( position_ms: i64, duration_ms: u64 ) -> u64 {
    let position = u64::try_from( position_ms ).unwrap_or( 0 );
    if duration_ms > 0 { position.min( duration_ms ) } else { position }
}


#[cfg( test )]
mod tests {
    use super::*;

    use crate::engine::scripted::{ Call, ScriptedEngine };


    fn track( id: &str, url: &str ) -> Track {
        Track { id: id.into(), source_url: url.into(), nominal_duration_ms: 180_000 }
    }


    fn adapter_with_log() -> ( ScriptedEngine, AudioAdapter, Arc<Mutex<Vec<AdapterStatus>>> ) {
        let engine = ScriptedEngine::new();
        let adapter = AudioAdapter::new( Arc::new( engine.clone() ) );
        let log = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &log );
        adapter.on_status( move |s| sink.lock().unwrap().push( s ) );
        ( engine, adapter, log )
    }


    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }


    #[test]
    fn test_clamp_position() {
        assert_eq!( clamp_position( -5, 1000 ), 0 );
        assert_eq!( clamp_position( 5000, 1000 ), 1000 );
        assert_eq!( clamp_position( 500, 1000 ), 500 );
        assert_eq!( clamp_position( 5000, 0 ), 5000 );
    }


    #[test]
    fn test_track_for_missing_variant() {
        let entry = CatalogEntry::new( "d1", Some( "a" ), None, 180.0 );
        let result = Track::for_entry( &entry, Variant::Short );
        assert!( matches!( result, Err( PlaybackError::NoSource { variant: Variant::Short, .. } ) ) );
        assert_eq!( Track::for_entry( &entry, Variant::Full ).unwrap().nominal_duration_ms, 180_000 );
    }


    #[tokio::test]
    async fn test_load_uses_engine_duration() {
        let ( engine, adapter, log ) = adapter_with_log();
        engine.set_duration( "a", Duration::from_secs( 200 ) );

        let outcome = adapter.load( &track( "d1", "a" ) ).await.unwrap();
        assert_eq!( outcome, LoadOutcome::Ready( 1 ) );
        assert!( adapter.is_loaded() );
        assert!( log.lock().unwrap().contains( &AdapterStatus::Loaded {
            generation: 1,
            track_id: "d1".into(),
            duration_ms: 200_000,
        }));
    }


    #[tokio::test]
    async fn test_load_falls_back_to_nominal_duration() {
        let ( _engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "d1", "a" ) ).await.unwrap();
        assert!( log.lock().unwrap().iter().any( |s| matches!(
            s,
            AdapterStatus::Loaded { duration_ms: 180_000, .. }
        )));
    }


    #[tokio::test]
    async fn test_missing_source_makes_no_engine_call() {
        let ( engine, adapter, log ) = adapter_with_log();
        let result = adapter.load( &track( "d1", " " ) ).await;
        assert!( matches!( result, Err( PlaybackError::Load( LoadError::MissingSource ) ) ) );
        assert!( engine.calls().is_empty() );
        assert!( matches!( log.lock().unwrap().last(), Some( AdapterStatus::Cleared { error: Some( _ ), .. } ) ) );
    }


    #[tokio::test]
    async fn test_failed_load_leaves_nothing_held() {
        let ( engine, adapter, _log ) = adapter_with_log();
        adapter.load( &track( "d1", "a" ) ).await.unwrap();
        engine.fail_loads_of( "broken" );

        let result = adapter.load( &track( "d2", "broken" ) ).await;
        assert!( matches!( result, Err( PlaybackError::Load( LoadError::Engine( _ ) ) ) ) );
        assert!( !adapter.is_loaded() );
        assert!( engine.live_handles().is_empty() );
    }


    #[tokio::test]
    async fn test_load_releases_previous_resource() {
        let ( engine, adapter, _log ) = adapter_with_log();
        adapter.load( &track( "d1", "a" ) ).await.unwrap();
        let first = engine.handle_for( "a" ).unwrap();

        adapter.load( &track( "d2", "b" ) ).await.unwrap();
        assert!( engine.calls().contains( &Call::Release( first ) ) );
        assert_eq!( engine.live_handles(), vec![ engine.handle_for( "b" ).unwrap() ] );
    }


    #[tokio::test]
    async fn test_stale_load_is_superseded() {
        let ( engine, adapter, log ) = adapter_with_log();
        let open_a = engine.gate( "a" );

        let slow = adapter.clone();
        let first = tokio::spawn( async move { slow.load( &track( "A", "a" ) ).await } );
        settle().await;

        let second = adapter.load( &track( "B", "b" ) ).await.unwrap();
        assert_eq!( second, LoadOutcome::Ready( 2 ) );

        open_a.send( () ).unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!( first, LoadOutcome::Superseded );

        // A's late resource was released again, B's is the only one held
        assert_eq!( engine.live_handles(), vec![ engine.handle_for( "b" ).unwrap() ] );
        assert!( !log.lock().unwrap().iter().any( |s| matches!(
            s,
            AdapterStatus::Loaded { track_id, .. } if track_id == "A"
        )));
    }


    #[tokio::test]
    async fn test_stale_status_events_are_dropped() {
        let ( engine, adapter, log ) = adapter_with_log();
        engine.keep_channels_open();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        let stale = engine.handle_for( "a" ).unwrap();
        adapter.load( &track( "B", "b" ) ).await.unwrap();
        log.lock().unwrap().clear();

        engine.emit( stale, EngineStatus::Progress {
            position: Duration::from_secs( 42 ),
            duration: None,
            playing: true,
        });
        settle().await;

        assert!( log.lock().unwrap().is_empty() );
    }


    #[tokio::test]
    async fn test_progress_is_forwarded() {
        let ( engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        let handle = engine.handle_for( "a" ).unwrap();

        engine.emit( handle, EngineStatus::Progress {
            position: Duration::from_millis( 1500 ),
            duration: Some( Duration::from_secs( 60 ) ),
            playing: true,
        });
        settle().await;

        assert_eq!( log.lock().unwrap().last(), Some( &AdapterStatus::Progress {
            generation: 1,
            position_ms: 1500,
            duration_ms: 60_000,
            is_playing: true,
        }));
    }


    #[tokio::test]
    async fn test_seek_clamps_to_bounds() {
        let ( engine, adapter, _log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        let handle = engine.handle_for( "a" ).unwrap();

        assert_eq!( adapter.seek( -10 ).await.unwrap(), Some( 0 ) );
        assert_eq!( adapter.seek( 999_999 ).await.unwrap(), Some( 180_000 ) );
        let calls = engine.calls();
        assert!( calls.contains( &Call::Seek( handle, Duration::ZERO ) ) );
        assert!( calls.contains( &Call::Seek( handle, Duration::from_secs( 180 ) ) ) );
    }


    #[tokio::test]
    async fn test_volume_clamped_and_kept() {
        let ( engine, adapter, _log ) = adapter_with_log();
        assert_eq!( adapter.set_volume( 1.7 ).await.unwrap(), 1.0 );
        assert_eq!( adapter.set_volume( -0.2 ).await.unwrap(), 0.0 );
        assert_eq!( adapter.volume(), 0.0 );
        assert!( engine.calls().is_empty() );
    }


    #[tokio::test]
    async fn test_transport_without_resource_is_noop() {
        let ( engine, adapter, _log ) = adapter_with_log();
        assert!( !adapter.play().await.unwrap() );
        assert!( !adapter.pause().await.unwrap() );
        assert_eq!( adapter.seek( 10 ).await.unwrap(), None );
        adapter.unload().await;
        adapter.unload().await;
        assert!( engine.calls().is_empty() );
    }


    #[tokio::test]
    async fn test_play_overtaken_by_load_reports_false() {
        let ( engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        let first = engine.handle_for( "a" ).unwrap();
        let open_play = engine.gate_play( first );

        let slow = adapter.clone();
        let resumed = tokio::spawn( async move { slow.play().await } );
        settle().await;

        adapter.load( &track( "B", "b" ) ).await.unwrap();
        log.lock().unwrap().clear();
        open_play.send( () ).unwrap();

        assert!( !resumed.await.unwrap().unwrap() );
        assert!( log.lock().unwrap().is_empty() );
    }


    #[tokio::test]
    async fn test_rejected_play_is_reported() {
        let ( engine, adapter, _log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        engine.reject_play( true );
        assert!( matches!( adapter.play().await, Err( PlaybackError::Transport( _ ) ) ) );
        assert!( adapter.is_loaded() );
    }


    #[tokio::test]
    async fn test_terminal_failure_clears() {
        let ( engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        adapter.play().await.unwrap();
        let handle = engine.handle_for( "a" ).unwrap();

        engine.emit( handle, EngineStatus::Failed { message: "stream dropped".into() } );
        settle().await;

        assert!( !adapter.is_loaded() );
        assert!( engine.calls().contains( &Call::Release( handle ) ) );
        assert_eq!( log.lock().unwrap().last(), Some( &AdapterStatus::Cleared {
            generation: 1,
            error: Some( "stream dropped".into() ),
        }));
    }


    #[tokio::test]
    async fn test_play_after_finish_rewinds() {
        let ( engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        let handle = engine.handle_for( "a" ).unwrap();
        adapter.play().await.unwrap();

        engine.emit( handle, EngineStatus::Finished );
        settle().await;
        assert!( matches!(
            log.lock().unwrap().last(),
            Some( AdapterStatus::Progress { position_ms: 180_000, is_playing: false, .. } )
        ));

        adapter.play().await.unwrap();
        assert!( engine.calls().contains( &Call::Seek( handle, Duration::ZERO ) ) );
        assert!( matches!(
            log.lock().unwrap().last(),
            Some( AdapterStatus::Progress { position_ms: 0, is_playing: true, .. } )
        ));
    }


    #[tokio::test]
    async fn test_unload_clears_once() {
        let ( engine, adapter, log ) = adapter_with_log();
        adapter.load( &track( "A", "a" ) ).await.unwrap();
        log.lock().unwrap().clear();

        adapter.unload().await;
        adapter.unload().await;
        assert!( engine.live_handles().is_empty() );
        let cleared = log.lock().unwrap().iter().filter( |s| matches!( s, AdapterStatus::Cleared { .. } ) ).count();
        assert_eq!( cleared, 1 );
    }
}
