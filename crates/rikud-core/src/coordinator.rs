//! Playback coordinator
//!
//! Ties catalog entries to the audio adapter and keeps the playback store
//! in step with it. Every front end drives playback through this type and
//! observes it through [`Coordinator::subscribe`].

use std::sync::{ Arc, Mutex, MutexGuard };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use tokio::sync::broadcast;

use crate::adapter::{ AdapterStatus, AudioAdapter, LoadOutcome, Track };
use crate::catalog::{ CatalogEntry, PlayStats, Variant };
use crate::engine::AudioEngine;
use crate::error::PlaybackError;
use crate::recorder::PlayRecorder;
use crate::state::{ PlaybackState, PlaybackStore, StatePatch, Subscription };


const STATS_CHANNEL_CAPACITY: usize = 64;


/// Updated statistics for an entry after a recorded play.
#[derive( Debug, Clone, PartialEq )]
pub struct StatsUpdate {
    pub entry_id: String,
    pub stats: PlayStats,
}


/// What the user last asked for.
#[derive( Default )]
struct Session {
    entry: Option<CatalogEntry>,
    variant: Variant,
    /// Volume to restore when unmuting.
    volume_before_mute: Option<f32>,
}


struct Inner {
    adapter: AudioAdapter,
    store: PlaybackStore,
    recorder: Arc<dyn PlayRecorder>,
    session: Mutex<Session>,
    stats: broadcast::Sender<StatsUpdate>,
    stats_failures: AtomicU64,
    disposed: AtomicBool,
}


/// Playback coordinator. Cheap to clone; clones share one player.
#[derive( Clone )]
pub struct Coordinator {
    inner: Arc<Inner>,
}


impl Coordinator {
    /// Builds a coordinator over `engine`, recording plays through `recorder`.
    pub fn create( engine: Arc<dyn AudioEngine>, recorder: Arc<dyn PlayRecorder> ) -> Self {
        let adapter = AudioAdapter::new( engine );
        let store = PlaybackStore::new();

        let sink = store.clone();
        adapter.on_status( move |status| sink.apply( patch_for( status ) ) );

        let ( stats, _ ) = broadcast::channel( STATS_CHANNEL_CAPACITY );

        Self {
            inner: Arc::new( Inner {
                adapter,
                store,
                recorder,
                session: Mutex::new( Session::default() ),
                stats,
                stats_failures: AtomicU64::new( 0 ),
                disposed: AtomicBool::new( false ),
            }),
        }
    }


    fn session( &self ) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else( |e| e.into_inner() )
    }


    fn ensure_live( &self ) -> Result<(), PlaybackError> {
        if self.inner.disposed.load( Ordering::Acquire ) {
            Err( PlaybackError::Disposed )
        } else {
            Ok(())
        }
    }


    /// Current snapshot.
    pub fn snapshot( &self ) -> Arc<PlaybackState> {
        self.inner.store.snapshot()
    }


    /// Subscribes to snapshots. The callback runs once immediately.
    pub fn subscribe<F>( &self, callback: F ) -> Subscription
    where
        F: Fn( &PlaybackState ) + Send + Sync + 'static,
    {
        self.inner.store.subscribe( callback )
    }


    /// Successful play recordings, for refreshing play listings.
    pub fn stats_updates( &self ) -> broadcast::Receiver<StatsUpdate> {
        self.inner.stats.subscribe()
    }


    /// Number of play recordings that failed so far.
    pub fn stats_failures( &self ) -> u64 {
        self.inner.stats_failures.load( Ordering::Relaxed )
    }


    /// Entry of the most recent play request.
    pub fn current_entry( &self ) -> Option<CatalogEntry> {
        self.session().entry.clone()
    }


    /// Loads `variant` of `entry` and starts playing it.
    ///
    /// Fails with [`PlaybackError::NoSource`] before touching the engine when
    /// the entry has no URL for that variant. If another play request
    /// overtakes this one, returns `Ok(())` and leaves the state to the newer
    /// request.
    pub async fn play_item( &self, entry: &CatalogEntry, variant: Variant ) -> Result<(), PlaybackError> {
        self.ensure_live()?;
        let track = Track::for_entry( entry, variant )?;

        {
            let mut session = self.session();
            session.entry = Some( entry.clone() );
            session.variant = variant;
        }

        tracing::info!( "Playing {} ({})", entry.id, variant );
        let generation = match self.inner.adapter.load( &track ).await? {
            LoadOutcome::Ready( generation ) => generation,
            LoadOutcome::Superseded => return Ok(()),
        };

        if self.inner.adapter.is_current( generation ) {
            self.inner.store.apply(
                StatePatch::new()
                    .track( Some( entry.id.clone() ) )
                    .variant( variant )
            );
        }

        self.record_in_background( entry.id.clone() );

        // The adapter reports the started state for the current generation only
        self.inner.adapter.play_generation( generation ).await?;
        Ok(())
    }


    fn record_in_background( &self, entry_id: String ) {
        let inner = Arc::clone( &self.inner );
        tokio::spawn( async move {
            match inner.recorder.record_play( &entry_id ).await {
                Ok( stats ) => {
                    tracing::debug!( "Recorded play of {} ({} plays)", entry_id, stats.times_played );
                    // No receivers is fine
                    let _ = inner.stats.send( StatsUpdate { entry_id, stats } );
                }
                Err( e ) => {
                    inner.stats_failures.fetch_add( 1, Ordering::Relaxed );
                    tracing::warn!( "Failed to record play of {}: {}", entry_id, e );
                }
            }
        });
    }


    /// Pauses. No-op when nothing is loaded.
    ///
    /// The store follows the adapter's status for the current resource, so
    /// a pause that lands on a superseded resource changes nothing.
    pub async fn pause( &self ) -> Result<(), PlaybackError> {
        self.ensure_live()?;
        self.inner.adapter.pause().await?;
        Ok(())
    }


    /// Resumes the loaded track. No-op when nothing is loaded.
    pub async fn resume( &self ) -> Result<(), PlaybackError> {
        self.ensure_live()?;
        self.inner.adapter.play().await?;
        Ok(())
    }


    /// Pauses when playing, resumes otherwise.
    pub async fn toggle_playback( &self ) -> Result<(), PlaybackError> {
        if self.snapshot().is_playing {
            self.pause().await
        } else {
            self.resume().await
        }
    }


    /// Flips between the full and short variant.
    ///
    /// While playing, the current entry is reloaded in the new variant from
    /// position 0. If that variant has no audio, nothing changes and
    /// [`PlaybackError::NoSource`] is returned.
    pub async fn toggle_variant( &self ) -> Result<Variant, PlaybackError> {
        self.ensure_live()?;
        let playing = self.snapshot().is_playing;
        let ( entry, flipped ) = {
            let session = self.session();
            ( session.entry.clone(), session.variant.flipped() )
        };

        match entry {
            Some( entry ) if playing => {
                self.play_item( &entry, flipped ).await?;
            }
            _ => {
                self.session().variant = flipped;
                self.inner.store.apply( StatePatch::new().variant( flipped ) );
            }
        }
        Ok( flipped )
    }


    /// Seeks within the loaded track; out of range positions are clamped.
    pub async fn seek_to( &self, position_ms: i64 ) -> Result<(), PlaybackError> {
        self.ensure_live()?;
        self.inner.adapter.seek( position_ms ).await?;
        Ok(())
    }


    /// Sets the volume (clamped to `[0, 1]`). The store reflects the value
    /// right away, before the engine confirms it.
    pub async fn set_volume( &self, volume: f32 ) -> Result<(), PlaybackError> {
        self.ensure_live()?;
        self.session().volume_before_mute = None;
        self.inner.store.apply( StatePatch::new().volume( volume ) );
        self.inner.adapter.set_volume( volume ).await?;
        Ok(())
    }


    /// Mutes, or restores the volume from before muting. Returns the new volume.
    pub async fn toggle_mute( &self ) -> Result<f32, PlaybackError> {
        self.ensure_live()?;
        let current = self.snapshot().volume;
        let target = {
            let mut session = self.session();
            match session.volume_before_mute.take() {
                Some( previous ) => previous,
                None if current > 0.0 => {
                    session.volume_before_mute = Some( current );
                    0.0
                }
                // Muted by volume 0 without a remembered level
                None => 1.0,
            }
        };

        self.inner.store.apply( StatePatch::new().volume( target ) );
        self.inner.adapter.set_volume( target ).await
    }


    /// Releases the engine resource and detaches all observers. Every later
    /// call returns [`PlaybackError::Disposed`]; disposing twice is harmless.
    pub async fn dispose( &self ) {
        if self.inner.disposed.swap( true, Ordering::AcqRel ) {
            return;
        }
        self.inner.adapter.unload().await;
        self.inner.adapter.clear_listener();
        self.inner.store.clear_subscribers();
        tracing::info!( "Coordinator disposed" );
    }
}


/// Store update for an adapter status.
fn patch_for( status: AdapterStatus ) -> StatePatch {
    match status {
        AdapterStatus::Loading { .. } => StatePatch::new().playing( false ).position( 0 ),
        AdapterStatus::Loaded { duration_ms, .. } => StatePatch::new().position( 0 ).duration( duration_ms ),
        AdapterStatus::Progress { position_ms, duration_ms, is_playing, .. } => StatePatch::new()
            .duration( duration_ms )
            .position( position_ms )
            .playing( is_playing ),
        AdapterStatus::Cleared { .. } => StatePatch::cleared(),
    }
}


#[cfg( test )]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;

    use super::*;
    use crate::engine::EngineStatus;
    use crate::engine::scripted::{ Call, ScriptedEngine };
    use crate::recorder::{ LocalRecorder, StatsError };


    /// Recorder that fails, or blocks until released.
    struct ScriptedRecorder {
        fail: bool,
        hold: Option<Arc<Notify>>,
    }


    #[async_trait]
    impl PlayRecorder for ScriptedRecorder {
        async fn record_play( &self, _entry_id: &str ) -> Result<PlayStats, StatsError> {
            if let Some( hold ) = &self.hold {
                hold.notified().await;
            }
            if self.fail {
                Err( StatsError::Status { status: 503, body: "unavailable".into() } )
            } else {
                Ok( PlayStats { last_played_at: Utc::now(), times_played: 1 } )
            }
        }
    }


    fn d1() -> CatalogEntry {
        CatalogEntry::new( "d1", Some( "a" ), None, 180.0 )
    }


    fn d2() -> CatalogEntry {
        CatalogEntry::new( "d2", Some( "full-2" ), Some( "short-2" ), 240.0 )
    }


    fn coordinator_with( recorder: Arc<dyn PlayRecorder> ) -> ( ScriptedEngine, Coordinator ) {
        let engine = ScriptedEngine::new();
        let coordinator = Coordinator::create( Arc::new( engine.clone() ), recorder );
        ( engine, coordinator )
    }


    fn coordinator() -> ( ScriptedEngine, Coordinator ) {
        coordinator_with( Arc::new( LocalRecorder::new() ) )
    }


    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }


    #[tokio::test]
    async fn test_missing_short_variant() {
        let ( engine, coordinator ) = coordinator();

        let result = coordinator.play_item( &d1(), Variant::Short ).await;
        assert!( matches!( result, Err( PlaybackError::NoSource { .. } ) ) );
        assert!( engine.calls().is_empty() );
        assert_eq!( *coordinator.snapshot(), PlaybackState::default() );

        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        let state = coordinator.snapshot();
        assert_eq!( state.current_track_id.as_deref(), Some( "d1" ) );
        assert!( state.is_playing );
        assert_eq!( state.variant, Variant::Full );
        assert_eq!( state.duration_ms, 180_000 );
    }


    #[tokio::test]
    async fn test_stale_load_does_not_win() {
        let ( engine, coordinator ) = coordinator();
        let open_a = engine.gate( "a" );

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn( async move { coordinator.play_item( &d1(), Variant::Full ).await } )
        };
        settle().await;

        coordinator.play_item( &d2(), Variant::Full ).await.unwrap();
        open_a.send( () ).unwrap();
        first.await.unwrap().unwrap();

        let state = coordinator.snapshot();
        assert_eq!( state.current_track_id.as_deref(), Some( "d2" ) );
        assert!( state.is_playing );
        assert_eq!( engine.live_handles(), vec![ engine.handle_for( "full-2" ).unwrap() ] );
    }


    #[tokio::test]
    async fn test_seek_clamps() {
        let ( _engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();

        coordinator.seek_to( -1 ).await.unwrap();
        assert_eq!( coordinator.snapshot().position_ms, 0 );

        coordinator.seek_to( 999_999 ).await.unwrap();
        assert_eq!( coordinator.snapshot().position_ms, 180_000 );
    }


    #[tokio::test]
    async fn test_toggle_variant_reloads_from_start() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d2(), Variant::Full ).await.unwrap();
        coordinator.seek_to( 90_000 ).await.unwrap();
        assert_eq!( coordinator.snapshot().position_ms, 90_000 );

        assert_eq!( coordinator.toggle_variant().await.unwrap(), Variant::Short );

        let state = coordinator.snapshot();
        assert_eq!( state.position_ms, 0 );
        assert_eq!( state.variant, Variant::Short );
        assert!( state.is_playing );
        assert!( engine.calls().contains( &Call::Load( "short-2".into() ) ) );
    }


    #[tokio::test]
    async fn test_toggle_variant_without_source_keeps_state() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        let loads = engine.calls().len();

        assert!( matches!( coordinator.toggle_variant().await, Err( PlaybackError::NoSource { .. } ) ) );
        assert_eq!( coordinator.snapshot().variant, Variant::Full );
        assert!( coordinator.snapshot().is_playing );
        assert_eq!( engine.calls().len(), loads );
    }


    #[tokio::test]
    async fn test_toggle_variant_when_idle_only_flips_intent() {
        let ( engine, coordinator ) = coordinator();
        assert_eq!( coordinator.toggle_variant().await.unwrap(), Variant::Short );
        assert_eq!( coordinator.snapshot().variant, Variant::Short );
        assert!( engine.calls().is_empty() );
    }


    #[tokio::test]
    async fn test_failing_recorder_leaves_playback_alone() {
        let recorder = Arc::new( ScriptedRecorder { fail: true, hold: None } );
        let ( _engine, coordinator ) = coordinator_with( recorder );

        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        settle().await;

        let state = coordinator.snapshot();
        assert!( state.is_playing );
        assert_eq!( state.current_track_id.as_deref(), Some( "d1" ) );
        assert_eq!( coordinator.stats_failures(), 1 );
    }


    #[tokio::test]
    async fn test_slow_recorder_does_not_block_play() {
        let hold = Arc::new( Notify::new() );
        let recorder = Arc::new( ScriptedRecorder { fail: false, hold: Some( Arc::clone( &hold ) ) } );
        let ( _engine, coordinator ) = coordinator_with( recorder );
        let mut updates = coordinator.stats_updates();

        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        assert!( coordinator.snapshot().is_playing );

        settle().await;
        hold.notify_one();
        let update = tokio::time::timeout( Duration::from_secs( 1 ), updates.recv() ).await.unwrap().unwrap();
        assert_eq!( update.entry_id, "d1" );
        assert_eq!( coordinator.stats_failures(), 0 );
    }


    #[tokio::test]
    async fn test_pause_resume_toggle() {
        let ( engine, coordinator ) = coordinator();
        coordinator.pause().await.unwrap();
        coordinator.resume().await.unwrap();
        assert!( engine.calls().is_empty() );

        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        coordinator.toggle_playback().await.unwrap();
        assert!( !coordinator.snapshot().is_playing );
        coordinator.toggle_playback().await.unwrap();
        assert!( coordinator.snapshot().is_playing );
    }


    #[tokio::test]
    async fn test_late_resume_leaves_newer_track_paused() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        coordinator.pause().await.unwrap();
        let first = engine.handle_for( "a" ).unwrap();
        let open_play = engine.gate_play( first );

        let resuming = {
            let coordinator = coordinator.clone();
            tokio::spawn( async move { coordinator.resume().await } )
        };
        settle().await;

        coordinator.play_item( &d2(), Variant::Full ).await.unwrap();
        coordinator.pause().await.unwrap();
        open_play.send( () ).unwrap();
        resuming.await.unwrap().unwrap();

        let state = coordinator.snapshot();
        assert_eq!( state.current_track_id.as_deref(), Some( "d2" ) );
        assert!( !state.is_playing );
        let second = engine.handle_for( "full-2" ).unwrap();
        let plays = engine.calls().iter().filter( |c| **c == Call::Play( second ) ).count();
        assert_eq!( plays, 1 );
    }


    #[tokio::test]
    async fn test_terminal_failure_goes_idle() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        let handle = engine.handle_for( "a" ).unwrap();

        engine.emit( handle, EngineStatus::Failed { message: "stream dropped".into() } );
        settle().await;

        let state = coordinator.snapshot();
        assert_eq!( state.current_track_id, None );
        assert!( !state.is_playing );
        assert!( engine.live_handles().is_empty() );
    }


    #[tokio::test]
    async fn test_load_failure_goes_idle() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        engine.fail_loads_of( "full-2" );

        assert!( matches!( coordinator.play_item( &d2(), Variant::Full ).await, Err( PlaybackError::Load( _ ) ) ) );
        assert_eq!( coordinator.snapshot().current_track_id, None );
        assert!( engine.live_handles().is_empty() );
    }


    #[tokio::test]
    async fn test_volume_and_mute() {
        let ( _engine, coordinator ) = coordinator();
        coordinator.set_volume( 1.4 ).await.unwrap();
        assert_eq!( coordinator.snapshot().volume, 1.0 );

        coordinator.set_volume( 0.6 ).await.unwrap();
        assert_eq!( coordinator.toggle_mute().await.unwrap(), 0.0 );
        assert_eq!( coordinator.snapshot().volume, 0.0 );
        assert_eq!( coordinator.toggle_mute().await.unwrap(), 0.6 );
        assert_eq!( coordinator.snapshot().volume, 0.6 );
    }


    #[tokio::test]
    async fn test_subscribers_see_play() {
        let ( _engine, coordinator ) = coordinator();
        let seen = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &seen );
        let _subscription = coordinator.subscribe( move |s| sink.lock().unwrap().push( s.is_playing ) );

        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!( seen.first(), Some( &false ) );
        assert_eq!( seen.last(), Some( &true ) );
    }


    #[tokio::test]
    async fn test_dispose() {
        let ( engine, coordinator ) = coordinator();
        coordinator.play_item( &d1(), Variant::Full ).await.unwrap();

        coordinator.dispose().await;
        coordinator.dispose().await;
        assert!( engine.live_handles().is_empty() );
        assert!( matches!( coordinator.pause().await, Err( PlaybackError::Disposed ) ) );
        assert!( matches!( coordinator.play_item( &d1(), Variant::Full ).await, Err( PlaybackError::Disposed ) ) );
    }
}
