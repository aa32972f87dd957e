//! Playback state store and subscriber fan-out
//!
//! The store holds the single current [`PlaybackState`] snapshot. Every
//! mutation goes through [`PlaybackStore::apply`], which swaps in a new
//! snapshot and then synchronously notifies subscribers in subscription
//! order.

use std::sync::{ Arc, Mutex, MutexGuard, RwLock, Weak };
use std::sync::atomic::{ AtomicU64, Ordering };

use crate::catalog::Variant;


/// Snapshot of what is playing right now.
#[derive( Debug, Clone, PartialEq )]
pub struct PlaybackState {
    pub current_track_id: Option<String>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    /// Volume in `[0, 1]`
    pub volume: f32,
    pub variant: Variant,
}


impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_track_id: None,
            is_playing: false,
            position_ms: 0,
            duration_ms: 0,
            volume: 1.0,
            variant: Variant::Full,
        }
    }
}


/// A partial update to [`PlaybackState`]. Unset fields are left as they are.
#[derive( Debug, Clone, Default, PartialEq )]
pub struct StatePatch {
    pub current_track_id: Option<Option<String>>,
    pub is_playing: Option<bool>,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub volume: Option<f32>,
    pub variant: Option<Variant>,
}


impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }


    /// Patch that returns the state to idle: no track, not playing.
    pub fn cleared() -> Self {
        Self::new().track( None ).playing( false ).position( 0 ).duration( 0 )
    }


    pub fn track( mut self, id: Option<String> ) -> Self {
        self.current_track_id = Some( id );
        self
    }


    pub fn playing( mut self, playing: bool ) -> Self {
        self.is_playing = Some( playing );
        self
    }


    pub fn position( mut self, position_ms: u64 ) -> Self {
        self.position_ms = Some( position_ms );
        self
    }


    pub fn duration( mut self, duration_ms: u64 ) -> Self {
        self.duration_ms = Some( duration_ms );
        self
    }


    pub fn volume( mut self, volume: f32 ) -> Self {
        self.volume = Some( volume );
        self
    }


    pub fn variant( mut self, variant: Variant ) -> Self {
        self.variant = Some( variant );
        self
    }


    pub fn is_empty( &self ) -> bool {
        *self == Self::default()
    }


    /// Produces the merged state, re-establishing the snapshot invariants.
    fn merge( self, base: &PlaybackState ) -> PlaybackState {
        let mut next = base.clone();
        if let Some( id ) = self.current_track_id { next.current_track_id = id; }
        if let Some( playing ) = self.is_playing { next.is_playing = playing; }
        if let Some( position ) = self.position_ms { next.position_ms = position; }
        if let Some( duration ) = self.duration_ms { next.duration_ms = duration; }
        if let Some( volume ) = self.volume { next.volume = clamp_volume( volume ); }
        if let Some( variant ) = self.variant { next.variant = variant; }

        if next.current_track_id.is_none() {
            next.is_playing = false;
        } else if next.duration_ms > 0 {
            next.position_ms = next.position_ms.min( next.duration_ms );
        }
        next
    }
}


/// Clamps a volume to `[0, 1]`; NaN becomes silence.
pub(crate) fn clamp_volume( volume: f32 ) -> f32 {
    if volume.is_nan() { 0.0 } else { volume.clamp( 0.0, 1.0 ) }
}


type Callback = Arc<dyn Fn( &PlaybackState ) + Send + Sync>;


struct StoreInner {
    snapshot: RwLock<Arc<PlaybackState>>,
    // Ordered by subscription; ids are never reused
    subscribers: Mutex<Vec<( u64, Callback )>>,
    next_id: AtomicU64,
}


impl StoreInner {
    fn subscribers( &self ) -> MutexGuard<'_, Vec<( u64, Callback )>> {
        self.subscribers.lock().unwrap_or_else( |e| e.into_inner() )
    }


    fn remove( &self, id: u64 ) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain( |( sid, _ )| *sid != id );
        subscribers.len() != before
    }
}


/// Shared playback state store. Cloning yields another handle to the same store.
#[derive( Clone )]
pub struct PlaybackStore {
    inner: Arc<StoreInner>,
}


impl PlaybackStore {
    pub fn new() -> Self {
        Self::with_state( PlaybackState::default() )
    }


    pub fn with_state( state: PlaybackState ) -> Self {
        Self {
            inner: Arc::new( StoreInner {
                snapshot: RwLock::new( Arc::new( state ) ),
                subscribers: Mutex::new( Vec::new() ),
                next_id: AtomicU64::new( 1 ),
            }),
        }
    }


    /// Returns the current snapshot.
    pub fn snapshot( &self ) -> Arc<PlaybackState> {
        let guard = self.inner.snapshot.read().unwrap_or_else( |e| e.into_inner() );
        Arc::clone( &guard )
    }


    /// Registers a callback and immediately calls it with the current snapshot.
    pub fn subscribe<F>( &self, callback: F ) -> Subscription
    where
        F: Fn( &PlaybackState ) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add( 1, Ordering::Relaxed );
        let callback: Callback = Arc::new( callback );
        self.inner.subscribers().push(( id, Arc::clone( &callback ) ));

        callback( &self.snapshot() );

        Subscription {
            id,
            store: Arc::downgrade( &self.inner ),
        }
    }


    /// Merges `patch` into the snapshot, then notifies every subscriber.
    ///
    /// Subscribers are called outside of any lock, so a callback may apply,
    /// subscribe, or unsubscribe. The callback list is copied before the
    /// fan-out starts; removals made during it take effect on the next one.
    pub fn apply( &self, patch: StatePatch ) {
        {
            let mut guard = self.inner.snapshot.write().unwrap_or_else( |e| e.into_inner() );
            let next = patch.merge( &guard );
            *guard = Arc::new( next );
        }

        let callbacks: Vec<Callback> = self.inner
            .subscribers()
            .iter()
            .map( |( _, cb )| Arc::clone( cb ) )
            .collect();

        // Deliver the latest snapshot rather than the one built above, so a
        // fan-out racing a newer apply never hands out an older state last.
        let snapshot = self.snapshot();
        for callback in callbacks {
            callback( &snapshot );
        }
    }


    pub fn subscriber_count( &self ) -> usize {
        self.inner.subscribers().len()
    }


    /// Drops every subscriber.
    pub fn clear_subscribers( &self ) {
        self.inner.subscribers().clear();
    }
}


impl Default for PlaybackStore {
    fn default() -> Self {
        Self::new()
    }
}


/// Registration returned by [`PlaybackStore::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "keep the subscription to be able to unsubscribe"]
#[derive( Debug )]
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}


impl Subscription {
    /// Removes the callback. Safe to call from inside a notification.
    /// Returns false if it was already removed or the store is gone.
    pub fn unsubscribe( &self ) -> bool {
        match self.store.upgrade() {
            Some( inner ) => inner.remove( self.id ),
            None => false,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn recorder() -> ( Arc<Mutex<Vec<PlaybackState>>>, impl Fn( &PlaybackState ) + Send + Sync + 'static ) {
        let seen = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &seen );
        ( seen, move |s: &PlaybackState| sink.lock().unwrap().push( s.clone() ) )
    }


    #[test]
    fn test_subscribe_receives_current_snapshot() {
        let store = PlaybackStore::new();
        store.apply( StatePatch::new().volume( 0.4 ) );

        let ( seen, callback ) = recorder();
        let _sub = store.subscribe( callback );

        let seen = seen.lock().unwrap();
        assert_eq!( seen.len(), 1 );
        assert_eq!( seen[ 0 ].volume, 0.4 );
    }


    #[test]
    fn test_apply_notifies_in_subscription_order() {
        let store = PlaybackStore::new();
        let order = Arc::new( Mutex::new( Vec::new() ) );
        let mut subs = Vec::new();
        for n in 0..3 {
            let order = Arc::clone( &order );
            subs.push( store.subscribe( move |_| order.lock().unwrap().push( n ) ) );
        }
        order.lock().unwrap().clear();

        store.apply( StatePatch::new().position( 5 ) );
        assert_eq!( *order.lock().unwrap(), vec![ 0, 1, 2 ] );
    }


    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = PlaybackStore::new();
        let ( seen, callback ) = recorder();
        let sub = store.subscribe( callback );

        assert!( sub.unsubscribe() );
        assert!( !sub.unsubscribe() );
        store.apply( StatePatch::new().position( 5 ) );
        assert_eq!( seen.lock().unwrap().len(), 1 );
    }


    #[test]
    fn test_unsubscribe_during_fanout() {
        let store = PlaybackStore::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new( Mutex::new( None ) );

        // First subscriber removes the second one mid fan-out
        let target = Arc::clone( &slot );
        let _first = store.subscribe( move |_| {
            if let Some( sub ) = target.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        let ( seen, callback ) = recorder();
        *slot.lock().unwrap() = Some( store.subscribe( callback ) );
        let ( third_seen, third ) = recorder();
        let _third = store.subscribe( third );

        store.apply( StatePatch::new().position( 7 ) );

        // Already scheduled for this fan-out, so it still sees the update
        assert_eq!( seen.lock().unwrap().len(), 2 );
        assert_eq!( third_seen.lock().unwrap().len(), 2 );
        assert_eq!( store.subscriber_count(), 2 );

        store.apply( StatePatch::new().position( 8 ) );
        assert_eq!( seen.lock().unwrap().len(), 2 );
        assert_eq!( third_seen.lock().unwrap().len(), 3 );
    }


    #[test]
    fn test_self_unsubscribe_inside_callback() {
        let store = PlaybackStore::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new( Mutex::new( None ) );
        let own = Arc::clone( &slot );
        let sub = store.subscribe( move |s| {
            if s.position_ms > 0 {
                if let Some( sub ) = own.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }
        });
        *slot.lock().unwrap() = Some( sub );

        store.apply( StatePatch::new().position( 1 ) );
        assert_eq!( store.subscriber_count(), 0 );
    }


    #[test]
    fn test_apply_from_inside_callback() {
        let store = PlaybackStore::new();
        let inner = store.clone();
        let _sub = store.subscribe( move |s| {
            if s.position_ms == 1 {
                inner.apply( StatePatch::new().position( 2 ) );
            }
        });

        store.apply( StatePatch::new().track( Some( "d1".into() ) ).position( 1 ) );
        assert_eq!( store.snapshot().position_ms, 2 );
    }


    #[test]
    fn test_no_track_means_not_playing() {
        let store = PlaybackStore::new();
        store.apply( StatePatch::new().playing( true ) );
        assert!( !store.snapshot().is_playing );

        store.apply( StatePatch::new().track( Some( "d1".into() ) ).playing( true ) );
        assert!( store.snapshot().is_playing );

        store.apply( StatePatch::new().track( None ) );
        assert!( !store.snapshot().is_playing );
    }


    #[test]
    fn test_position_bounded_by_duration() {
        let store = PlaybackStore::new();
        store.apply( StatePatch::new().track( Some( "d1".into() ) ).duration( 1000 ).position( 5000 ) );
        assert_eq!( store.snapshot().position_ms, 1000 );
    }


    #[test]
    fn test_volume_clamped() {
        let store = PlaybackStore::new();
        store.apply( StatePatch::new().volume( 3.0 ) );
        assert_eq!( store.snapshot().volume, 1.0 );
        store.apply( StatePatch::new().volume( f32::NAN ) );
        assert_eq!( store.snapshot().volume, 0.0 );
    }


    #[test]
    fn test_snapshot_is_immutable_copy() {
        let store = PlaybackStore::new();
        let before = store.snapshot();
        store.apply( StatePatch::new().volume( 0.2 ) );
        assert_eq!( before.volume, 1.0 );
        assert_eq!( store.snapshot().volume, 0.2 );
    }
}
