//! In-memory engine for tests.
//!
//! Loads complete immediately unless a gate is installed for the URL, in
//! which case they wait until the test opens it. `play` can be gated per
//! handle the same way. Status events can be pushed for any live handle.

use std::collections::{ HashMap, HashSet };
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{ mpsc, oneshot };

use super::{ AudioEngine, EngineError, EngineHandle, EngineStatus, LoadedSource };


#[derive( Debug, Clone, PartialEq )]
pub enum Call {
    Load( String ),
    Play( EngineHandle ),
    Pause( EngineHandle ),
    Seek( EngineHandle, Duration ),
    Volume( EngineHandle, f32 ),
    Release( EngineHandle ),
}


#[derive( Default )]
struct Script {
    calls: Vec<Call>,
    next_handle: u64,
    live: HashMap<EngineHandle, ( String, mpsc::UnboundedSender<EngineStatus> )>,
    gates: HashMap<String, oneshot::Receiver<()>>,
    play_gates: HashMap<EngineHandle, oneshot::Receiver<()>>,
    durations: HashMap<String, Duration>,
    failing_urls: HashSet<String>,
    reject_play: bool,
    /// Released handles whose channels stay open for stale-event tests.
    released: HashMap<EngineHandle, mpsc::UnboundedSender<EngineStatus>>,
    keep_channels: bool,
    issued: HashMap<EngineHandle, String>,
}


#[derive( Clone, Default )]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}


impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }


    /// Holds loads of `url` until the returned sender fires.
    pub fn gate( &self, url: &str ) -> oneshot::Sender<()> {
        let ( tx, rx ) = oneshot::channel();
        self.script.lock().unwrap().gates.insert( url.to_string(), rx );
        tx
    }


    /// Holds the next `play` on `handle` until the returned sender fires.
    pub fn gate_play( &self, handle: EngineHandle ) -> oneshot::Sender<()> {
        let ( tx, rx ) = oneshot::channel();
        self.script.lock().unwrap().play_gates.insert( handle, rx );
        tx
    }


    pub fn set_duration( &self, url: &str, duration: Duration ) {
        self.script.lock().unwrap().durations.insert( url.to_string(), duration );
    }


    pub fn fail_loads_of( &self, url: &str ) {
        self.script.lock().unwrap().failing_urls.insert( url.to_string() );
    }


    pub fn reject_play( &self, reject: bool ) {
        self.script.lock().unwrap().reject_play = reject;
    }


    /// Keeps status channels open after release so late events can be pushed.
    pub fn keep_channels_open( &self ) {
        self.script.lock().unwrap().keep_channels = true;
    }


    pub fn calls( &self ) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }


    pub fn live_handles( &self ) -> Vec<EngineHandle> {
        let mut handles: Vec<_> = self.script.lock().unwrap().live.keys().copied().collect();
        handles.sort_by_key( |h| h.raw() );
        handles
    }


    /// The most recent handle loaded from `url`, live or released.
    pub fn handle_for( &self, url: &str ) -> Option<EngineHandle> {
        self.script.lock().unwrap().issued
            .iter()
            .filter( |( _, u )| u.as_str() == url )
            .map( |( h, _ )| *h )
            .max_by_key( |h| h.raw() )
    }


    /// Pushes a status event on a handle's channel.
    pub fn emit( &self, handle: EngineHandle, status: EngineStatus ) {
        let script = self.script.lock().unwrap();
        let tx = script.live.get( &handle ).map( |( _, tx )| tx ).or_else( || script.released.get( &handle ) );
        if let Some( tx ) = tx {
            let _ = tx.send( status );
        }
    }


    fn record( &self, call: Call ) {
        self.script.lock().unwrap().calls.push( call );
    }


    fn check_live( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        if self.script.lock().unwrap().live.contains_key( &handle ) {
            Ok(())
        } else {
            Err( EngineError::UnknownHandle( handle ) )
        }
    }
}


#[async_trait]
impl AudioEngine for ScriptedEngine {
    async fn load( &self, url: &str, _volume: f32 ) -> Result<LoadedSource, EngineError> {
        self.record( Call::Load( url.to_string() ) );
        let gate = self.script.lock().unwrap().gates.remove( url );
        if let Some( gate ) = gate {
            let _ = gate.await;
        }

        let mut script = self.script.lock().unwrap();
        if script.failing_urls.contains( url ) {
            return Err( EngineError::SourceUnavailable( url.to_string() ) );
        }

        script.next_handle += 1;
        let handle = EngineHandle::new( script.next_handle );
        let ( tx, rx ) = mpsc::unbounded_channel();
        script.live.insert( handle, ( url.to_string(), tx ) );
        script.issued.insert( handle, url.to_string() );
        let duration = script.durations.get( url ).copied();

        Ok( LoadedSource { handle, duration, status: rx } )
    }


    async fn play( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        self.record( Call::Play( handle ) );
        let gate = self.script.lock().unwrap().play_gates.remove( &handle );
        if let Some( gate ) = gate {
            let _ = gate.await;
        }
        self.check_live( handle )?;
        if self.script.lock().unwrap().reject_play {
            return Err( EngineError::Rejected( "play refused".into() ) );
        }
        Ok(())
    }


    async fn pause( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        self.record( Call::Pause( handle ) );
        self.check_live( handle )
    }


    async fn seek( &self, handle: EngineHandle, position: Duration ) -> Result<(), EngineError> {
        self.record( Call::Seek( handle, position ) );
        self.check_live( handle )
    }


    async fn set_volume( &self, handle: EngineHandle, volume: f32 ) -> Result<(), EngineError> {
        self.record( Call::Volume( handle, volume ) );
        self.check_live( handle )
    }


    async fn release( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        self.record( Call::Release( handle ) );
        // Dropping the sender closes the status channel
        let mut script = self.script.lock().unwrap();
        if let Some( ( _, tx ) ) = script.live.remove( &handle ) {
            if script.keep_channels {
                script.released.insert( handle, tx );
            }
        }
        Ok(())
    }
}
