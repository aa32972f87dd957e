//! Local audio engine
//!
//! Fetches a source (HTTP, `file://`, or a plain path), decodes it with
//! Symphonia and plays it through cpal. Every loaded handle gets its own
//! playback thread, which owns the decoder and the output stream; the
//! engine talks to it over a command channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{ mpsc as std_mpsc, Arc, Mutex, MutexGuard };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::thread;
use std::time::{ Duration, Instant };

use async_trait::async_trait;
use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use tokio::sync::{ mpsc, oneshot };

use super::decoder::{ extension_hint, Decoder };
use super::output::{ AudioOutput, PcmBuffer };
use super::{ AudioEngine, EngineConfig, EngineError, EngineHandle, EngineStatus, LoadedSource };


/// Commands sent to a playback thread.
#[derive( Debug )]
enum Control {
    Play,
    Pause,
    Seek( Duration ),
    Volume( f32 ),
    Stop,
}


/// Engine-side record of a live playback thread.
struct Voice {
    controls: std_mpsc::Sender<Control>,
    thread: Option<thread::JoinHandle<()>>,
}


/// Audio engine playing through the default output device.
pub struct LocalEngine {
    config: EngineConfig,
    http: reqwest::Client,
    voices: Mutex<HashMap<EngineHandle, Voice>>,
    next_handle: AtomicU64,
}


impl LocalEngine {
    pub fn new( config: EngineConfig ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout( config.fetch_timeout )
            .user_agent( concat!( "rikud/", env!( "CARGO_PKG_VERSION" ) ) )
            .build()
            .map_err( |e| EngineError::SourceUnavailable( e.to_string() ) )?;

        Ok( Self {
            config,
            http,
            voices: Mutex::new( HashMap::new() ),
            next_handle: AtomicU64::new( 1 ),
        })
    }


    fn voices( &self ) -> MutexGuard<'_, HashMap<EngineHandle, Voice>> {
        self.voices.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Reads the whole source into memory.
    async fn fetch( &self, url: &str ) -> Result<Vec<u8>, EngineError> {
        let unavailable = |e: &dyn std::fmt::Display| {
            EngineError::SourceUnavailable( format!( "{}: {}", url, e ) )
        };

        if url.starts_with( "http://" ) || url.starts_with( "https://" ) {
            let response = self.http
                .get( url )
                .send()
                .await
                .and_then( |r| r.error_for_status() )
                .map_err( |e| unavailable( &e ) )?;
            let bytes = response.bytes().await.map_err( |e| unavailable( &e ) )?;
            Ok( bytes.to_vec() )
        } else {
            let path = PathBuf::from( url.strip_prefix( "file://" ).unwrap_or( url ) );
            tokio::fs::read( &path ).await.map_err( |e| unavailable( &e ) )
        }
    }


    fn send( &self, handle: EngineHandle, control: Control ) -> Result<(), EngineError> {
        let voices = self.voices();
        let voice = voices.get( &handle ).ok_or( EngineError::UnknownHandle( handle ) )?;
        voice.controls
            .send( control )
            .map_err( |_| EngineError::Rejected( "playback thread has exited".into() ) )
    }
}


#[async_trait]
impl AudioEngine for LocalEngine {
    async fn load( &self, url: &str, volume: f32 ) -> Result<LoadedSource, EngineError> {
        let bytes = self.fetch( url ).await?;
        let extension = extension_hint( url );
        tracing::debug!( "Fetched {} bytes from {}", bytes.len(), url );

        let ( status_tx, status_rx ) = mpsc::unbounded_channel();
        let ( control_tx, control_rx ) = std_mpsc::channel();
        let ( ready_tx, ready_rx ) = oneshot::channel();
        let interval = self.config.status_interval;

        let thread = thread::Builder::new()
            .name( "rikud-playback".into() )
            .spawn( move || {
                run_voice( bytes, extension, volume, interval, control_rx, status_tx, ready_tx );
            })
            .map_err( |e| EngineError::Output( e.to_string() ) )?;

        let duration = match ready_rx.await {
            Ok( Ok( duration ) ) => duration,
            Ok( Err( e ) ) => {
                join_voice( thread ).await?;
                return Err( e );
            }
            Err( _ ) => {
                join_voice( thread ).await?;
                return Err( EngineError::Output( "playback thread exited during load".into() ) );
            }
        };

        let handle = EngineHandle::new( self.next_handle.fetch_add( 1, Ordering::Relaxed ) );
        self.voices().insert( handle, Voice { controls: control_tx, thread: Some( thread ) } );
        tracing::info!( "Loaded {} as {:?}", url, handle );

        Ok( LoadedSource { handle, duration, status: status_rx } )
    }


    async fn play( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        self.send( handle, Control::Play )
    }


    async fn pause( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        self.send( handle, Control::Pause )
    }


    async fn seek( &self, handle: EngineHandle, position: Duration ) -> Result<(), EngineError> {
        self.send( handle, Control::Seek( position ) )
    }


    async fn set_volume( &self, handle: EngineHandle, volume: f32 ) -> Result<(), EngineError> {
        self.send( handle, Control::Volume( volume ) )
    }


    async fn release( &self, handle: EngineHandle ) -> Result<(), EngineError> {
        let voice = self.voices().remove( &handle );
        let Some( mut voice ) = voice else {
            return Ok(());
        };

        // The thread may already be gone after a failure
        let _ = voice.controls.send( Control::Stop );
        if let Some( thread ) = voice.thread.take() {
            join_voice( thread ).await?;
        }
        tracing::debug!( "Released {:?}", handle );
        Ok(())
    }
}


/// Waits for a playback thread off the async workers.
async fn join_voice( thread: thread::JoinHandle<()> ) -> Result<(), EngineError> {
    tokio::task::spawn_blocking( move || {
        let _ = thread.join();
    })
    .await
    .map_err( |e| EngineError::Output( e.to_string() ) )
}


impl Drop for LocalEngine {
    fn drop( &mut self ) {
        for ( _, voice ) in self.voices().drain() {
            let _ = voice.controls.send( Control::Stop );
        }
    }
}


/// Rate converter used when the device cannot run at the source rate.
struct RateConverter {
    resampler: FastFixedOut<f32>,
    pending: Vec<Vec<f32>>,
}


impl RateConverter {
    fn new( from: u32, to: u32, channels: usize ) -> Result<Self, EngineError> {
        let resampler = FastFixedOut::<f32>::new(
            to as f64 / from as f64,
            2.0,
            PolynomialDegree::Cubic,
            1024,
            channels,
        ).map_err( |e| EngineError::Output( format!( "Failed to create resampler: {}", e ) ) )?;

        Ok( Self {
            resampler,
            pending: vec![ Vec::new(); channels ],
        })
    }


    /// Converts interleaved input; output may lag behind by one chunk.
    fn process( &mut self, samples: &[f32] ) -> Vec<f32> {
        let channels = self.pending.len();
        for frame in samples.chunks_exact( channels ) {
            for ( ch, sample ) in frame.iter().enumerate() {
                self.pending[ ch ].push( *sample );
            }
        }

        let mut out = Vec::new();
        while self.pending[ 0 ].len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self.pending
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();
            match self.resampler.process( &chunk, None ) {
                Ok( planar ) => interleave_into( &planar, &mut out ),
                Err( e ) => {
                    tracing::warn!( "Resample error: {}", e );
                    break;
                }
            }
        }
        out
    }


    /// Drains whatever is left at end of stream.
    fn flush( &mut self ) -> Vec<f32> {
        let mut out = Vec::new();
        if self.pending[ 0 ].is_empty() {
            return out;
        }
        match self.resampler.process_partial( Some( self.pending.as_slice() ), None ) {
            Ok( planar ) => interleave_into( &planar, &mut out ),
            Err( e ) => tracing::warn!( "Final resample error: {}", e ),
        }
        self.reset();
        out
    }


    fn reset( &mut self ) {
        for ch in self.pending.iter_mut() {
            ch.clear();
        }
        self.resampler.reset();
    }
}


/// [[L0, L1], [R0, R1]] -> [L0, R0, L1, R1]
fn interleave_into( planar: &[Vec<f32>], out: &mut Vec<f32> ) {
    let frames = planar.first().map_or( 0, Vec::len );
    out.reserve( frames * planar.len() );
    for f in 0..frames {
        for ch in planar {
            out.push( ch[ f ] );
        }
    }
}


/// Body of a playback thread.
fn run_voice(
    bytes: Vec<u8>,
    extension: Option<String>,
    volume: f32,
    interval: Duration,
    controls: std_mpsc::Receiver<Control>,
    status: mpsc::UnboundedSender<EngineStatus>,
    ready: oneshot::Sender<Result<Option<Duration>, EngineError>>,
) {
    let decoder = match Decoder::open( bytes, extension.as_deref() ) {
        Ok( decoder ) => decoder,
        Err( e ) => {
            let _ = ready.send( Err( e.into() ) );
            return;
        }
    };

    let failures = status.clone();
    let opened = AudioOutput::open(
        decoder.sample_rate(),
        decoder.channels() as u16,
        move |message| {
            let _ = failures.send( EngineStatus::Failed { message } );
        },
    );
    let ( output, buffer ) = match opened {
        Ok( opened ) => opened,
        Err( e ) => {
            let _ = ready.send( Err( e.into() ) );
            return;
        }
    };

    buffer.set_volume( volume );
    buffer.set_paused( true );
    if let Err( e ) = output.start() {
        let _ = ready.send( Err( e.into() ) );
        return;
    }

    let converter = if output.sample_rate() != decoder.sample_rate() {
        match RateConverter::new( decoder.sample_rate(), output.sample_rate(), decoder.channels() ) {
            Ok( converter ) => Some( converter ),
            Err( e ) => {
                let _ = ready.send( Err( e ) );
                return;
            }
        }
    } else {
        None
    };

    if ready.send( Ok( decoder.duration() ) ).is_err() {
        // Load was abandoned
        return;
    }

    let mut voice = VoiceLoop {
        decoder,
        buffer,
        converter,
        status,
        interval,
        frames: 0,
        playing: false,
        draining: false,
    };
    voice.run( &controls );

    // Output stream is dropped on this thread
    drop( output );
    tracing::debug!( "Playback thread exiting" );
}


/// State owned by a playback thread while it runs.
struct VoiceLoop {
    decoder: Decoder,
    buffer: Arc<PcmBuffer>,
    converter: Option<RateConverter>,
    status: mpsc::UnboundedSender<EngineStatus>,
    interval: Duration,
    /// Source frames handed to the output so far
    frames: u64,
    playing: bool,
    /// End of stream reached; waiting for the buffer to empty
    draining: bool,
}


impl VoiceLoop {
    fn run( &mut self, controls: &std_mpsc::Receiver<Control> ) {
        let mut last_report = Instant::now();

        loop {
            let wait = if self.playing && !self.draining && !self.buffer.is_full() {
                Duration::ZERO
            } else {
                Duration::from_millis( 10 )
            };

            match controls.recv_timeout( wait ) {
                Ok( Control::Stop ) | Err( std_mpsc::RecvTimeoutError::Disconnected ) => break,
                Ok( control ) => {
                    self.apply( control );
                    self.report();
                    last_report = Instant::now();
                    continue;
                }
                Err( std_mpsc::RecvTimeoutError::Timeout ) => {}
            }

            if self.playing {
                if self.draining {
                    if self.buffer.is_empty() {
                        self.playing = false;
                        self.draining = false;
                        self.buffer.set_paused( true );
                        let _ = self.status.send( EngineStatus::Finished );
                    }
                } else if !self.buffer.is_full() {
                    if let Err( message ) = self.decode_chunk() {
                        tracing::error!( "Decode failed: {}", message );
                        let _ = self.status.send( EngineStatus::Failed { message } );
                        break;
                    }
                }

                if last_report.elapsed() >= self.interval {
                    self.report();
                    last_report = Instant::now();
                }
            }
        }
    }


    fn apply( &mut self, control: Control ) {
        match control {
            Control::Play => {
                self.playing = true;
                self.buffer.set_paused( false );
            }
            Control::Pause => {
                self.playing = false;
                self.buffer.set_paused( true );
            }
            Control::Seek( position ) => match self.decoder.seek( position ) {
                Ok(()) => {
                    self.buffer.clear();
                    if let Some( converter ) = self.converter.as_mut() {
                        converter.reset();
                    }
                    self.frames = ( position.as_secs_f64() * self.decoder.sample_rate() as f64 ) as u64;
                    self.draining = false;
                }
                Err( e ) => tracing::warn!( "Seek to {:?} failed: {}", position, e ),
            },
            Control::Volume( volume ) => self.buffer.set_volume( volume ),
            Control::Stop => {}
        }
    }


    /// Decodes one packet into the output buffer.
    fn decode_chunk( &mut self ) -> Result<(), String> {
        let samples = match self.decoder.decode_next().map_err( |e| e.to_string() )? {
            Some( samples ) => samples,
            None => {
                let tail = self.converter.as_mut().map( RateConverter::flush ).unwrap_or_default();
                self.push_all( &tail );
                self.draining = true;
                return Ok(());
            }
        };

        self.frames += ( samples.len() / self.decoder.channels().max( 1 ) ) as u64;
        let converted = match self.converter.as_mut() {
            Some( converter ) => converter.process( &samples ),
            None => samples,
        };
        self.push_all( &converted );
        Ok(())
    }


    /// Pushes everything, waiting for room while still playing.
    fn push_all( &self, samples: &[f32] ) {
        let mut offset = 0;
        while offset < samples.len() {
            let pushed = self.buffer.push( &samples[ offset.. ] );
            offset += pushed;
            if pushed == 0 {
                if self.buffer.is_paused() {
                    // Keeps the rest of the chunk from blocking a pause
                    break;
                }
                thread::sleep( Duration::from_millis( 5 ) );
            }
        }
    }


    fn position( &self ) -> Duration {
        let rate = self.decoder.sample_rate().max( 1 ) as f64;
        Duration::from_secs_f64( self.frames as f64 / rate )
    }


    fn report( &self ) {
        let _ = self.status.send( EngineStatus::Progress {
            position: self.position(),
            duration: self.decoder.duration(),
            playing: self.playing,
        });
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_interleave() {
        let mut out = Vec::new();
        interleave_into( &[ vec![ 1.0, 2.0 ], vec![ 3.0, 4.0 ] ], &mut out );
        assert_eq!( out, vec![ 1.0, 3.0, 2.0, 4.0 ] );
    }


    #[test]
    fn test_rate_converter_produces_output() {
        let mut converter = RateConverter::new( 22050, 44100, 2 ).unwrap();
        let input = vec![ 0.25_f32; 2 * 4096 ];
        let mut out = converter.process( &input );
        out.extend( converter.flush() );
        assert!( !out.is_empty() );
        assert_eq!( out.len() % 2, 0 );
    }


    #[tokio::test( flavor = "current_thread" )]
    async fn test_undecodable_file_fails_load() {
        let path = std::env::temp_dir().join( format!( "rikud-garbage-{}.bin", std::process::id() ) );
        std::fs::write( &path, b"this is not audio at all" ).unwrap();

        let engine = LocalEngine::new( EngineConfig::default() ).unwrap();
        let url = format!( "file://{}", path.display() );
        let result = tokio::time::timeout( Duration::from_secs( 5 ), engine.load( &url, 1.0 ) ).await;
        let _ = std::fs::remove_file( &path );

        assert!( matches!( result, Ok( Err( EngineError::UnsupportedFormat( _ ) ) ) ) );
        assert!( engine.voices().is_empty() );
    }


    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let engine = LocalEngine::new( EngineConfig::default() ).unwrap();
        let result = engine.load( "file:///definitely/not/here.mp3", 1.0 ).await;
        assert!( matches!( result, Err( EngineError::SourceUnavailable( _ ) ) ) );
    }


    #[tokio::test]
    async fn test_unknown_handle() {
        let engine = LocalEngine::new( EngineConfig::default() ).unwrap();
        let handle = EngineHandle::new( 42 );
        assert!( matches!( engine.play( handle ).await, Err( EngineError::UnknownHandle( _ ) ) ) );
        assert!( engine.release( handle ).await.is_ok() );
    }
}
