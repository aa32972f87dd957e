//! Audio output via cpal
//!
//! Moves decoded PCM from a shared buffer to the default output device.

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex, MutexGuard };
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;

use super::EngineError;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to start stream: {0}" )]
    PlayStream( String ),
}


impl From<OutputError> for EngineError {
    fn from( e: OutputError ) -> Self {
        match e {
            OutputError::NoDevice => EngineError::NoDevice,
            other => EngineError::Output( other.to_string() ),
        }
    }
}


/// PCM queue shared by the decode side (producer) and the device callback
/// (consumer). Converts channel layout on the way out and applies volume.
pub struct PcmBuffer {
    queue: Mutex<VecDeque<f32>>,
    capacity: usize,
    paused: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    source_channels: usize,
    output_channels: usize,
}


impl PcmBuffer {
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            queue: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            paused: AtomicBool::new( false ),
            volume: AtomicU32::new( 1.0_f32.to_bits() ),
            source_channels: source_channels.max( 1 ) as usize,
            output_channels: output_channels.max( 1 ) as usize,
        }
    }


    fn queue( &self ) -> MutexGuard<'_, VecDeque<f32>> {
        self.queue.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Queues as many samples as fit. Returns how many were taken.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut queue = self.queue();
        let room = self.capacity.saturating_sub( queue.len() );
        let taken = samples.len().min( room );
        queue.extend( samples[ ..taken ].iter().copied() );
        taken
    }


    /// Fills `output` (device layout), padding with silence.
    /// Returns the number of output samples that carried audio.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        if self.paused.load( Ordering::Relaxed ) {
            output.fill( 0.0 );
            return 0;
        }

        let volume = f32::from_bits( self.volume.load( Ordering::Relaxed ) );
        let src_ch = self.source_channels;
        let out_ch = self.output_channels;
        let mut queue = self.queue();

        let frames = ( output.len() / out_ch ).min( queue.len() / src_ch );
        let mut frame = Vec::with_capacity( src_ch );
        for f in 0..frames {
            frame.clear();
            frame.extend( queue.drain( ..src_ch ) );
            let out = &mut output[ f * out_ch..( f + 1 ) * out_ch ];

            if src_ch == 2 && out_ch == 1 {
                out[ 0 ] = ( frame[ 0 ] + frame[ 1 ] ) * 0.5;
            } else {
                // Extra output channels repeat the last source channel
                for ( ch, sample ) in out.iter_mut().enumerate() {
                    *sample = frame[ ch.min( src_ch - 1 ) ];
                }
            }
        }

        let written = frames * out_ch;
        output[ written.. ].fill( 0.0 );
        if volume != 1.0 {
            for sample in output[ ..written ].iter_mut() {
                *sample *= volume;
            }
        }
        written
    }


    pub fn len( &self ) -> usize {
        self.queue().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.queue().is_empty()
    }


    pub fn is_full( &self ) -> bool {
        self.len() >= self.capacity
    }


    pub fn clear( &self ) {
        self.queue().clear();
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.to_bits(), Ordering::Relaxed );
    }
}


/// Output stream on the default device.
///
/// Not `Send`: create and drop it on the same thread.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
}


impl AudioOutput {
    /// Opens the default device for a source of the given format.
    ///
    /// Prefers a config matching both rate and channel count, then one
    /// matching the rate, then the device default (the caller resamples).
    /// `on_error` is called from the device thread if the stream dies.
    pub fn open<E>(
        source_sample_rate: u32,
        source_channels: u16,
        on_error: E,
    ) -> Result<( Self, Arc<PcmBuffer> ), OutputError>
    where
        E: FnMut( String ) + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::debug!( "Using output device: {:?}", device.name() );

        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_sample_rate && c.max_sample_rate().0 >= source_sample_rate
        };

        let config = if let Some( c ) = supported
            .iter()
            .find( |c| c.channels() == source_channels && supports_rate( *c ) )
            .or_else( || supported.iter().find( |c| supports_rate( *c ) ) )
        {
            c.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config()
        } else {
            let default_config = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::info!(
                "Device cannot run at {} Hz, resampling to {} Hz",
                source_sample_rate,
                default_config.sample_rate().0
            );
            default_config.config()
        };

        // About half a second of source audio
        let capacity = ( source_sample_rate as usize ) * ( source_channels.max( 1 ) as usize ) / 2;
        let buffer = Arc::new( PcmBuffer::new( capacity, source_channels, config.channels ) );
        let consumer = Arc::clone( &buffer );
        let mut on_error = on_error;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    consumer.pop( data );
                },
                move |err| {
                    tracing::error!( "Audio output error: {}", err );
                    on_error( err.to_string() );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self {
                stream,
                sample_rate: config.sample_rate.0,
            },
            buffer,
        ))
    }


    pub fn start( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    /// Actual device sample rate.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_push_respects_capacity() {
        let buffer = PcmBuffer::new( 4, 2, 2 );
        assert_eq!( buffer.push( &[ 0.1; 6 ] ), 4 );
        assert!( buffer.is_full() );
        assert_eq!( buffer.push( &[ 0.1 ] ), 0 );
    }


    #[test]
    fn test_pop_mono_to_stereo() {
        let buffer = PcmBuffer::new( 16, 1, 2 );
        buffer.push( &[ 0.5, -0.5 ] );
        let mut out = [ 1.0; 6 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.5, 0.5, -0.5, -0.5, 0.0, 0.0 ] );
    }


    #[test]
    fn test_pop_stereo_to_mono_with_volume() {
        let buffer = PcmBuffer::new( 16, 2, 1 );
        buffer.set_volume( 0.5 );
        buffer.push( &[ 0.4, 0.8 ] );
        let mut out = [ 0.0; 1 ];
        buffer.pop( &mut out );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
    }


    #[test]
    fn test_paused_outputs_silence() {
        let buffer = PcmBuffer::new( 16, 1, 1 );
        buffer.push( &[ 0.9, 0.9 ] );
        buffer.set_paused( true );
        let mut out = [ 1.0; 2 ];
        assert_eq!( buffer.pop( &mut out ), 0 );
        assert_eq!( out, [ 0.0, 0.0 ] );
        assert_eq!( buffer.len(), 2 );
    }
}
