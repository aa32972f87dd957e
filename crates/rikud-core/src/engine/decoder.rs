//! Audio decoding via Symphonia
//!
//! Decodes an in-memory audio source into interleaved f32 PCM.

use std::io::Cursor;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use thiserror::Error;

use super::EngineError;


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Unsupported format" )]
    UnsupportedFormat,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Seek error: {0}" )]
    Seek( String ),
}


impl From<DecoderError> for EngineError {
    fn from( e: DecoderError ) -> Self {
        match e {
            DecoderError::UnsupportedFormat
            | DecoderError::NoAudioTrack
            | DecoderError::DecoderCreation( _ ) => EngineError::UnsupportedFormat( e.to_string() ),
            DecoderError::Decode( _ ) | DecoderError::Seek( _ ) => EngineError::Rejected( e.to_string() ),
        }
    }
}


/// Symphonia decoder over a fully fetched source.
pub struct Decoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
    duration: Option<Duration>,
}


impl Decoder {
    /// Probes `bytes` and prepares the first audio track for decoding.
    ///
    /// `extension` is only a hint; the probe looks at the content.
    pub fn open( bytes: Vec<u8>, extension: Option<&str> ) -> Result<Self, DecoderError> {
        let mss = MediaSourceStream::new(
            Box::new( Cursor::new( bytes ) ),
            MediaSourceStreamOptions::default(),
        );

        let mut hint = Hint::new();
        if let Some( ext ) = extension {
            hint.with_extension( ext );
        }

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| DecoderError::UnsupportedFormat )?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;
        let sample_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 );
        let duration = codec_params.n_frames
            .map( |frames| Duration::from_secs_f64( frames as f64 / sample_rate as f64 ) );

        tracing::debug!(
            "Opened source: {} Hz, {} channels, duration {:?}",
            sample_rate,
            channels,
            duration
        );

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        Ok( Self {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            sample_buf: None,
            duration,
        })
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> usize {
        self.channels
    }


    pub fn duration( &self ) -> Option<Duration> {
        self.duration
    }


    /// Decodes the next packet into interleaved samples.
    ///
    /// Returns None at end of stream.
    pub fn decode_next( &mut self ) -> Result<Option<Vec<f32>>, DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( None );
                }
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                // Corrupt packet, skip it
                Err( SymphoniaError::DecodeError( _ ) ) => continue,
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            let spec = *decoded.spec();
            let frames = decoded.capacity() as u64;
            let needs_alloc = self.sample_buf
                .as_ref()
                .map_or( true, |buf| ( buf.capacity() as u64 ) < frames * spec.channels.count() as u64 );
            if needs_alloc {
                self.sample_buf = Some( SampleBuffer::new( frames, spec ) );
            }

            if let Some( buf ) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref( decoded );
                return Ok( Some( buf.samples().to_vec() ) );
            }
        }
    }


    /// Seeks to `position`. The decoder is reset afterwards.
    pub fn seek( &mut self, position: Duration ) -> Result<(), DecoderError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position.as_secs_f64() ),
            track_id: Some( self.track_id ),
        };

        self.format_reader
            .seek( SeekMode::Accurate, seek_to )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;
        self.decoder.reset();

        Ok(())
    }
}


/// Guesses a file extension from a URL or path, ignoring query strings.
pub fn extension_hint( url: &str ) -> Option<String> {
    let path = url.split( [ '?', '#' ] ).next().unwrap_or( url );
    let name = path.rsplit( '/' ).next()?;
    let ( _, ext ) = name.rsplit_once( '.' )?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some( ext.to_ascii_lowercase() )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_extension_hint() {
        assert_eq!( extension_hint( "https://x.org/a/b.MP3?token=1" ).as_deref(), Some( "mp3" ) );
        assert_eq!( extension_hint( "/music/dance.flac" ).as_deref(), Some( "flac" ) );
        assert_eq!( extension_hint( "https://x.org/stream" ), None );
        assert_eq!( extension_hint( "https://x.org/v1.2/stream" ), None );
    }


    #[test]
    fn test_garbage_is_unsupported() {
        let result = Decoder::open( vec![ 0u8; 64 ], Some( "mp3" ) );
        assert!( matches!( result, Err( DecoderError::UnsupportedFormat ) ) );
    }
}
