//! Play statistics recording
//!
//! A play is recorded against an external record store, which answers with
//! the entry's updated statistics. Recording is advisory: callers log
//! failures and carry on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ HeaderMap, HeaderValue, AUTHORIZATION };
use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::catalog::PlayStats;


/// Errors from recording a play.
#[derive( Debug, Error )]
pub enum StatsError {
    #[error( "HTTP error: {0}" )]
    Http( #[from] reqwest::Error ),

    #[error( "Record store returned {status}: {body}" )]
    Status { status: u16, body: String },

    #[error( "Unexpected response: {0}" )]
    Decode( String ),

    #[error( "Record store is not configured: {0}" )]
    NotConfigured( String ),
}


/// Write side of the record store.
#[async_trait]
pub trait PlayRecorder: Send + Sync {
    /// Records one play of `entry_id` and returns its updated statistics.
    async fn record_play( &self, entry_id: &str ) -> Result<PlayStats, StatsError>;
}


#[derive( Serialize )]
struct RecordPlayRequest<'a> {
    entry_id: &'a str,
}


/// The RPC answers with either a row or a set of rows.
#[derive( Deserialize )]
#[serde( untagged )]
enum RecordPlayResponse {
    One( PlayStats ),
    Many( Vec<PlayStats> ),
}


impl RecordPlayResponse {
    fn into_stats( self ) -> Result<PlayStats, StatsError> {
        match self {
            RecordPlayResponse::One( stats ) => Ok( stats ),
            RecordPlayResponse::Many( rows ) => rows
                .into_iter()
                .next()
                .ok_or_else( || StatsError::Decode( "empty result set".into() ) ),
        }
    }
}


/// Records plays through the record store's REST RPC endpoint.
pub struct RestRecorder {
    http: reqwest::Client,
    rpc_url: String,
}


impl RestRecorder {
    const RPC_PATH: &'static str = "/rest/v1/rpc/record_play";

    pub fn new( endpoint: &str, api_key: Option<&str>, timeout: Duration ) -> Result<Self, StatsError> {
        let endpoint = endpoint.trim().trim_end_matches( '/' );
        if endpoint.is_empty() {
            return Err( StatsError::NotConfigured( "endpoint is empty".into() ) );
        }

        let mut headers = HeaderMap::new();
        if let Some( key ) = api_key.map( str::trim ).filter( |k| !k.is_empty() ) {
            let invalid = |_| StatsError::NotConfigured( "API key is not a valid header value".into() );
            headers.insert( "apikey", HeaderValue::from_str( key ).map_err( invalid )? );
            headers.insert( AUTHORIZATION, HeaderValue::from_str( &format!( "Bearer {}", key ) ).map_err( invalid )? );
        }

        let http = reqwest::Client::builder()
            .user_agent( concat!( "rikud/", env!( "CARGO_PKG_VERSION" ) ) )
            .default_headers( headers )
            .timeout( timeout )
            .build()?;

        Ok( Self {
            http,
            rpc_url: format!( "{}{}", endpoint, Self::RPC_PATH ),
        })
    }


    pub fn rpc_url( &self ) -> &str {
        &self.rpc_url
    }
}


#[async_trait]
impl PlayRecorder for RestRecorder {
    async fn record_play( &self, entry_id: &str ) -> Result<PlayStats, StatsError> {
        tracing::debug!( "Recording play of {}", entry_id );

        let response = self.http
            .post( &self.rpc_url )
            .json( &RecordPlayRequest { entry_id } )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err( StatsError::Status { status: status.as_u16(), body } );
        }

        let body = response.text().await?;
        parse_response( &body )
    }
}


fn parse_response( body: &str ) -> Result<PlayStats, StatsError> {
    serde_json::from_str::<RecordPlayResponse>( body )
        .map_err( |e| StatsError::Decode( e.to_string() ) )?
        .into_stats()
}


/// Keeps play counts in memory. Used when no record store is configured.
#[derive( Default )]
pub struct LocalRecorder {
    counts: Mutex<HashMap<String, u32>>,
}


impl LocalRecorder {
    pub fn new() -> Self {
        Self::default()
    }


    /// Seeds counts, e.g. from the catalog's `times_played`.
    pub fn with_counts<I>( counts: I ) -> Self
    where
        I: IntoIterator<Item = ( String, u32 )>,
    {
        Self { counts: Mutex::new( counts.into_iter().collect() ) }
    }
}


#[async_trait]
impl PlayRecorder for LocalRecorder {
    async fn record_play( &self, entry_id: &str ) -> Result<PlayStats, StatsError> {
        let mut counts = self.counts.lock().unwrap_or_else( |e| e.into_inner() );
        let times_played = counts.entry( entry_id.to_string() ).or_insert( 0 );
        *times_played = times_played.saturating_add( 1 );

        Ok( PlayStats {
            last_played_at: Utc::now(),
            times_played: *times_played,
        })
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_object_response() {
        let stats = parse_response( r#"{"last_played":"2024-03-01T10:00:00Z","times_played":4}"# ).unwrap();
        assert_eq!( stats.times_played, 4 );
        assert_eq!( stats.last_played_at.to_rfc3339(), "2024-03-01T10:00:00+00:00" );
    }


    #[test]
    fn test_parse_array_response() {
        let stats = parse_response( r#"[{"last_played":"2024-03-01T10:00:00Z","times_played":9}]"# ).unwrap();
        assert_eq!( stats.times_played, 9 );
    }


    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!( matches!( parse_response( "[]" ), Err( StatsError::Decode( _ ) ) ) );
        assert!( matches!( parse_response( "null" ), Err( StatsError::Decode( _ ) ) ) );
        assert!( matches!( parse_response( r#"{"times_played":"x"}"# ), Err( StatsError::Decode( _ ) ) ) );
    }


    #[test]
    fn test_rest_recorder_url() {
        let recorder = RestRecorder::new( "https://db.example.org/", Some( "k" ), Duration::from_secs( 5 ) ).unwrap();
        assert_eq!( recorder.rpc_url(), "https://db.example.org/rest/v1/rpc/record_play" );
        assert!( matches!(
            RestRecorder::new( "  ", None, Duration::from_secs( 5 ) ),
            Err( StatsError::NotConfigured( _ ) )
        ));
    }


    #[tokio::test]
    async fn test_local_recorder_counts() {
        let recorder = LocalRecorder::with_counts( [ ( "d1".to_string(), 2 ) ] );
        assert_eq!( recorder.record_play( "d1" ).await.unwrap().times_played, 3 );
        assert_eq!( recorder.record_play( "d2" ).await.unwrap().times_played, 1 );
        assert_eq!( recorder.record_play( "d2" ).await.unwrap().times_played, 2 );
    }
}
