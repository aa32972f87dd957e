//! Catalog entries as consumed by the playback core
//!
//! Entries are owned by the record store; this module only reads them,
//! derives the "recently played" and "most played" listings, and folds
//! play statistics returned by the store back into the in-memory copy.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use thiserror::Error;


/// Errors that can occur while reading a catalog.
#[derive( Debug, Error )]
pub enum CatalogError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Invalid catalog: {0}" )]
    Parse( #[from] serde_json::Error ),

    #[error( "Duplicate entry id: {0}" )]
    DuplicateId( String ),
}


/// Audio rendition of a catalog entry.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize )]
#[serde( rename_all = "lowercase" )]
pub enum Variant {
    #[default]
    Full,
    Short,
}


impl Variant {
    /// Returns the other rendition.
    pub fn flipped( self ) -> Self {
        match self {
            Variant::Full => Variant::Short,
            Variant::Short => Variant::Full,
        }
    }


    pub fn as_str( self ) -> &'static str {
        match self {
            Variant::Full => "full",
            Variant::Short => "short",
        }
    }
}


impl fmt::Display for Variant {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( self.as_str() )
    }
}


/// Play statistics returned by the record store after a play is recorded.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct PlayStats {
    #[serde( rename = "last_played" )]
    pub last_played_at: DateTime<Utc>,
    pub times_played: u32,
}


/// One dance in the catalog.
///
/// Field names on the wire follow the record store's column names.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct CatalogEntry {
    pub id: String,

    #[serde( rename = "name_en", default )]
    pub name: String,

    #[serde( rename = "audio_url", default )]
    pub full_audio_url: Option<String>,

    #[serde( rename = "audio_short_url", default )]
    pub short_audio_url: Option<String>,

    /// Stored in milliseconds under `duration`.
    #[serde( rename = "duration", default, with = "store_millis" )]
    pub duration_seconds: f64,

    #[serde( rename = "last_played", default )]
    pub last_played_at: Option<DateTime<Utc>>,

    #[serde( default )]
    pub times_played: u32,
}


impl CatalogEntry {
    /// Creates an entry with no play history.
    pub fn new(
        id: impl Into<String>,
        full_audio_url: Option<&str>,
        short_audio_url: Option<&str>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            full_audio_url: full_audio_url.map( str::to_owned ),
            short_audio_url: short_audio_url.map( str::to_owned ),
            duration_seconds,
            last_played_at: None,
            times_played: 0,
        }
    }


    /// Returns the audio URL for a variant. Blank URLs count as absent.
    pub fn audio_url( &self, variant: Variant ) -> Option<&str> {
        let url = match variant {
            Variant::Full => self.full_audio_url.as_deref(),
            Variant::Short => self.short_audio_url.as_deref(),
        };
        url.map( str::trim ).filter( |u| !u.is_empty() )
    }


    /// Duration from the catalog in milliseconds, or 0 when unknown.
    pub fn nominal_duration_ms( &self ) -> u64 {
        if self.duration_seconds.is_finite() && self.duration_seconds > 0.0 {
            ( self.duration_seconds * 1000.0 ).round() as u64
        } else {
            0
        }
    }


    /// Returns the name, falling back to the id for unnamed entries.
    pub fn display_name( &self ) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }


    pub fn apply_stats( &mut self, stats: &PlayStats ) {
        self.last_played_at = Some( stats.last_played_at );
        self.times_played = stats.times_played;
    }
}


/// In-memory catalog of entries, in store order.
#[derive( Debug, Clone, Default )]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}


impl Catalog {
    /// Builds a catalog, rejecting duplicate ids.
    pub fn new( entries: Vec<CatalogEntry> ) -> Result<Self, CatalogError> {
        for ( i, entry ) in entries.iter().enumerate() {
            if entries[ ..i ].iter().any( |e| e.id == entry.id ) {
                return Err( CatalogError::DuplicateId( entry.id.clone() ) );
            }
        }
        Ok( Self { entries } )
    }


    /// Parses a JSON array of entries.
    pub fn from_json( json: &str ) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str( json )?;
        Self::new( entries )
    }


    /// Loads a catalog from a JSON file.
    pub fn load( path: &Path ) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string( path )?;
        let catalog = Self::from_json( &contents )?;
        tracing::info!( "Loaded {} catalog entries from {:?}", catalog.len(), path );
        Ok( catalog )
    }


    pub fn entries( &self ) -> &[CatalogEntry] {
        &self.entries
    }


    pub fn len( &self ) -> usize {
        self.entries.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.entries.is_empty()
    }


    pub fn get( &self, id: &str ) -> Option<&CatalogEntry> {
        self.entries.iter().find( |e| e.id == id )
    }


    /// Entries that have been played, most recent first.
    pub fn recently_played( &self, limit: usize ) -> Vec<&CatalogEntry> {
        let mut played: Vec<&CatalogEntry> = self.entries
            .iter()
            .filter( |e| e.last_played_at.is_some() )
            .collect();
        played.sort_by( |a, b| b.last_played_at.cmp( &a.last_played_at ) );
        played.truncate( limit );
        played
    }


    /// Entries with at least one play, highest play count first.
    pub fn most_played( &self, limit: usize ) -> Vec<&CatalogEntry> {
        let mut played: Vec<&CatalogEntry> = self.entries
            .iter()
            .filter( |e| e.times_played > 0 )
            .collect();
        // Stable sort keeps store order among ties
        played.sort_by( |a, b| b.times_played.cmp( &a.times_played ) );
        played.truncate( limit );
        played
    }


    /// Folds recorded play statistics into an entry.
    /// Returns false if the entry is unknown.
    pub fn apply_stats( &mut self, id: &str, stats: &PlayStats ) -> bool {
        match self.entries.iter_mut().find( |e| e.id == id ) {
            Some( entry ) => {
                entry.apply_stats( stats );
                true
            }
            None => false,
        }
    }
}


/// The record store's `duration` column holds milliseconds.
mod store_millis {
    use serde::{ Deserialize, Deserializer, Serializer };


    pub fn serialize<S: Serializer>( seconds: &f64, serializer: S ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64( ( seconds * 1000.0 ).round() )
    }


    pub fn deserialize<'de, D: Deserializer<'de>>( deserializer: D ) -> Result<f64, D::Error> {
        let millis = Option::<f64>::deserialize( deserializer )?;
        Ok( millis.unwrap_or( 0.0 ) / 1000.0 )
    }
}


/// Formats milliseconds as `m:ss`. Zero renders as `0:00`.
pub fn format_duration( milliseconds: u64 ) -> String {
    let minutes = milliseconds / 60_000;
    let seconds = ( milliseconds % 60_000 ) / 1000;
    format!( "{}:{:02}", minutes, seconds )
}


#[cfg( test )]
mod tests {
    use super::*;

    use chrono::TimeZone;


    fn at( secs: i64 ) -> DateTime<Utc> {
        Utc.timestamp_opt( secs, 0 ).unwrap()
    }


    #[test]
    fn test_audio_url_by_variant() {
        let entry = CatalogEntry::new( "d1", Some( "a" ), None, 180.0 );
        assert_eq!( entry.audio_url( Variant::Full ), Some( "a" ) );
        assert_eq!( entry.audio_url( Variant::Short ), None );
    }


    #[test]
    fn test_blank_url_is_absent() {
        let entry = CatalogEntry::new( "d1", Some( "a" ), Some( "  " ), 180.0 );
        assert_eq!( entry.audio_url( Variant::Short ), None );
    }


    #[test]
    fn test_nominal_duration() {
        assert_eq!( CatalogEntry::new( "d1", None, None, 180.0 ).nominal_duration_ms(), 180_000 );
        assert_eq!( CatalogEntry::new( "d1", None, None, -3.0 ).nominal_duration_ms(), 0 );
        assert_eq!( CatalogEntry::new( "d1", None, None, f64::NAN ).nominal_duration_ms(), 0 );
    }


    #[test]
    fn test_parse_store_row() {
        let json = r#"[{
            "id": "d1",
            "name_en": "Zikaron Yashan",
            "audio_url": "https://example.com/full.mp3",
            "audio_short_url": null,
            "duration": 180000,
            "last_played": "2025-01-18T10:00:00Z",
            "times_played": 4,
            "shapes_en": "Circle"
        }]"#;
        let catalog = Catalog::from_json( json ).unwrap();
        let entry = catalog.get( "d1" ).unwrap();
        assert_eq!( entry.display_name(), "Zikaron Yashan" );
        assert_eq!( entry.short_audio_url, None );
        assert_eq!( entry.times_played, 4 );
        assert!( entry.last_played_at.is_some() );
        assert_eq!( entry.duration_seconds, 180.0 );
        assert_eq!( entry.nominal_duration_ms(), 180_000 );
    }


    #[test]
    fn test_store_duration_written_as_millis() {
        let json = serde_json::to_value( CatalogEntry::new( "d1", Some( "a" ), None, 185.5 ) ).unwrap();
        assert_eq!( json[ "duration" ], 185_500.0 );

        let row = r#"[{ "id": "d2", "duration": null }]"#;
        assert_eq!( Catalog::from_json( row ).unwrap().get( "d2" ).unwrap().nominal_duration_ms(), 0 );
    }


    #[test]
    fn test_duplicate_ids_rejected() {
        let result = Catalog::new( vec![
            CatalogEntry::new( "d1", Some( "a" ), None, 1.0 ),
            CatalogEntry::new( "d1", Some( "b" ), None, 1.0 ),
        ]);
        assert!( matches!( result, Err( CatalogError::DuplicateId( id ) ) if id == "d1" ) );
    }


    #[test]
    fn test_recently_and_most_played() {
        let mut a = CatalogEntry::new( "a", Some( "a" ), None, 1.0 );
        a.last_played_at = Some( at( 100 ) );
        a.times_played = 2;
        let mut b = CatalogEntry::new( "b", Some( "b" ), None, 1.0 );
        b.last_played_at = Some( at( 200 ) );
        b.times_played = 5;
        let c = CatalogEntry::new( "c", Some( "c" ), None, 1.0 );
        let catalog = Catalog::new( vec![ a, b, c ] ).unwrap();

        let recent: Vec<&str> = catalog.recently_played( 10 ).iter().map( |e| e.id.as_str() ).collect();
        assert_eq!( recent, vec![ "b", "a" ] );

        let top: Vec<&str> = catalog.most_played( 1 ).iter().map( |e| e.id.as_str() ).collect();
        assert_eq!( top, vec![ "b" ] );
    }


    #[test]
    fn test_apply_stats() {
        let mut catalog = Catalog::new( vec![ CatalogEntry::new( "d1", Some( "a" ), None, 1.0 ) ] ).unwrap();
        let stats = PlayStats { last_played_at: at( 300 ), times_played: 1 };
        assert!( catalog.apply_stats( "d1", &stats ) );
        assert!( !catalog.apply_stats( "missing", &stats ) );
        assert_eq!( catalog.most_played( 5 ).len(), 1 );
    }


    #[test]
    fn test_format_duration() {
        assert_eq!( format_duration( 0 ), "0:00" );
        assert_eq!( format_duration( 90_000 ), "1:30" );
        assert_eq!( format_duration( 180_999 ), "3:00" );
        assert_eq!( format_duration( 605_000 ), "10:05" );
    }
}
