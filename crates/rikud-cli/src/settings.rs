//! Application settings management
//!
//! Persists the catalog location, record store access, and the last used
//! volume and variant between runs.

use std::fs;
use std::path::{ Path, PathBuf };

use anyhow::{ Context, Result };
use serde::{ Deserialize, Serialize };

use rikud_core::Variant;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Catalog JSON file
    pub catalog_path: Option<PathBuf>,

    /// Base URL of the record store. Plays are only counted locally without it.
    pub record_endpoint: Option<String>,

    pub record_api_key: Option<String>,

    /// Variant selected on startup
    pub default_variant: Variant,

    /// Volume from 0.0 to 1.0
    pub volume: f32,

    /// How often playback position is reported, in milliseconds
    pub status_interval_ms: u64,

    /// Log filter used when RUST_LOG is not set
    pub log_level: String,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_path: None,
            record_endpoint: None,
            record_api_key: None,
            default_variant: Variant::Full,
            volume: 1.0,
            status_interval_ms: 250,
            log_level: "warn".into(),
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "rikud" ).join( "settings.json" ) )
    }


    /// Loads settings from disk. A missing file yields defaults; an
    /// unreadable or malformed one is an error for the caller to report.
    pub fn load() -> Result<Self> {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Ok( Self::default() ),
        }
    }


    fn load_from( path: &Path ) -> Result<Self> {
        if !path.exists() {
            return Ok( Self::default() );
        }

        let contents = fs::read_to_string( path )
            .with_context( || format!( "Failed to read settings {}", path.display() ) )?;
        Self::from_json( &contents )
            .with_context( || format!( "Ignoring malformed settings {}", path.display() ) )
    }


    fn from_json( contents: &str ) -> Result<Self> {
        Ok( serde_json::from_str( contents )? )
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return,
        };

        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( &path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_missing_fields_use_defaults() {
        let settings = Settings::from_json( r#"{ "volume": 0.5, "default_variant": "short" }"# ).unwrap();
        assert_eq!( settings.volume, 0.5 );
        assert_eq!( settings.default_variant, Variant::Short );
        assert_eq!( settings.status_interval_ms, 250 );
        assert_eq!( settings.log_level, "warn" );
    }


    #[test]
    fn test_malformed_is_an_error() {
        assert!( Settings::from_json( "{ not json" ).is_err() );
        assert!( Settings::from_json( r#"{ "volume": "loud" }"# ).is_err() );
    }


    #[test]
    fn test_load_reports_bad_file() {
        let dir = std::env::temp_dir().join( format!( "rikud-settings-{}", std::process::id() ) );
        fs::create_dir_all( &dir ).unwrap();

        let missing = dir.join( "missing.json" );
        assert_eq!( Settings::load_from( &missing ).unwrap(), Settings::default() );

        let broken = dir.join( "broken.json" );
        fs::write( &broken, "{ \"volume\": " ).unwrap();
        let err = Settings::load_from( &broken ).unwrap_err();
        assert!( format!( "{:#}", err ).contains( "broken.json" ) );

        let _ = fs::remove_dir_all( &dir );
    }
}
