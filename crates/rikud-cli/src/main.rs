//! Rikud CLI - Console player for the dance catalog

mod cli;
mod console;
mod settings;

use std::sync::{ Arc, Mutex };
use std::time::Duration;

use anyhow::{ Context, Result };
use clap::Parser;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use rikud_core::{
    Catalog, Command, Coordinator, EngineConfig, LocalEngine, LocalRecorder, PlayRecorder, RestRecorder, Variant,
};

use cli::Args;
use console::{ Console, Flow };
use settings::Settings;


/// Timeout for a single record-play request.
const RECORD_TIMEOUT: Duration = Duration::from_secs( 10 );


/// Logs to stderr so they don't interleave with console output on stdout.
/// RUST_LOG wins over the configured level.
fn init_logging( level: &str ) {
    let filter = EnvFilter::try_from_default_env()
        .or_else( |_| EnvFilter::try_new( level ) )
        .unwrap_or_else( |_| EnvFilter::new( "warn" ) );

    tracing_subscriber::fmt()
        .with_env_filter( filter )
        .with_writer( std::io::stderr )
        .init();
}


/// Picks the remote record store when one is configured, local counting otherwise.
fn build_recorder( args: &Args, settings: &Settings, catalog: &Catalog ) -> Arc<dyn PlayRecorder> {
    let endpoint = args.endpoint.as_deref().or( settings.record_endpoint.as_deref() );

    if let ( Some( endpoint ), false ) = ( endpoint, args.no_stats ) {
        match RestRecorder::new( endpoint, settings.record_api_key.as_deref(), RECORD_TIMEOUT ) {
            Ok( recorder ) => {
                tracing::info!( "Recording plays at {}", recorder.rpc_url() );
                return Arc::new( recorder );
            }
            Err( e ) => tracing::warn!( "Record store unavailable, counting plays locally: {}", e ),
        }
    }

    let counts = catalog.entries().iter().map( |e| ( e.id.clone(), e.times_played ) );
    Arc::new( LocalRecorder::with_counts( counts ) )
}


/// Folds recorded play statistics back into the catalog listings.
fn spawn_stats_listener( coordinator: &Coordinator, catalog: Arc<Mutex<Catalog>> ) {
    let mut updates = coordinator.stats_updates();
    tokio::spawn( async move {
        loop {
            match updates.recv().await {
                Ok( update ) => {
                    let mut catalog = catalog.lock().unwrap_or_else( |e| e.into_inner() );
                    if !catalog.apply_stats( &update.entry_id, &update.stats ) {
                        tracing::debug!( "Stats for unknown entry {}", update.entry_id );
                    }
                }
                Err( RecvError::Lagged( skipped ) ) => {
                    tracing::warn!( "Skipped {} stats updates", skipped );
                }
                Err( RecvError::Closed ) => break,
            }
        }
    });
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = Settings::load();
    let mut settings = loaded.as_ref().cloned().unwrap_or_default();
    init_logging( &settings.log_level );
    if let Err( e ) = &loaded {
        tracing::warn!( "{:#}", e );
    }

    let catalog_path = args.catalog.clone()
        .or_else( || settings.catalog_path.clone() )
        .context( "No catalog given; pass --catalog or set catalog_path in the settings file" )?;
    let catalog = Catalog::load( &catalog_path )
        .with_context( || format!( "Failed to load catalog {}", catalog_path.display() ) )?;
    settings.catalog_path = Some( catalog_path );

    let engine = LocalEngine::new( EngineConfig {
        status_interval: Duration::from_millis( settings.status_interval_ms.max( 50 ) ),
        ..EngineConfig::default()
    })?;
    let recorder = build_recorder( &args, &settings, &catalog );
    let coordinator = Coordinator::create( Arc::new( engine ), recorder );

    let catalog = Arc::new( Mutex::new( catalog ) );
    spawn_stats_listener( &coordinator, Arc::clone( &catalog ) );

    coordinator.set_volume( settings.volume ).await?;
    let variant = if args.short { Variant::Short } else { settings.default_variant };
    if variant != coordinator.snapshot().variant {
        coordinator.toggle_variant().await?;
    }

    let console = Console::new( coordinator.clone(), catalog );
    let _watch = console.watch();
    println!( "Type 'help' for commands." );

    if let Some( entry_id ) = args.entry.as_deref() {
        console.play( entry_id, None ).await;
    }

    let mut lines = BufReader::new( tokio::io::stdin() ).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some( line ) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse( &line ) {
            Ok( command ) => {
                if console.execute( command ).await == Flow::Quit {
                    break;
                }
            }
            Err( e ) => println!( "{}", e ),
        }
    }

    let state = coordinator.snapshot();
    if state.volume > 0.0 {
        settings.volume = state.volume;
    }
    settings.default_variant = state.variant;
    settings.save();

    coordinator.dispose().await;
    if coordinator.stats_failures() > 0 {
        tracing::warn!( "{} plays could not be recorded", coordinator.stats_failures() );
    }
    Ok(())
}
