//! Line-oriented console front end
//!
//! Executes parsed commands against the coordinator and prints a
//! now-playing line whenever the track, variant, or play state changes.

use std::sync::{ Arc, Mutex, MutexGuard };

use rikud_core::{
    command::help_text,
    format_duration, Catalog, CatalogEntry, Command, Coordinator, PlaybackState, Subscription, Variant,
};


/// How many entries `recent` and `top` show.
const LISTING_LIMIT: usize = 10;


/// What the input loop should do after a command.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Flow {
    Continue,
    Quit,
}


/// Fields whose change triggers a now-playing line.
#[derive( Debug, Clone, PartialEq )]
struct NowPlayingKey {
    track_id: Option<String>,
    variant: Variant,
    is_playing: bool,
}


impl From<&PlaybackState> for NowPlayingKey {
    fn from( state: &PlaybackState ) -> Self {
        Self {
            track_id: state.current_track_id.clone(),
            variant: state.variant,
            is_playing: state.is_playing,
        }
    }
}


pub struct Console {
    coordinator: Coordinator,
    catalog: Arc<Mutex<Catalog>>,
}


impl Console {
    pub fn new( coordinator: Coordinator, catalog: Arc<Mutex<Catalog>> ) -> Self {
        Self { coordinator, catalog }
    }


    fn catalog( &self ) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Prints a now-playing line on every relevant state change.
    pub fn watch( &self ) -> Subscription {
        let catalog = Arc::clone( &self.catalog );
        let last = Mutex::new( None::<NowPlayingKey> );

        self.coordinator.subscribe( move |state| {
            let key = NowPlayingKey::from( state );
            {
                let mut last = last.lock().unwrap_or_else( |e| e.into_inner() );
                if last.as_ref() == Some( &key ) {
                    return;
                }
                *last = Some( key );
            }
            let catalog = catalog.lock().unwrap_or_else( |e| e.into_inner() );
            println!( "{}", now_playing_line( state, &catalog ) );
        })
    }


    /// Runs one command. Playback errors are printed, never fatal.
    pub async fn execute( &self, command: Command ) -> Flow {
        let result = match command {
            Command::List => {
                let catalog = self.catalog();
                print_entries( catalog.entries().iter(), "Catalog is empty" );
                Ok(())
            }
            Command::Recent => {
                let catalog = self.catalog();
                print_entries( catalog.recently_played( LISTING_LIMIT ).into_iter(), "Nothing played yet" );
                Ok(())
            }
            Command::Top => {
                let catalog = self.catalog();
                print_entries( catalog.most_played( LISTING_LIMIT ).into_iter(), "Nothing played yet" );
                Ok(())
            }

            Command::Play { entry_id, variant } => return self.play( &entry_id, variant ).await,
            Command::Pause => self.coordinator.pause().await,
            Command::Resume => self.coordinator.resume().await,
            Command::Toggle => self.coordinator.toggle_playback().await,
            Command::Variant => self.coordinator.toggle_variant().await.map( |variant| {
                println!( "Variant: {}", variant );
            }),
            Command::Seek { position } => {
                let ms = i64::try_from( position.as_millis() ).unwrap_or( i64::MAX );
                self.coordinator.seek_to( ms ).await
            }

            Command::Volume { level } => self.coordinator.set_volume( level as f32 / 100.0 ).await,
            Command::Mute => self.coordinator.toggle_mute().await.map( |volume| {
                println!( "Volume: {}%", volume_percent( volume ) );
            }),

            Command::Status => {
                let state = self.coordinator.snapshot();
                println!( "{}", status_line( &state, &self.catalog() ) );
                Ok(())
            }
            Command::Help => {
                println!( "{}", help_text() );
                Ok(())
            }
            Command::Quit => return Flow::Quit,
        };

        if let Err( e ) = result {
            println!( "Error: {}", e );
        }
        Flow::Continue
    }


    /// Plays an entry by id, in `variant` or the currently selected one.
    pub async fn play( &self, entry_id: &str, variant: Option<Variant> ) -> Flow {
        let entry = self.catalog().get( entry_id ).cloned();
        let Some( entry ) = entry else {
            println!( "No such dance: {}", entry_id );
            return Flow::Continue;
        };

        let variant = variant.unwrap_or( self.coordinator.snapshot().variant );
        if let Err( e ) = self.coordinator.play_item( &entry, variant ).await {
            println!( "Error: {}", e );
        }
        Flow::Continue
    }
}


fn print_entries<'a, I>( entries: I, empty: &str )
where
    I: Iterator<Item = &'a CatalogEntry>,
{
    let mut any = false;
    for entry in entries {
        any = true;
        println!( "{}", entry_line( entry ) );
    }
    if !any {
        println!( "{}", empty );
    }
}


fn entry_line( entry: &CatalogEntry ) -> String {
    let short = if entry.audio_url( Variant::Short ).is_some() { " +short" } else { "" };
    format!(
        "  {:<12} {:<32} {:>6}  played {}x{}",
        entry.id,
        entry.display_name(),
        format_duration( entry.nominal_duration_ms() ),
        entry.times_played,
        short,
    )
}


fn volume_percent( volume: f32 ) -> u32 {
    ( volume.clamp( 0.0, 1.0 ) * 100.0 ).round() as u32
}


fn track_name( state: &PlaybackState, catalog: &Catalog ) -> Option<String> {
    let id = state.current_track_id.as_deref()?;
    Some( catalog.get( id ).map( |e| e.display_name().to_string() ).unwrap_or_else( || id.to_string() ) )
}


fn now_playing_line( state: &PlaybackState, catalog: &Catalog ) -> String {
    match track_name( state, catalog ) {
        Some( name ) => {
            let verb = if state.is_playing { "Playing" } else { "Paused" };
            format!( "{}: {} [{}]", verb, name, state.variant )
        }
        None => format!( "Stopped [{}]", state.variant ),
    }
}


fn status_line( state: &PlaybackState, catalog: &Catalog ) -> String {
    format!(
        "{}  {} / {}  vol {}%",
        now_playing_line( state, catalog ),
        format_duration( state.position_ms ),
        format_duration( state.duration_ms ),
        volume_percent( state.volume ),
    )
}


#[cfg( test )]
mod tests {
    use super::*;


    fn catalog() -> Catalog {
        let mut entry = CatalogEntry::new( "d1", Some( "a" ), Some( "b" ), 185.0 );
        entry.name = "Hora".into();
        Catalog::new( vec![ entry ] ).unwrap()
    }


    #[test]
    fn test_now_playing_line() {
        let state = PlaybackState {
            current_track_id: Some( "d1".into() ),
            is_playing: true,
            variant: Variant::Short,
            ..PlaybackState::default()
        };
        assert_eq!( now_playing_line( &state, &catalog() ), "Playing: Hora [short]" );
        assert_eq!( now_playing_line( &PlaybackState::default(), &catalog() ), "Stopped [full]" );
    }


    #[test]
    fn test_status_line() {
        let state = PlaybackState {
            current_track_id: Some( "d1".into() ),
            position_ms: 61_000,
            duration_ms: 185_000,
            volume: 0.25,
            ..PlaybackState::default()
        };
        assert_eq!( status_line( &state, &catalog() ), "Paused: Hora [full]  1:01 / 3:05  vol 25%" );
    }


    #[test]
    fn test_unknown_track_uses_id() {
        let state = PlaybackState {
            current_track_id: Some( "x9".into() ),
            ..PlaybackState::default()
        };
        assert_eq!( now_playing_line( &state, &catalog() ), "Paused: x9 [full]" );
    }


    #[test]
    fn test_entry_line_marks_short() {
        let line = entry_line( catalog().get( "d1" ).unwrap() );
        assert!( line.contains( "Hora" ) );
        assert!( line.contains( "3:05" ) );
        assert!( line.ends_with( "+short" ) );
    }
}
