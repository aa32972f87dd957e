//! Console command parsing.
//!
//! Commands are typed one per line, with or without a leading `/`, and are
//! executed by the front end against the [`crate::Coordinator`].

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::Variant;


/// Errors that can occur while parsing a command.
#[derive( Debug, Error )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed console command.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    // Catalog
    List,
    Recent,
    Top,

    // Playback
    Play { entry_id: String, variant: Option<Variant> },
    Pause,
    Resume,
    Toggle,
    Variant,
    Seek { position: Duration },

    // Volume
    Volume { level: u32 },
    Mute,

    Status,
    Help,
    Quit,
}


impl FromStr for Variant {
    type Err = CommandError;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" | "f" => Ok( Variant::Full ),
            "short" | "s" => Ok( Variant::Short ),
            _ => Err( CommandError::InvalidArgument(
                format!( "Invalid variant: '{}'. Use 'full' or 'short'", s )
            )),
        }
    }
}


impl Command {
    /// Parses one line of input. A leading `/` is ignored.
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let input = input.strip_prefix( '/' ).unwrap_or( input );
        let mut parts = input.splitn( 2, ' ' );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( |s| s.trim() ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            "list" | "ls" | "l" => Ok( Command::List ),
            "recent" | "rc" => Ok( Command::Recent ),
            "top" | "most" => Ok( Command::Top ),

            "play" | "p" => {
                let args = args
                    .ok_or_else( || CommandError::MissingArgument( "entry id".into() ) )?;
                let mut words = args.split_whitespace();
                let entry_id = words.next().unwrap_or_default().to_string();
                let variant = words.next().map( str::parse ).transpose()?;
                Ok( Command::Play { entry_id, variant } )
            }
            "pause" | "pa" => Ok( Command::Pause ),
            "resume" | "r" => Ok( Command::Resume ),
            "toggle" | "t" | "space" => Ok( Command::Toggle ),
            "variant" | "v" | "version" => Ok( Command::Variant ),
            "seek" | "sk" => {
                let time_str = args
                    .ok_or_else( || CommandError::MissingArgument( "time position".into() ) )?;
                let position = parse_time( time_str )?;
                Ok( Command::Seek { position } )
            }

            "vol" | "volume" => {
                let arg = args
                    .ok_or_else( || CommandError::MissingArgument( "volume level".into() ) )?;
                let level: u32 = arg.parse()
                    .map_err( |_| CommandError::InvalidArgument( format!( "Invalid volume: {}", arg ) ) )?;
                Ok( Command::Volume { level: level.min( 100 ) } )
            }
            "mute" | "m" => Ok( Command::Mute ),

            "status" | "st" => Ok( Command::Status ),
            "help" | "h" | "?" => Ok( Command::Help ),
            "quit" | "q" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }


    /// Returns a brief description of the command for help text.
    pub fn description( &self ) -> &'static str {
        match self {
            Command::List => "List the catalog",
            Command::Recent => "Recently played dances",
            Command::Top => "Most played dances",
            Command::Play { .. } => "Play a dance",
            Command::Pause => "Pause playback",
            Command::Resume => "Resume playback",
            Command::Toggle => "Toggle play/pause",
            Command::Variant => "Switch full/short version",
            Command::Seek { .. } => "Seek to position",
            Command::Volume { .. } => "Set volume (0-100)",
            Command::Mute => "Toggle mute",
            Command::Status => "Show what is playing",
            Command::Help => "Show help",
            Command::Quit => "Quit",
        }
    }
}


/// Parses a time string like "1:30" or "90" into a Duration.
pub fn parse_time( s: &str ) -> Result<Duration, CommandError> {
    let s = s.trim();

    if let Some(( min, sec )) = s.split_once( ':' ) {
        let minutes: u64 = min.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid minutes: {}", min ) ) )?;
        let seconds: u64 = sec.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) )?;
        if seconds >= 60 {
            return Err( CommandError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) );
        }
        let total = minutes
            .checked_mul( 60 )
            .and_then( |m| m.checked_add( seconds ) )
            .ok_or_else( || CommandError::InvalidArgument( format!( "Time out of range: {}", s ) ) )?;
        Ok( Duration::from_secs( total ) )
    } else {
        let seconds: u64 = s.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid time: {}", s ) ) )?;
        Ok( Duration::from_secs( seconds ) )
    }
}


/// Returns help text listing all available commands.
pub fn help_text() -> String {
    let groups = [
        ( "Catalog", vec![
            ( "list", "ls", Command::List ),
            ( "recent", "rc", Command::Recent ),
            ( "top", "most", Command::Top ),
        ]),
        ( "Playback", vec![
            ( "play <id> [full|short]", "p", Command::Play { entry_id: String::new(), variant: None } ),
            ( "pause", "pa", Command::Pause ),
            ( "resume", "r", Command::Resume ),
            ( "toggle", "t", Command::Toggle ),
            ( "variant", "v", Command::Variant ),
            ( "seek <m:ss|secs>", "sk", Command::Seek { position: Duration::ZERO } ),
        ]),
        ( "Volume", vec![
            ( "vol <0-100>", "volume", Command::Volume { level: 0 } ),
            ( "mute", "m", Command::Mute ),
        ]),
        ( "Other", vec![
            ( "status", "st", Command::Status ),
            ( "help", "?", Command::Help ),
            ( "quit", "q", Command::Quit ),
        ]),
    ];

    let mut lines = Vec::new();
    for ( title, commands ) in groups {
        if !lines.is_empty() {
            lines.push( String::new() );
        }
        lines.push( format!( "{}:", title ) );
        for ( usage, alias, command ) in commands {
            lines.push( format!( "  {:<24} {:<26} [{}]", usage, command.description(), alias ) );
        }
    }
    lines.join( "\n" )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_play() {
        let cmd = Command::parse( "play d1" ).unwrap();
        assert_eq!( cmd, Command::Play { entry_id: "d1".into(), variant: None } );
    }


    #[test]
    fn test_parse_play_with_variant() {
        let cmd = Command::parse( "/p d1 short" ).unwrap();
        assert_eq!( cmd, Command::Play { entry_id: "d1".into(), variant: Some( Variant::Short ) } );
    }


    #[test]
    fn test_parse_play_bad_variant() {
        let result = Command::parse( "play d1 medium" );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_seek() {
        let cmd = Command::parse( "seek 1:30" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 90 ) } );
    }


    #[test]
    fn test_parse_seek_seconds() {
        let cmd = Command::parse( "seek 45" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 45 ) } );
    }


    #[test]
    fn test_parse_seek_rejects_bad_seconds() {
        assert!( Command::parse( "seek 1:75" ).is_err() );
        assert!( Command::parse( "seek soon" ).is_err() );
    }


    #[test]
    fn test_parse_time_rejects_overflow() {
        let result = parse_time( "307445734561825861:00" );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );
        assert_eq!( parse_time( "0:59" ).unwrap(), Duration::from_secs( 59 ) );
    }


    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for line in [ "list", "play <id> [full|short]", "seek <m:ss|secs>", "vol <0-100>", "quit" ] {
            assert!( help.contains( line ), "missing {}", line );
        }
        assert!( help.contains( Command::Variant.description() ) );
        assert!( help.contains( Command::Mute.description() ) );
    }


    #[test]
    fn test_parse_volume_caps_at_100() {
        assert_eq!( Command::parse( "vol 150" ).unwrap(), Command::Volume { level: 100 } );
        assert!( matches!( Command::parse( "vol loud" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_aliases() {
        assert_eq!( Command::parse( "T" ).unwrap(), Command::Toggle );
        assert_eq!( Command::parse( "q" ).unwrap(), Command::Quit );
        assert_eq!( Command::parse( "  /variant  " ).unwrap(), Command::Variant );
    }


    #[test]
    fn test_parse_unknown() {
        let result = Command::parse( "foobar" );
        assert!( matches!( result, Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_parse_missing_arg() {
        assert!( matches!( Command::parse( "play" ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "vol" ), Err( CommandError::MissingArgument( _ ) ) ) );
    }
}
