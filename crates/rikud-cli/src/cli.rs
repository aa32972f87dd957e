//! Command-line argument parsing for Rikud.

use std::path::PathBuf;

use clap::Parser;


/// Rikud - Console player for the dance catalog.
#[derive( Parser, Debug )]
#[command( name = "rikud" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Catalog JSON file (overrides the saved setting).
    #[arg( short, long )]
    pub catalog: Option<PathBuf>,

    /// Base URL of the record store used for play statistics.
    #[arg( short, long )]
    pub endpoint: Option<String>,

    /// Start with the short version selected.
    #[arg( short, long )]
    pub short: bool,

    /// Keep play statistics in memory instead of recording them remotely.
    #[arg( long )]
    pub no_stats: bool,

    /// Entry id to start playing right away.
    pub entry: Option<String>,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_args() {
        let args = Args::parse_from([ "rikud", "--catalog", "dances.json", "--short", "d1" ]);
        assert_eq!( args.catalog, Some( PathBuf::from( "dances.json" ) ) );
        assert!( args.short );
        assert!( !args.no_stats );
        assert_eq!( args.entry.as_deref(), Some( "d1" ) );
    }
}
