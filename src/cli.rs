use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chunkread")]
#[command(version)]
#[command(about = "Read remote texts a chunk of words at a time", long_about = None)]
#[command(after_help = "Examples:\n  \
  chunkread read 1342 --percent 50          show 250 words from the middle of book 1342\n  \
  chunkread read 1342 --forward 3 -q        show the first four chunks, text only\n  \
  chunkread read notes.txt --chunk-size 50  page a local file\n  \
  chunkread cache prune --keep 5            keep the five most recently read books")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cache directory (overrides the configuration)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// More log output (-vv => trace)
    #[arg(short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print chunks of a resource or a local text file
    Read(ReadArgs),

    /// Load the mirror list and show mirror health
    Mirrors {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or manage the byte-range cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Resource id (e.g. 1342) or path to a local text file
    #[arg(value_name = "ID|PATH")]
    pub source: String,

    /// Where to start, as a percentage of the text
    #[arg(long, default_value_t = 0.0)]
    pub percent: f64,

    /// Words per chunk
    #[arg(long, value_name = "N")]
    pub chunk_size: Option<usize>,

    /// Move forward K chunks after the first one
    #[arg(long, value_name = "K", default_value_t = 0)]
    pub forward: usize,

    /// Then move back K chunks
    #[arg(long, value_name = "K", default_value_t = 0)]
    pub back: usize,

    /// First byte of the readable text
    #[arg(long, value_name = "B")]
    pub start_byte: Option<u64>,

    /// End of the readable text (exclusive)
    #[arg(long, value_name = "B")]
    pub end_byte: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Show cache coverage for one resource, or for all cached resources
    Stats {
        #[arg(value_name = "ID")]
        id: Option<String>,
    },

    /// Delete all but the most recently used resources
    Prune {
        /// Number of resources to keep
        #[arg(long, value_name = "N")]
        keep: usize,
    },

    /// Delete everything cached for a resource
    Invalidate {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Check a resource against its origin now
    Validate {
        #[arg(value_name = "ID")]
        id: String,
    },
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    /// Log filter implied by `-v`/`-q`, if any were given
    pub fn log_level(&self) -> Option<&'static str> {
        match (self.verbose, self.quiet) {
            (_, q) if q > 1 => Some("error"),
            (_, 1) => Some("warn"),
            (0, _) => None,
            (1, _) => Some("debug"),
            _ => Some("trace"),
        }
    }
}

impl ReadArgs {
    /// Whether the source names an existing local file rather than a resource id
    pub fn is_local_file(&self) -> bool {
        Path::new(&self.source).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_with_global_flags() {
        let cli = Cli::try_parse_from([
            "chunkread", "read", "1342", "--percent", "50", "--forward", "2", "-vv",
            "--cache-dir", "/tmp/c",
        ])
        .unwrap();
        assert_eq!(cli.log_level(), Some("trace"));
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/c")));
        match cli.command {
            Command::Read(args) => {
                assert_eq!(args.source, "1342");
                assert_eq!(args.percent, 50.0);
                assert_eq!(args.forward, 2);
                assert!(!args.is_local_file());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_cache_subcommands() {
        let cli = Cli::try_parse_from(["chunkread", "-q", "cache", "prune", "--keep", "3"]).unwrap();
        assert!(cli.is_quiet());
        assert_eq!(cli.log_level(), Some("warn"));
        assert!(matches!(cli.command, Command::Cache(CacheCommand::Prune { keep: 3 })));

        let cli = Cli::try_parse_from(["chunkread", "cache", "stats"]).unwrap();
        assert_eq!(cli.log_level(), None);
        assert!(matches!(cli.command, Command::Cache(CacheCommand::Stats { id: None })));
    }
}
