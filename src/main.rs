//! Main entry point for the chunkread CLI application.
//!
//! This binary pages through remote texts (fetched from the mirror network
//! through the sparse cache) or local text files, and manages the cache.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use chunkread::cache::SparseCache;
use chunkread::cli::{CacheCommand, Command, ReadArgs};
use chunkread::{
    Boundaries, ByteSource, CachedFetcher, Cli, Config, HttpTransport, LocalFile, Navigator,
    OriginRacer, Position, telemetry,
};

/// Application entry point.
///
/// Parses command-line arguments, applies them on top of the configuration
/// file and dispatches to the subcommand handler.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    telemetry::init_logging(&config.logging);

    match &cli.command {
        Command::Read(args) if args.is_local_file() => {
            let source = Arc::new(LocalFile::open(Path::new(&args.source))?);
            read(source, &args.source, args, &config, &cli).await
        }
        Command::Read(args) => {
            let (_, cache) = remote_stack(&config)?;
            let fetcher = Arc::new(CachedFetcher::new(
                args.source.clone(),
                cache,
                config.fetcher.clone(),
            ));
            read(fetcher.clone(), &args.source, args, &config, &cli).await?;

            // Display transfer statistics for remote sources
            if !cli.is_quiet() {
                let stats = fetcher.get_stats();
                eprintln!(
                    "\n{} requests, {} from network, {} from cache ({:.0}% cached)",
                    stats.requests,
                    format_size(stats.bytes_from_network),
                    format_size(stats.bytes_from_disk),
                    stats.cache_efficiency
                );
            }
            Ok(())
        }
        Command::Mirrors { json } => {
            let (racer, _) = remote_stack(&config)?;
            racer.initialize().await?;
            print_mirrors(&racer, *json)
        }
        Command::Cache(command) => {
            let (_, cache) = remote_stack(&config)?;
            run_cache_command(&cache, command).await
        }
    }
}

/// Load the configuration file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = dir.clone();
        config.racer.mirror_list_cache = Some(dir.join("mirrors.txt"));
    }
    if let Some(level) = cli.log_level() {
        config.logging.level = Some(level.to_string());
    }
    if cli.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

/// Build the racer and the cache on top of it.
fn remote_stack(config: &Config) -> Result<(Arc<OriginRacer>, Arc<SparseCache>)> {
    let transport = Arc::new(HttpTransport::new()?);
    let racer = Arc::new(OriginRacer::new(transport, config.racer.clone()));
    let cache = Arc::new(SparseCache::new(racer.clone(), config.cache.clone()));
    Ok((racer, cache))
}

/// Page through a source according to the `read` arguments.
///
/// Prints the starting chunk, then `--forward` chunks ahead, then `--back`
/// chunks back. Stops early at either end of the text.
async fn read<S: ByteSource + ?Sized + 'static>(
    source: Arc<S>,
    name: &str,
    args: &ReadArgs,
    config: &Config,
    cli: &Cli,
) -> Result<()> {
    let size = source.size().await?;
    let boundaries = Boundaries::new(
        args.start_byte.unwrap_or(0),
        args.end_byte.unwrap_or(size).min(size),
    );

    let mut navigator_config = config.navigator.clone();
    if let Some(chunk_size) = args.chunk_size {
        navigator_config.chunk_size = chunk_size;
    }
    let mut navigator = Navigator::new(source, name, boundaries, navigator_config);

    let position = navigator.go_to_percent(args.percent).await?;
    print_position(&position, cli.is_quiet());

    for _ in 0..args.forward {
        match navigator.move_forward().await? {
            Some(position) => print_position(&position, cli.is_quiet()),
            None => break,
        }
    }
    for _ in 0..args.back {
        match navigator.move_backward().await? {
            Some(position) => print_position(&position, cli.is_quiet()),
            None => break,
        }
    }
    Ok(())
}

fn print_position(position: &Position, quiet: bool) {
    if !quiet {
        eprintln!(
            "--- word {} | bytes {}-{} | {:.1}%{} ---",
            position.word_index,
            position.byte_start,
            position.byte_end,
            position.percent,
            if position.is_near_end { " | near end" } else { "" }
        );
    }
    println!("{}", position.text());
}

fn print_mirrors(racer: &OriginRacer, json: bool) -> Result<()> {
    let status = racer.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "{:>5}  {:>5}  {:>8}  {:>6}  Mirror",
        "Ok", "Fail", "Avg ms", "Sticky"
    );
    println!("{}", "-".repeat(70));
    for mirror in &status.mirrors {
        let avg = mirror
            .avg_response_ms
            .map(|ms| format!("{:.0}", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:>5}  {:>8}  {:>6}  {}{}",
            mirror.successes,
            mirror.failures,
            avg,
            mirror.sticky_for,
            mirror.base_url,
            if mirror.location.is_empty() {
                String::new()
            } else {
                format!(" ({})", mirror.location)
            }
        );
    }
    println!("{}", "-".repeat(70));
    println!("{} mirrors", status.mirror_count);
    Ok(())
}

/// Run one `cache` subcommand.
async fn run_cache_command(cache: &SparseCache, command: &CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Stats { id } => {
            let ids = match id {
                Some(id) => vec![id.clone()],
                None => cache.resources().await?,
            };
            println!(
                "{:>12}  {:>8}  {:>8}  {:>7}  Resource",
                "Size", "Blocks", "Cached", "Cover"
            );
            println!("{}", "-".repeat(60));
            for id in ids {
                match cache.book_stats(&id).await? {
                    Some(stats) => println!(
                        "{:>12}  {:>8}  {:>8}  {:>6.1}%  {}",
                        format_size(stats.file_size),
                        stats.total_blocks,
                        stats.cached_blocks,
                        stats.coverage_percent,
                        id
                    ),
                    None => println!("{:>12}  {:>8}  {:>8}  {:>7}  {}", "-", "-", "-", "-", id),
                }
            }
        }
        CacheCommand::Prune { keep } => {
            let removed = cache.prune_by_lru(*keep).await?;
            for id in &removed {
                println!("removed: {}", id);
            }
            println!("{} resources removed", removed.len());
        }
        CacheCommand::Invalidate { id } => {
            cache.invalidate(id).await?;
            println!("invalidated: {}", id);
        }
        CacheCommand::Validate { id } => {
            if cache.force_validation(id).await? {
                println!("{}: cache is current", id);
            } else {
                println!("{}: cache was stale and has been cleared", id);
            }
        }
    }
    Ok(())
}

/// Format a byte size into a human-readable string.
///
/// Automatically selects the appropriate unit (bytes, KB, MB, GB)
/// based on the size magnitude.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
