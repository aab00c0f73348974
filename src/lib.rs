//! # chunkread
//!
//! Remote content access and navigation for large plain-text resources.
//!
//! Texts are read a chunk of words at a time. Bytes come from a set of
//! mirrors raced against each other, pass through a sparse on-disk cache that
//! only ever downloads the blocks actually read, and are cut into chunks by
//! a navigator that can page forward and back byte-exactly.
//!
//! ## Layers
//!
//! - [`mirror::OriginRacer`]: mirror list, health-ranked racing, sticky mirrors
//! - [`cache::SparseCache`]: block bitmap cache with gap coalescing and lazy revalidation
//! - [`fetcher::CachedFetcher`]: one resource as a retrying [`ByteSource`]
//! - [`navigator::Navigator`]: word chunks, history and prefetch
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunkread::{CachedFetcher, Config, HttpTransport, Navigator, OriginRacer, SparseCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let racer = Arc::new(OriginRacer::new(Arc::new(HttpTransport::new()?), config.racer));
//!     let cache = Arc::new(SparseCache::new(racer, config.cache));
//!     let fetcher = Arc::new(CachedFetcher::new("1342", cache, config.fetcher));
//!
//!     let mut navigator = Navigator::for_source(fetcher, "1342", config.navigator).await?;
//!     let position = navigator.go_to_percent(50.0).await?;
//!     println!("{}", position.text());
//!
//!     if let Some(next) = navigator.move_forward().await? {
//!         println!("{}", next.text());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod fetcher;
pub mod io;
pub mod mirror;
pub mod navigator;
pub mod telemetry;

pub use cache::SparseCache;
pub use cli::Cli;
pub use config::Config;
pub use fetcher::{CachedFetcher, FetchStats};
pub use io::{ByteSource, HttpTransport, LocalFile, ResourceHead, Transport, Upstream};
pub use mirror::{Mirror, OriginRacer};
pub use navigator::{Boundaries, Navigator, Position};
