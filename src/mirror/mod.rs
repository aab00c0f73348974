//! Mirror management for the remote origin network.
//!
//! - [`list`]: mirror records, the mirror-list parser and resource URL layout
//! - [`stats`]: rolling per-mirror health and the ordering derived from it
//! - [`racer`]: [`OriginRacer`], which fans requests out across mirrors

mod list;
mod racer;
mod stats;

pub use list::{Mirror, parse_mirror_list, resource_path};
pub use racer::{GetResult, HeadResult, MirrorStatus, OriginRacer, RacerStatus};
pub use stats::{MirrorStats, StatsTable};
