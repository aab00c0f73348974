//! Mirror racing with sticky affinity.
//!
//! Requests for a resource first go to the mirror that last served it. When
//! there is no such mirror, or it fails, the top-ranked mirrors are raced
//! and the first success wins. Losing attempts are never aborted once they
//! have started: they run to completion in detached tasks so their outcome
//! still lands in the health table.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::list::{Mirror, parse_mirror_list};
use super::stats::StatsTable;
use crate::config::RacerConfig;
use crate::io::{ResourceHead, Transport, Upstream};

/// Outcome of a successful HEAD through the racer
#[derive(Debug, Clone)]
pub struct HeadResult {
    pub url: String,
    pub content_length: u64,
    pub head: ResourceHead,
    pub mirror: Mirror,
}

/// Outcome of a successful GET through the racer
#[derive(Debug, Clone)]
pub struct GetResult {
    pub body: Vec<u8>,
    pub url: String,
    pub mirror: Mirror,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Head,
    Get(Option<(u64, u64)>),
}

enum Response {
    Head(ResourceHead),
    Body(Vec<u8>),
}

struct Attempt {
    mirror: Mirror,
    url: String,
    result: Result<Response>,
}

/// When a spawned attempt should start
enum Start {
    Now,
    /// After `delay`, or as soon as `early` fires; never if `abort` fires first
    Staggered {
        delay: Duration,
        early: CancellationToken,
        abort: CancellationToken,
    },
}

/// Fetches resources from a ranked set of mirrors.
pub struct OriginRacer {
    transport: Arc<dyn Transport>,
    config: RacerConfig,
    mirrors: OnceCell<Vec<Mirror>>,
    stats: Arc<StatsTable>,
    sticky: DashMap<String, Mirror>,
}

impl OriginRacer {
    pub fn new(transport: Arc<dyn Transport>, config: RacerConfig) -> Self {
        let stats = Arc::new(StatsTable::new(config.ewma_alpha, config.failure_window()));
        Self {
            transport,
            config,
            mirrors: OnceCell::new(),
            stats,
            sticky: DashMap::new(),
        }
    }

    /// Create a racer over a fixed mirror set, skipping the mirror list download
    pub fn with_mirrors(
        transport: Arc<dyn Transport>,
        config: RacerConfig,
        mirrors: Vec<Mirror>,
    ) -> Self {
        let racer = Self::new(transport, config);
        // A fresh OnceCell always accepts its first value
        let _ = racer.mirrors.set(mirrors);
        racer
    }

    /// Load the mirror list once.
    ///
    /// Tries the well-known list URL, then the locally cached copy, then the
    /// built-in default origin. Never fails; later calls are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        self.mirror_list().await;
        Ok(())
    }

    async fn mirror_list(&self) -> &[Mirror] {
        self.mirrors
            .get_or_init(|| self.load_mirror_list())
            .await
            .as_slice()
    }

    async fn load_mirror_list(&self) -> Vec<Mirror> {
        let url = &self.config.mirror_list_url;
        match self
            .transport
            .get(url, None, self.config.mirror_list_timeout())
            .await
        {
            Ok(body) => {
                let text = String::from_utf8_lossy(&body);
                let mirrors = parse_mirror_list(&text);
                if !mirrors.is_empty() {
                    info!(count = mirrors.len(), "loaded mirror list from {}", url);
                    self.store_mirror_list(&text).await;
                    return mirrors;
                }
                warn!("mirror list from {} contained no usable mirrors", url);
            }
            Err(e) => warn!("failed to download mirror list from {}: {:#}", url, e),
        }

        if let Some(path) = &self.config.mirror_list_cache {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => {
                    let mirrors = parse_mirror_list(&text);
                    if !mirrors.is_empty() {
                        info!(count = mirrors.len(), "using cached mirror list {}", path.display());
                        return mirrors;
                    }
                }
                Err(e) => debug!("no cached mirror list at {}: {}", path.display(), e),
            }
        }

        warn!("falling back to default origin {}", self.config.default_origin);
        vec![Mirror::from_url(&self.config.default_origin)]
    }

    async fn store_mirror_list(&self, text: &str) {
        let Some(path) = &self.config.mirror_list_cache else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("cannot create {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, text).await {
            warn!("cannot cache mirror list at {}: {}", path.display(), e);
        }
    }

    /// All known mirrors, healthiest first
    pub async fn ordered_mirrors(&self) -> Vec<Mirror> {
        let mirrors = self.mirror_list().await;
        self.stats.order(mirrors)
    }

    /// The mirror that last served `resource_id`, if any
    pub fn sticky_mirror(&self, resource_id: &str) -> Option<Mirror> {
        self.sticky.get(resource_id).map(|m| m.clone())
    }

    fn clear_sticky(&self, resource_id: &str, mirror: &Mirror) {
        self.sticky
            .remove_if(resource_id, |_, current| current.base_url == mirror.base_url);
    }

    /// HEAD a resource, preferring its sticky mirror
    pub async fn head_with_fallback(&self, resource_id: &str) -> Result<HeadResult> {
        self.initialize().await?;

        if let Some(sticky) = self.sticky_mirror(resource_id) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.spawn_attempt(
                sticky.clone(),
                resource_id,
                Request::Head,
                self.config.sticky_timeout(),
                Start::Now,
                tx,
            );
            match first_success(rx, |_| {}).await {
                Ok(attempt) => return head_result(attempt),
                Err(errors) => {
                    debug!(
                        resource_id,
                        "sticky mirror {} failed HEAD: {}",
                        sticky.base_url,
                        errors.join("; ")
                    );
                    self.clear_sticky(resource_id, &sticky);
                }
            }
        }

        let attempt = self.race_top_n(resource_id, Request::Head).await?;
        head_result(attempt)
    }

    /// GET a resource (optionally an inclusive byte range).
    ///
    /// With a sticky mirror, it is asked immediately and up to
    /// `backup_count` alternates join after the stagger delay, or at once if
    /// the sticky mirror fails first. If that whole group fails the sticky
    /// entry is dropped and a full race follows.
    pub async fn get_with_fallback(
        &self,
        resource_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<GetResult> {
        self.initialize().await?;
        let request = Request::Get(range);

        if let Some(sticky) = self.sticky_mirror(resource_id) {
            let abort = CancellationToken::new();
            let _abort_guard = abort.clone().drop_guard();
            let early = CancellationToken::new();

            let (tx, rx) = mpsc::unbounded_channel();
            self.spawn_attempt(
                sticky.clone(),
                resource_id,
                request,
                self.config.sticky_timeout(),
                Start::Now,
                tx.clone(),
            );

            let backups: Vec<Mirror> = self
                .ordered_mirrors()
                .await
                .into_iter()
                .filter(|m| m.base_url != sticky.base_url)
                .take(self.config.backup_count)
                .collect();
            for mirror in backups {
                self.spawn_attempt(
                    mirror,
                    resource_id,
                    request,
                    self.config.race_timeout(),
                    Start::Staggered {
                        delay: self.config.stagger(),
                        early: early.clone(),
                        abort: abort.clone(),
                    },
                    tx.clone(),
                );
            }
            drop(tx);

            let on_failure = |failed: &Mirror| {
                if failed.base_url == sticky.base_url {
                    early.cancel();
                }
            };
            match first_success(rx, on_failure).await {
                Ok(attempt) => {
                    if attempt.mirror.base_url != sticky.base_url {
                        debug!(
                            resource_id,
                            "backup mirror {} replaced sticky {}",
                            attempt.mirror.base_url,
                            sticky.base_url
                        );
                        self.sticky
                            .insert(resource_id.to_string(), attempt.mirror.clone());
                    }
                    return get_result(attempt);
                }
                Err(errors) => {
                    warn!(
                        resource_id,
                        "sticky mirror {} and backups failed: {}",
                        sticky.base_url,
                        errors.join("; ")
                    );
                    self.clear_sticky(resource_id, &sticky);
                }
            }
        }

        let attempt = self.race_top_n(resource_id, request).await?;
        get_result(attempt)
    }

    /// Race the `race_width` healthiest mirrors, then walk the rest one by one.
    async fn race_top_n(&self, resource_id: &str, request: Request) -> Result<Attempt> {
        let ordered = self.ordered_mirrors().await;
        if ordered.is_empty() {
            bail!("No mirrors available for resource {}", resource_id);
        }
        let width = self.config.race_width.clamp(1, ordered.len());
        let (top, rest) = ordered.split_at(width);

        let (tx, rx) = mpsc::unbounded_channel();
        for mirror in top {
            self.spawn_attempt(
                mirror.clone(),
                resource_id,
                request,
                self.config.race_timeout(),
                Start::Now,
                tx.clone(),
            );
        }
        drop(tx);

        let mut errors = match first_success(rx, |_| {}).await {
            Ok(attempt) => return Ok(self.make_sticky(resource_id, attempt)),
            Err(errors) => errors,
        };

        for mirror in rest {
            let (tx, rx) = mpsc::unbounded_channel();
            self.spawn_attempt(
                mirror.clone(),
                resource_id,
                request,
                self.config.race_timeout(),
                Start::Now,
                tx,
            );
            match first_success(rx, |_| {}).await {
                Ok(attempt) => return Ok(self.make_sticky(resource_id, attempt)),
                Err(e) => errors.extend(e),
            }
        }

        Err(anyhow!(
            "All {} mirrors failed for resource {}: {}",
            ordered.len(),
            resource_id,
            errors.last().map(String::as_str).unwrap_or("no attempts made")
        ))
    }

    fn make_sticky(&self, resource_id: &str, attempt: Attempt) -> Attempt {
        debug!(resource_id, "mirror {} won the race", attempt.mirror.base_url);
        self.sticky
            .insert(resource_id.to_string(), attempt.mirror.clone());
        attempt
    }

    /// Launch one request in a detached task.
    ///
    /// The task records its outcome in the health table before reporting
    /// back, whether or not anyone is still listening.
    fn spawn_attempt(
        &self,
        mirror: Mirror,
        resource_id: &str,
        request: Request,
        timeout: Duration,
        start: Start,
        tx: mpsc::UnboundedSender<Attempt>,
    ) {
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        let url = mirror.url_for(resource_id);

        tokio::spawn(async move {
            if let Start::Staggered {
                delay,
                early,
                abort,
            } = start
            {
                tokio::select! {
                    _ = abort.cancelled() => return,
                    _ = early.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                if abort.is_cancelled() {
                    return;
                }
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, perform(&*transport, &url, request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("{} timed out after {:?}", url, timeout)),
            };
            stats.record_outcome(&mirror.base_url, result.is_ok(), started.elapsed());
            if let Err(e) = &result {
                warn!("mirror {} failed: {:#}", mirror.base_url, e);
            }

            let _ = tx.send(Attempt {
                mirror,
                url,
                result,
            });
        });
    }

    /// Read-only snapshot for debug displays
    pub fn status(&self) -> RacerStatus {
        let mirrors = self.mirrors.get().map(Vec::as_slice).unwrap_or_default();
        let ordered = self.stats.order(mirrors);

        let mirrors = ordered
            .into_iter()
            .map(|mirror| {
                let stats = self.stats.get(&mirror.base_url).unwrap_or_default();
                let sticky_for = self
                    .sticky
                    .iter()
                    .filter(|e| e.value().base_url == mirror.base_url)
                    .count();
                MirrorStatus {
                    recently_failed: self.stats.recently_failed(&mirror.base_url),
                    base_url: mirror.base_url,
                    provider: mirror.provider,
                    location: mirror.location,
                    successes: stats.successes,
                    failures: stats.failures,
                    avg_response_ms: stats.avg_response_ms,
                    sticky_for,
                }
            })
            .collect::<Vec<_>>();

        RacerStatus {
            initialized: self.mirrors.initialized(),
            mirror_count: mirrors.len(),
            sticky_count: self.sticky.len(),
            mirrors,
        }
    }
}

async fn perform(
    transport: &dyn Transport,
    url: &str,
    request: Request,
    timeout: Duration,
) -> Result<Response> {
    match request {
        Request::Head => transport.head(url, timeout).await.map(Response::Head),
        Request::Get(range) => transport.get(url, range, timeout).await.map(Response::Body),
    }
}

/// Wait for the first successful attempt, collecting error messages.
///
/// `on_failure` runs for every failed attempt as it arrives.
async fn first_success(
    mut rx: mpsc::UnboundedReceiver<Attempt>,
    mut on_failure: impl FnMut(&Mirror),
) -> std::result::Result<Attempt, Vec<String>> {
    let mut errors = Vec::new();
    while let Some(attempt) = rx.recv().await {
        match &attempt.result {
            Ok(_) => return Ok(attempt),
            Err(e) => {
                on_failure(&attempt.mirror);
                errors.push(format!("{}: {:#}", attempt.mirror.base_url, e));
            }
        }
    }
    Err(errors)
}

fn head_result(attempt: Attempt) -> Result<HeadResult> {
    match attempt.result? {
        Response::Head(head) => Ok(HeadResult {
            url: attempt.url,
            content_length: head.size,
            head,
            mirror: attempt.mirror,
        }),
        Response::Body(_) => bail!("unexpected body in reply to HEAD {}", attempt.url),
    }
}

fn get_result(attempt: Attempt) -> Result<GetResult> {
    match attempt.result? {
        Response::Body(body) => Ok(GetResult {
            body,
            url: attempt.url,
            mirror: attempt.mirror,
        }),
        Response::Head(_) => bail!("unexpected HEAD reply to GET {}", attempt.url),
    }
}

#[async_trait]
impl Upstream for OriginRacer {
    async fn head(&self, resource_id: &str) -> Result<ResourceHead> {
        Ok(self.head_with_fallback(resource_id).await?.head)
    }

    async fn get_range(&self, resource_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        Ok(self
            .get_with_fallback(resource_id, Some((start, end)))
            .await?
            .body)
    }
}

/// Racer state for a debug or telemetry panel
#[derive(Debug, Clone, Serialize)]
pub struct RacerStatus {
    pub initialized: bool,
    pub mirror_count: usize,
    pub sticky_count: usize,
    /// Mirrors in current health order
    pub mirrors: Vec<MirrorStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub base_url: String,
    pub provider: String,
    pub location: String,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: Option<f64>,
    pub recently_failed: bool,
    /// Number of resources currently stuck to this mirror
    pub sticky_for: usize,
}
