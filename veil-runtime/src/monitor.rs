//! Monitoring Loop
//!
//! Drives the pipeline on a fixed cadence:
//! IDLE -> FETCHING -> SCORING -> PERSISTING -> SLEEPING -> FETCHING ...
//! - Items within a cycle run concurrently on a bounded pool
//! - A failing item never aborts the cycle
//! - Timestamped feeds are deduplicated against the last processed item
//! - Shutdown is cooperative: in-flight items finish, no new cycle starts

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use veil_core::{LastProcessedMarker, ScoreRecord};
use veil_tor::{extract_text, SessionProvider};

use crate::{FeedSource, Pipeline, PipelineError};

/// Loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Fetching,
    Scoring,
    Persisting,
    Sleeping,
}

/// Where each cycle's items come from
#[derive(Clone)]
pub enum Sources {
    /// Fixed URLs polled every cycle
    Urls(Vec<String>),
    /// Feed of pre-timestamped items
    Feed(Arc<dyn FeedSource>),
}

/// Fatal monitor setup errors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("No sources configured: add targets or a feed")]
    NoSources,
}

/// Loop timing and concurrency
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Upper bound of random extra sleep
    pub jitter: Duration,
    pub max_concurrent: usize,
    /// Bound on acquiring one item, render fallback included
    pub item_timeout: Duration,
    /// Renew identity every N cycles (0 = never)
    pub renew_every_cycles: u64,
    /// Renew identity after a cycle where every fetch failed
    pub renew_on_blackout: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::ZERO,
            max_concurrent: 4,
            item_timeout: Duration::from_secs(90),
            renew_every_cycles: 0,
            renew_on_blackout: true,
        }
    }
}

/// What happened in one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Items that entered the chain
    pub attempted: usize,
    pub acquired: usize,
    pub scored: usize,
    pub persisted: usize,
    /// Items dropped at any stage
    pub failed: usize,
    /// Feed items discarded as already processed
    pub skipped_seen: usize,
}

impl CycleReport {
    /// Every acquisition failed
    pub fn is_blackout(&self) -> bool {
        self.attempted > 0 && self.acquired == 0
    }

    /// Records scored but never written
    pub fn lost(&self) -> usize {
        self.scored.saturating_sub(self.persisted)
    }
}

/// Text ready for scoring
struct Candidate {
    source: String,
    fetched_at: DateTime<Utc>,
    text: String,
}

/// The monitoring loop and its run-scoped state
pub struct Monitor {
    pipeline: Arc<Pipeline>,
    sources: Sources,
    config: MonitorConfig,
    sessions: Option<Arc<SessionProvider>>,
    marker: LastProcessedMarker,
    state: MonitorState,
    cycle: u64,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Monitor {
    pub fn new(pipeline: Arc<Pipeline>, sources: Sources, config: MonitorConfig) -> Result<Self, MonitorError> {
        if let Sources::Urls(urls) = &sources {
            if urls.is_empty() {
                return Err(MonitorError::NoSources);
            }
        }

        Ok(Self {
            pipeline,
            sources,
            config,
            sessions: None,
            marker: LastProcessedMarker::new(),
            state: MonitorState::Idle,
            cycle: 0,
            shutdown: None,
        })
    }

    /// Session provider to renew identities through
    pub fn with_sessions(mut self, sessions: Arc<SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Start from a known dedup position
    pub fn with_marker(mut self, marker: LastProcessedMarker) -> Self {
        self.marker = marker;
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn marker(&self) -> LastProcessedMarker {
        self.marker
    }

    fn transition(&mut self, next: MonitorState) {
        debug!("Monitor {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run one fetch/score/persist cycle
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        self.transition(MonitorState::Fetching);
        let candidates = match self.sources.clone() {
            Sources::Urls(urls) => self.fetch_urls(&urls, &mut report).await,
            Sources::Feed(feed) => self.poll_feed(feed.as_ref(), &mut report).await,
        };
        report.acquired = candidates.len();

        self.transition(MonitorState::Scoring);
        let records = self.score_all(candidates, &mut report).await;
        report.scored = records.len();

        self.transition(MonitorState::Persisting);
        for record in &records {
            match self.pipeline.persist(record).await {
                Ok(()) => report.persisted += 1,
                Err(_) => report.failed += 1,
            }
        }

        report
    }

    async fn fetch_urls(&self, urls: &[String], report: &mut CycleReport) -> Vec<Candidate> {
        let pipeline = self.pipeline.clone();
        let item_timeout = self.config.item_timeout;
        let shutdown = self.shutdown.clone();

        let results: Vec<Option<Result<Candidate, PipelineError>>> = stream::iter(urls.iter().cloned())
            .map(|url| {
                let pipeline = pipeline.clone();
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                        return None;
                    }
                    let fetched = match tokio::time::timeout(item_timeout, pipeline.acquire(&url)).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Acquisition(veil_tor::AcquisitionError::Timeout {
                            url: url.clone(),
                            secs: item_timeout.as_secs(),
                        })),
                    };
                    Some(fetched.map(|page| Candidate {
                        source: url,
                        fetched_at: page.fetched_at,
                        text: page.text,
                    }))
                }
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        let mut candidates = Vec::new();
        for result in results.into_iter().flatten() {
            report.attempted += 1;
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    warn!("Acquisition failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        candidates
    }

    async fn poll_feed(&mut self, feed: &dyn FeedSource, report: &mut CycleReport) -> Vec<Candidate> {
        let items = match feed.poll().await {
            Ok(items) => items,
            Err(e) => {
                warn!("Feed poll failed: {}", e);
                return Vec::new();
            }
        };

        let total = items.len();
        let fresh = self.marker.filter_new(items, |item| item.timestamp);
        report.skipped_seen = total - fresh.len();
        report.attempted = fresh.len();

        self.marker.advance(fresh.iter().map(|item| item.timestamp));

        fresh
            .into_iter()
            .filter_map(|item| {
                let text = extract_text(&item.body);
                if text.is_empty() {
                    debug!("Empty feed item from {}", item.source);
                    report.failed += 1;
                    return None;
                }
                Some(Candidate {
                    source: item.source,
                    fetched_at: item.timestamp,
                    text,
                })
            })
            .collect()
    }

    async fn score_all(&self, candidates: Vec<Candidate>, report: &mut CycleReport) -> Vec<ScoreRecord> {
        let pipeline = self.pipeline.clone();

        let results: Vec<Result<ScoreRecord, PipelineError>> = stream::iter(candidates)
            .map(|candidate| {
                let pipeline = pipeline.clone();
                async move {
                    pipeline
                        .score(&candidate.source, candidate.fetched_at, candidate.text)
                        .await
                }
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        let mut records = Vec::new();
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Scoring failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        records
    }

    /// Whether to rotate the Tor identity after this cycle.
    ///
    /// Blackouts only count when fetching over Tor; feed items never touch it.
    fn renewal_due(&self, report: &CycleReport) -> bool {
        let scheduled = self.config.renew_every_cycles > 0
            && report.cycle % self.config.renew_every_cycles == 0;
        let blackout = self.config.renew_on_blackout
            && matches!(self.sources, Sources::Urls(_))
            && report.is_blackout();

        if blackout {
            warn!("Every fetch failed in cycle {}, renewing identity", report.cycle);
        }
        scheduled || blackout
    }

    async fn maybe_renew(&self, report: &CycleReport) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        if self.renewal_due(report) {
            sessions.renew_identity().await;
        }
    }

    fn next_pause(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.interval;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.config.interval + Duration::from_millis(extra)
    }

    /// Run until `shutdown` flips to true
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown.clone());
        let mut shutdown = shutdown;

        let source_desc = match &self.sources {
            Sources::Urls(urls) => format!("{} URLs", urls.len()),
            Sources::Feed(_) => "feed".to_string(),
        };
        info!(
            "Monitor starting: {} every {:?}, {} workers",
            source_desc, self.config.interval, self.config.max_concurrent
        );

        while !self.stop_requested() {
            let report = self.run_cycle().await;
            info!(
                "Cycle {}: {} attempted, {} acquired, {} scored, {} persisted, {} failed, {} already seen",
                report.cycle,
                report.attempted,
                report.acquired,
                report.scored,
                report.persisted,
                report.failed,
                report.skipped_seen
            );
            if report.lost() > 0 {
                match &self.sources {
                    Sources::Urls(_) => error!(
                        "Cycle {} lost {} scored records; they will be rescored next cycle",
                        report.cycle,
                        report.lost()
                    ),
                    Sources::Feed(_) => error!(
                        "Cycle {} lost {} scored feed records; they are behind the marker and will not be retried",
                        report.cycle,
                        report.lost()
                    ),
                }
            }

            if self.stop_requested() {
                break;
            }
            self.maybe_renew(&report).await;

            self.transition(MonitorState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.next_pause()) => {}
                _ = stop_signal(&mut shutdown) => {}
            }
        }

        self.transition(MonitorState::Idle);
        info!("Monitor stopped after {} cycles", self.cycle);
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn stop_signal(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeedError, FeedItem, PersistenceError, PersistenceSink};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use veil_agents::{ClassificationError, ThreatClassifier, TopicDetector};
    use veil_core::{CalibrationParams, Calibrator, FixedReward, TopicLabel};
    use veil_tor::{Acquire, AcquisitionError, Page};

    struct StubAcquirer;

    #[async_trait]
    impl Acquire for StubAcquirer {
        async fn acquire(&self, url: &str) -> Result<Page, AcquisitionError> {
            if url.contains("hang") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if url.contains("down") {
                return Err(AcquisitionError::Status {
                    url: url.to_string(),
                    status: 503,
                });
            }
            Ok(Page {
                url: url.to_string(),
                fetched_at: Utc::now(),
                text: format!("listing at {url} with plenty of words in it"),
                rendered: false,
            })
        }
    }

    struct FixedClassifier;

    #[async_trait]
    impl ThreatClassifier for FixedClassifier {
        async fn score(&self, text: &str) -> Result<f64, ClassificationError> {
            if text.is_empty() {
                return Err(ClassificationError::InvalidInput("empty text".into()));
            }
            Ok(3.0)
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct General;

    impl TopicDetector for General {
        fn detect(&self, _text: &str) -> TopicLabel {
            TopicLabel::general()
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<ScoreRecord>>,
    }

    #[async_trait]
    impl PersistenceSink for MemorySink {
        async fn append(&self, record: &ScoreRecord) -> Result<(), PersistenceError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "memory"
        }
    }

    /// Sink whose backing store is always down
    #[derive(Default)]
    struct BrokenSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceSink for BrokenSink {
        async fn append(&self, _record: &ScoreRecord) -> Result<(), PersistenceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Http("connection refused".to_string()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    struct StaticFeed(Vec<FeedItem>);

    #[async_trait]
    impl FeedSource for StaticFeed {
        async fn poll(&self) -> Result<Vec<FeedItem>, FeedError> {
            Ok(self.0.clone())
        }
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn pipeline(sink: Arc<dyn PersistenceSink>) -> Arc<Pipeline> {
        let params = CalibrationParams {
            epsilon: 0.0,
            ..Default::default()
        };
        let calibrator = Calibrator::in_memory(params, Arc::new(FixedReward::neutral()));
        Arc::new(Pipeline::new(
            Arc::new(StubAcquirer),
            Arc::new(FixedClassifier),
            Arc::new(General),
            Arc::new(calibrator),
            sink,
        ))
    }

    fn fast() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_empty_targets() {
        let sink = Arc::new(MemorySink::default());
        let result = Monitor::new(pipeline(sink), Sources::Urls(vec![]), fast());
        assert!(matches!(result, Err(MonitorError::NoSources)));
    }

    #[tokio::test]
    async fn test_failing_url_does_not_abort_cycle() {
        let sink = Arc::new(MemorySink::default());
        let urls = vec![
            "http://alpha.onion".to_string(),
            "http://down.onion".to_string(),
            "http://beta.onion".to_string(),
        ];
        let mut monitor = Monitor::new(pipeline(sink.clone()), Sources::Urls(urls), fast()).unwrap();

        let report = monitor.run_cycle().await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.acquired, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.is_blackout());
        assert_eq!(sink.records.lock().unwrap().len(), 2);
        assert_eq!(monitor.state(), MonitorState::Persisting);
    }

    #[tokio::test]
    async fn test_all_failures_is_blackout() {
        let sink = Arc::new(MemorySink::default());
        let urls = vec!["http://down.onion".to_string()];
        let mut monitor = Monitor::new(pipeline(sink), Sources::Urls(urls), fast()).unwrap();

        let report = monitor.run_cycle().await;
        assert!(report.is_blackout());
    }

    #[tokio::test]
    async fn test_feed_skips_seen_items() {
        let sink = Arc::new(MemorySink::default());
        let items = (1..=3)
            .map(|m| FeedItem {
                source: format!("feed-{m}"),
                timestamp: t(m),
                body: format!("<p>post number {m}</p>"),
            })
            .collect();
        let feed = Arc::new(StaticFeed(items));
        let mut monitor = Monitor::new(pipeline(sink.clone()), Sources::Feed(feed), fast())
            .unwrap()
            .with_marker(LastProcessedMarker::at(t(2)));

        let report = monitor.run_cycle().await;

        assert_eq!(report.skipped_seen, 2);
        assert_eq!(report.persisted, 1);
        assert_eq!(monitor.marker().get(), Some(t(3)));
        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].url, "feed-3");
        assert_eq!(records[0].text, "post number 3");

        drop(records);
        let again = monitor.run_cycle().await;
        assert_eq!(again.attempted, 0);
        assert_eq!(again.skipped_seen, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sink = Arc::new(MemorySink::default());
        let urls = vec!["http://alpha.onion".to_string()];
        let config = MonitorConfig {
            interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut monitor = Monitor::new(pipeline(sink.clone()), Sources::Urls(urls), config).unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            monitor.run(rx).await;
            monitor
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let monitor = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_pause_includes_jitter_bound() {
        let sink = Arc::new(MemorySink::default());
        let config = MonitorConfig {
            interval: Duration::from_secs(10),
            jitter: Duration::from_secs(5),
            ..Default::default()
        };
        let monitor =
            Monitor::new(pipeline(sink), Sources::Urls(vec!["http://a.onion".into()]), config).unwrap();

        for _ in 0..20 {
            let pause = monitor.next_pause();
            assert!(pause >= Duration::from_secs(10));
            assert!(pause <= Duration::from_secs(15));
        }
    }

    #[tokio::test]
    async fn test_hanging_fetch_does_not_stall_cycle() {
        let sink = Arc::new(MemorySink::default());
        let urls = vec![
            "http://hang.onion".to_string(),
            "http://alpha.onion".to_string(),
            "http://beta.onion".to_string(),
            "http://gamma.onion".to_string(),
        ];
        let config = MonitorConfig {
            item_timeout: Duration::from_millis(300),
            max_concurrent: 2,
            ..fast()
        };
        let mut monitor = Monitor::new(pipeline(sink.clone()), Sources::Urls(urls), config).unwrap();

        let started = std::time::Instant::now();
        let report = monitor.run_cycle().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.attempted, 4);
        assert_eq!(report.acquired, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.persisted, 3);
        assert_eq!(sink.records.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_loop_running() {
        let sink = Arc::new(BrokenSink::default());
        let urls = vec!["http://alpha.onion".to_string()];
        let mut monitor = Monitor::new(pipeline(sink.clone()), Sources::Urls(urls), fast()).unwrap();

        for _ in 0..2 {
            let report = monitor.run_cycle().await;
            assert_eq!(report.scored, 1);
            assert_eq!(report.persisted, 0);
            assert_eq!(report.failed, 1);
            assert_eq!(report.lost(), 1);
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            monitor.run(rx).await;
            monitor
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let monitor = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(sink.attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_feed_marker_passes_unpersisted_items() {
        let sink = Arc::new(BrokenSink::default());
        let feed = Arc::new(StaticFeed(vec![FeedItem {
            source: "feed-1".to_string(),
            timestamp: t(1),
            body: "<p>stolen database for sale</p>".to_string(),
        }]));
        let mut monitor = Monitor::new(pipeline(sink), Sources::Feed(feed), fast()).unwrap();

        let report = monitor.run_cycle().await;
        assert_eq!(report.lost(), 1);
        assert_eq!(monitor.marker().get(), Some(t(1)));

        let again = monitor.run_cycle().await;
        assert_eq!(again.attempted, 0);
        assert_eq!(again.skipped_seen, 1);
    }

    #[tokio::test]
    async fn test_blackout_renewal_only_for_urls() {
        let sink = Arc::new(MemorySink::default());
        let blank = Arc::new(StaticFeed(vec![FeedItem {
            source: "feed-1".to_string(),
            timestamp: t(1),
            body: "<script>var x = 1;</script>".to_string(),
        }]));
        let mut feed_monitor = Monitor::new(pipeline(sink.clone()), Sources::Feed(blank), fast()).unwrap();
        let report = feed_monitor.run_cycle().await;
        assert!(report.is_blackout());
        assert!(!feed_monitor.renewal_due(&report));

        let urls = vec!["http://down.onion".to_string()];
        let mut url_monitor = Monitor::new(pipeline(sink), Sources::Urls(urls), fast()).unwrap();
        let report = url_monitor.run_cycle().await;
        assert!(url_monitor.renewal_due(&report));
    }

    #[test]
    fn test_renewal_cadence() {
        let sink = Arc::new(MemorySink::default());
        let config = MonitorConfig {
            renew_every_cycles: 3,
            ..fast()
        };
        let monitor =
            Monitor::new(pipeline(sink), Sources::Urls(vec!["http://a.onion".into()]), config).unwrap();

        let due: Vec<bool> = (1..=6)
            .map(|cycle| {
                monitor.renewal_due(&CycleReport {
                    cycle,
                    attempted: 1,
                    acquired: 1,
                    ..Default::default()
                })
            })
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }
}
