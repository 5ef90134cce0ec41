//! Settings file
//!
//! One TOML file configures every stage. All fields have defaults, so an
//! empty file is a valid (URL-less) configuration; validation catches
//! what would make the loop useless or the learner unstable.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use veil_agents::{
    default_topics, KeywordTopicDetector, LexiconClassifier, RefinerConfig, Refiner,
    RemoteClassifier, RemoteClassifierConfig, SharedBackend, SharedClassifier, TopicDefinition,
};
use veil_core::{
    CalibrationParams, Calibrator, FeedbackReward, FixedReward, QTableStore, RandomReward,
    RewardSource, NUM_ACTIONS,
};
use veil_tor::{
    load_targets, normalize_targets, Acquirer, BrowserlessRenderer, RenderConfig,
    SessionProvider, TorConfig,
};

use crate::{
    ElasticsearchSink, FanoutSink, JsonlFeed, JsonlSink, LogFileSink, MonitorConfig, Pipeline,
    SharedSink, Sources,
};

/// Settings that cannot be used
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error(transparent)]
    Calibration(#[from] veil_core::InvalidParams),

    #[error("Failed to set up {stage}: {message}")]
    Setup { stage: &'static str, message: String },
}

fn setup_err<E: std::fmt::Display>(stage: &'static str) -> impl FnOnce(E) -> ConfigError {
    move |e| ConfigError::Setup {
        stage,
        message: e.to_string(),
    }
}

/// `[tor]`: proxy, control port and optional rendering service
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TorSettings {
    #[serde(flatten)]
    pub proxy: TorConfig,
    /// Browserless base URL; unset disables the render fallback
    pub render_endpoint: Option<String>,
    pub render_token: Option<String>,
}

impl TorSettings {
    pub fn render_config(&self) -> Option<RenderConfig> {
        self.render_endpoint.as_deref().map(|endpoint| RenderConfig {
            token: self.render_token.clone(),
            ..RenderConfig::new(endpoint)
        })
    }
}

/// `[monitor]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub jitter_secs: u64,
    pub max_concurrent: usize,
    pub item_timeout_secs: u64,
    pub renew_every_cycles: u64,
    pub renew_on_blackout: bool,
    pub targets: Vec<String>,
    pub targets_file: Option<PathBuf>,
    /// JSON Lines feed polled instead of fetching targets
    pub feed_path: Option<PathBuf>,
    /// Shortest extract accepted before falling back to rendering
    pub min_text_chars: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            jitter_secs: 0,
            max_concurrent: 4,
            item_timeout_secs: 90,
            renew_every_cycles: 0,
            renew_on_blackout: true,
            targets: Vec::new(),
            targets_file: None,
            feed_path: None,
            min_text_chars: veil_tor::MIN_TEXT_CHARS,
        }
    }
}

impl MonitorSettings {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            jitter: Duration::from_secs(self.jitter_secs),
            max_concurrent: self.max_concurrent,
            item_timeout: Duration::from_secs(self.item_timeout_secs),
            renew_every_cycles: self.renew_every_cycles,
            renew_on_blackout: self.renew_on_blackout,
        }
    }
}

/// `[classifier]`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClassifierSettings {
    /// Weighted term list; built-in lexicon when no path is given
    Lexicon {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// HTTP model server
    Remote(RemoteClassifierConfig),
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self::Lexicon { path: None }
    }
}

/// `[topics]`: `[[topics.topic]]` entries replace the built-in set
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub topic: Vec<TopicDefinition>,
}

impl TopicSettings {
    pub fn definitions(&self) -> Vec<TopicDefinition> {
        if self.topic.is_empty() {
            default_topics()
        } else {
            self.topic.clone()
        }
    }
}

/// Reasoning service provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
    Openrouter,
    /// OpenAI-compatible local server at `base_url`
    Local,
}

/// `[refinement]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefinementSettings {
    pub enabled: bool,
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub refiner: RefinerConfig,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: Provider::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            refiner: RefinerConfig::default(),
        }
    }
}

/// Where calibration rewards come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    Random,
    Neutral,
    Feedback,
}

/// `[calibration]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub bins: usize,
    pub actions: Vec<f64>,
    /// Q-table file; `None` keeps the table in memory
    pub qtable_path: Option<PathBuf>,
    pub reward: RewardKind,
    /// Analyst verdicts for the feedback reward
    pub feedback_path: Option<PathBuf>,
    /// Fixed RNG seed for exploration and random rewards
    pub seed: Option<u64>,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        let params = CalibrationParams::default();
        Self {
            alpha: params.alpha,
            gamma: params.gamma,
            epsilon: params.epsilon,
            bins: params.bins,
            actions: params.actions.to_vec(),
            qtable_path: Some(PathBuf::from("qtable.json")),
            reward: RewardKind::Random,
            feedback_path: None,
            seed: None,
        }
    }
}

impl CalibrationSettings {
    pub fn params(&self) -> Result<CalibrationParams, ConfigError> {
        let actions: [f64; NUM_ACTIONS] = self.actions.as_slice().try_into().map_err(|_| {
            ConfigError::Invalid(format!(
                "calibration.actions needs exactly {} deltas, got {}",
                NUM_ACTIONS,
                self.actions.len()
            ))
        })?;

        let params = CalibrationParams {
            alpha: self.alpha,
            gamma: self.gamma,
            epsilon: self.epsilon,
            bins: self.bins,
            actions,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn reward_source(&self) -> Result<Arc<dyn RewardSource>, ConfigError> {
        let source: Arc<dyn RewardSource> = match self.reward {
            RewardKind::Random => match self.seed {
                Some(seed) => Arc::new(RandomReward::seeded(seed)),
                None => Arc::new(RandomReward::new()),
            },
            RewardKind::Neutral => Arc::new(FixedReward::neutral()),
            RewardKind::Feedback => {
                let path = self.feedback_path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("feedback reward needs calibration.feedback_path".into())
                })?;
                Arc::new(FeedbackReward::load(path).map_err(setup_err("feedback reward"))?)
            }
        };
        Ok(source)
    }

    pub fn calibrator(&self) -> Result<Calibrator, ConfigError> {
        let params = self.params()?;
        let reward = self.reward_source()?;

        let calibrator = match &self.qtable_path {
            Some(path) => Calibrator::open(params, reward, QTableStore::new(path)),
            None => Calibrator::in_memory(params, reward),
        };

        Ok(match self.seed {
            Some(seed) => calibrator.with_seed(seed),
            None => calibrator,
        })
    }
}

/// `[sink]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub log_path: Option<PathBuf>,
    pub jsonl_path: Option<PathBuf>,
    pub elasticsearch_url: Option<String>,
    pub elasticsearch_index: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            log_path: Some(PathBuf::from("threat_scores.log")),
            jsonl_path: None,
            elasticsearch_url: None,
            elasticsearch_index: "darkweb-threats".to_string(),
        }
    }
}

impl SinkSettings {
    /// Build every configured sink; the index is created if missing
    pub async fn build(&self) -> Result<SharedSink, ConfigError> {
        let mut sinks: Vec<SharedSink> = Vec::new();

        if let Some(path) = &self.log_path {
            sinks.push(Arc::new(LogFileSink::new(path)));
        }
        if let Some(path) = &self.jsonl_path {
            sinks.push(Arc::new(JsonlSink::new(path)));
        }
        if let Some(url) = &self.elasticsearch_url {
            let sink = ElasticsearchSink::new(url, &self.elasticsearch_index)
                .map_err(setup_err("search index"))?;
            sink.ensure_index().await.map_err(setup_err("search index"))?;
            sinks.push(Arc::new(sink));
        }

        if sinks.is_empty() {
            return Err(ConfigError::Invalid("no sink configured".into()));
        }
        if sinks.len() == 1 {
            return Ok(sinks.remove(0));
        }
        Ok(Arc::new(FanoutSink::new(sinks)))
    }
}

/// The whole settings file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tor: TorSettings,
    pub monitor: MonitorSettings,
    pub classifier: ClassifierSettings,
    pub topics: TopicSettings,
    pub refinement: RefinementSettings,
    pub calibration: CalibrationSettings,
    pub sink: SinkSettings,
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a file; a missing file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parameter checks that do not touch the network or disk
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.calibration.params()?;

        if self.monitor.max_concurrent == 0 {
            return Err(ConfigError::Invalid("monitor.max_concurrent must be at least 1".into()));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor.interval_secs must be at least 1".into()));
        }
        if self.monitor.item_timeout_secs == 0 {
            return Err(ConfigError::Invalid("monitor.item_timeout_secs must be at least 1".into()));
        }
        if self.tor.proxy.timeout_secs == 0 {
            return Err(ConfigError::Invalid("tor.timeout_secs must be at least 1".into()));
        }
        if !(0.0..=10.0).contains(&self.refinement.refiner.threshold) {
            return Err(ConfigError::Invalid(format!(
                "refinement.threshold {} outside [0, 10]",
                self.refinement.refiner.threshold
            )));
        }
        Ok(())
    }

    /// Inline targets merged with the targets file, normalized and deduplicated
    pub fn resolve_targets(&self) -> Result<Vec<String>, ConfigError> {
        let mut raw = self.monitor.targets.clone();
        if let Some(path) = &self.monitor.targets_file {
            let loaded = load_targets(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            raw.extend(loaded);
        }
        Ok(normalize_targets(raw))
    }

    /// Feed if one is configured, else the target list. No sources is fatal.
    pub fn sources(&self) -> Result<Sources, ConfigError> {
        if let Some(path) = &self.monitor.feed_path {
            return Ok(Sources::Feed(Arc::new(JsonlFeed::new(path))));
        }

        let targets = self.resolve_targets()?;
        if targets.is_empty() {
            return Err(ConfigError::Invalid(
                "no sources: set monitor.targets, monitor.targets_file or monitor.feed_path".into(),
            ));
        }
        Ok(Sources::Urls(targets))
    }

    pub fn classifier(&self) -> Result<SharedClassifier, ConfigError> {
        let classifier: SharedClassifier = match &self.classifier {
            ClassifierSettings::Lexicon { path: Some(path) } => {
                Arc::new(LexiconClassifier::load(path).map_err(setup_err("classifier"))?)
            }
            ClassifierSettings::Lexicon { path: None } => Arc::new(LexiconClassifier::with_defaults()),
            ClassifierSettings::Remote(config) => {
                Arc::new(RemoteClassifier::new(config.clone()).map_err(setup_err("classifier"))?)
            }
        };
        Ok(classifier)
    }

    /// Assemble the scoring chain.
    ///
    /// `backend` is the reasoning service; without one refinement is skipped.
    pub async fn build_pipeline(
        &self,
        sessions: Arc<SessionProvider>,
        backend: Option<SharedBackend>,
    ) -> Result<Pipeline, ConfigError> {
        self.validate()?;

        let mut acquirer = Acquirer::new(sessions).with_min_chars(self.monitor.min_text_chars);
        if let Some(render) = self.tor.render_config() {
            info!("Render fallback via {}", render.endpoint);
            let renderer = BrowserlessRenderer::new(render).map_err(setup_err("renderer"))?;
            acquirer = acquirer.with_renderer(Arc::new(renderer));
        }

        let topics = KeywordTopicDetector::new(self.topics.definitions());
        let calibrator = self.calibration.calibrator()?;
        let sink = self.sink.build().await?;

        let mut pipeline = Pipeline::new(
            Arc::new(acquirer),
            self.classifier()?,
            Arc::new(topics),
            Arc::new(calibrator),
            sink,
        );

        match backend {
            Some(backend) if self.refinement.enabled => {
                let refiner = Refiner::new(backend, self.refinement.refiner.clone());
                info!(
                    "Refinement enabled: {} at threshold {}",
                    refiner.model_name(),
                    refiner.threshold()
                );
                pipeline = pipeline.with_refiner(refiner);
            }
            _ => info!("Refinement disabled"),
        }

        Ok(pipeline)
    }
}

/// Written by `init-config`
pub const DEFAULT_SETTINGS: &str = r#"# Veilwatch settings. Every field is optional.

[tor]
socks_addr = "socks5h://127.0.0.1:9050"
control_addr = "127.0.0.1:9051"
# control_password = "secret"
timeout_secs = 30
# Headless browser used when a page extracts to almost no text
# render_endpoint = "http://127.0.0.1:3000"
# render_token = "token"

[monitor]
interval_secs = 60
jitter_secs = 0
max_concurrent = 4
item_timeout_secs = 90
# Renew the Tor identity every N cycles (0 = never)
renew_every_cycles = 0
renew_on_blackout = true
min_text_chars = 50
targets = []
# targets_file = "targets.txt"
# Poll a JSON Lines feed of {source, timestamp, body} instead of fetching
# feed_path = "feed.jsonl"

[classifier]
kind = "lexicon"
# path = "lexicon.toml"
# kind = "remote"
# endpoint = "http://127.0.0.1:8000/score"

# [[topics.topic]]
# name = "drugs"
# keywords = ["cocaine", "mdma"]

[refinement]
enabled = true
# anthropic, openai, openrouter or local
provider = "anthropic"
model = "claude-sonnet-4-20250514"
threshold = 6.0
timeout_secs = 30

[calibration]
alpha = 0.1
gamma = 0.9
epsilon = 0.1
bins = 20
actions = [-0.5, 0.0, 0.5]
qtable_path = "qtable.json"
# random, neutral or feedback
reward = "random"
# feedback_path = "verdicts.json"

[sink]
log_path = "threat_scores.log"
# jsonl_path = "threat_scores.jsonl"
# elasticsearch_url = "http://127.0.0.1:9200"
elasticsearch_index = "darkweb-threats"
"#;
