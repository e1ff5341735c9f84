use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::PravahError;
use crate::types::Partition;

/// Tuning for the hybrid retrieval engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Offset constant in `1 / (rank + k + 1)`.
    pub rrf_k: f64,
    /// Weight of the vector list in the fused score; lexical gets `1 - alpha`.
    pub alpha: f64,
    /// Cosine similarity a vector hit needs to pass the filter on its own.
    pub cosine_threshold: f64,
    /// Lexical score a hit needs to pass the filter on its own, in index units.
    pub fts_threshold: f64,
    /// Top-N requested from each of the vector and lexical queries.
    pub candidates_per_query: usize,
    /// Cap on fused results kept per partition.
    pub per_partition_limit: usize,
    /// Results returned after the global merge.
    pub top_k: usize,
    /// Exact (flat) rather than approximate vector search.
    pub exact: bool,
    pub partition_timeout: Duration,
    /// Partitions searched when a query does not name any.
    pub partitions: Vec<Partition>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            alpha: 0.8,
            cosine_threshold: 0.60,
            fts_threshold: 1.5,
            candidates_per_query: 20,
            per_partition_limit: 20,
            top_k: 3,
            exact: true,
            partition_timeout: Duration::from_secs(30),
            partitions: vec![Partition::new("primary", "analyzed-events")],
        }
    }
}

impl RetrievalConfig {
    /// Cosine threshold rescaled to the `[0, 1]` vector score range.
    pub fn vector_threshold(&self) -> f64 {
        (1.0 + self.cosine_threshold) / 2.0
    }
}

/// Stage-2 synthesis: canonical records folded into synthesized events.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisConfig {
    /// Partition the synthesized events are searched in and mirrored to.
    pub partition: Partition,
    pub top_k: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            partition: Partition::new("synthesis", "event_store"),
            top_k: 5,
        }
    }
}

/// Timing and batch sizes for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub stage1_page_size: usize,
    pub stage1_record_cap: usize,
    pub stage2_batch_size: usize,
    pub ack_poll_interval: Duration,
    pub cooldown: Duration,
    pub stage2_ack_timeout: Duration,
    pub max_stage2_attempts: u32,
    pub job_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage1_page_size: 20,
            stage1_record_cap: 100,
            stage2_batch_size: 5,
            ack_poll_interval: Duration::from_secs(2),
            cooldown: Duration::from_secs(120),
            stage2_ack_timeout: Duration::from_secs(600),
            max_stage2_attempts: 3,
            job_deadline: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub judge_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub llm: LlmConfig,

    // Observer (orchestrator + callback API)
    pub observer_host: String,
    pub observer_port: u16,

    // Analyze worker
    pub analyze_host: String,
    pub analyze_port: u16,

    /// Where workers send acknowledgments.
    pub callback_url: String,
    /// Push endpoints the bus delivers each topic to.
    pub stage1_topic_url: String,
    pub stage2_topic_url: String,

    pub retrieval: RetrievalConfig,
    pub synthesis: SynthesisConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, PravahError> {
        let retrieval_defaults = RetrievalConfig::default();
        let pipeline_defaults = PipelineConfig::default();

        let partitions = match env::var("KB_PARTITIONS") {
            Ok(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Partition::from_str)
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => retrieval_defaults.partitions.clone(),
        };
        if partitions.is_empty() {
            return Err(PravahError::Config(
                "KB_PARTITIONS must name at least one partition".to_string(),
            ));
        }

        let observer_port = parse_env("OBSERVER_PORT", 8080u16)?;

        let retrieval = RetrievalConfig {
            rrf_k: parse_env("RRF_K", retrieval_defaults.rrf_k)?,
            alpha: parse_env("RRF_ALPHA", retrieval_defaults.alpha)?,
            cosine_threshold: parse_env(
                "KB_SEARCH_COSINE_SIM_THR",
                retrieval_defaults.cosine_threshold,
            )?,
            fts_threshold: parse_env("FTS_SEARCH_SIM_THR", retrieval_defaults.fts_threshold)?,
            candidates_per_query: parse_env(
                "RETRIEVAL_CANDIDATES",
                retrieval_defaults.candidates_per_query,
            )?,
            per_partition_limit: parse_env(
                "RETRIEVAL_PARTITION_LIMIT",
                retrieval_defaults.per_partition_limit,
            )?,
            top_k: parse_env("RETRIEVAL_TOP_K", retrieval_defaults.top_k)?,
            exact: parse_env("RETRIEVAL_EXACT", retrieval_defaults.exact)?,
            partition_timeout: Duration::from_secs(parse_env(
                "PARTITION_TIMEOUT_SECS",
                retrieval_defaults.partition_timeout.as_secs(),
            )?),
            partitions,
        };
        if !(0.0..=1.0).contains(&retrieval.alpha) {
            return Err(PravahError::Config(format!(
                "RRF_ALPHA must be within [0, 1], got {}",
                retrieval.alpha
            )));
        }

        let synthesis_defaults = SynthesisConfig::default();
        let synthesis = SynthesisConfig {
            partition: match env::var("SYNTHESIS_PARTITION") {
                Ok(raw) => raw.parse()?,
                Err(_) => synthesis_defaults.partition,
            },
            top_k: parse_env("SYNTHESIS_TOP_K", synthesis_defaults.top_k)?,
        };

        let pipeline = PipelineConfig {
            stage1_page_size: parse_env("STAGE1_PAGE_SIZE", pipeline_defaults.stage1_page_size)?,
            stage1_record_cap: parse_env(
                "STAGE1_RECORD_CAP",
                pipeline_defaults.stage1_record_cap,
            )?,
            stage2_batch_size: parse_env(
                "STAGE2_BATCH_SIZE",
                pipeline_defaults.stage2_batch_size,
            )?,
            ack_poll_interval: secs_env("ACK_POLL_INTERVAL_SECS", pipeline_defaults.ack_poll_interval)?,
            cooldown: secs_env("JOB_COOLDOWN_SECS", pipeline_defaults.cooldown)?,
            stage2_ack_timeout: secs_env(
                "STAGE2_ACK_TIMEOUT_SECS",
                pipeline_defaults.stage2_ack_timeout,
            )?,
            max_stage2_attempts: parse_env(
                "MAX_STAGE2_ATTEMPTS",
                pipeline_defaults.max_stage2_attempts,
            )?,
            job_deadline: secs_env("JOB_DEADLINE_SECS", pipeline_defaults.job_deadline)?,
        };
        if pipeline.stage1_page_size == 0 || pipeline.stage2_batch_size == 0 {
            return Err(PravahError::Config(
                "STAGE1_PAGE_SIZE and STAGE2_BATCH_SIZE must be positive".to_string(),
            ));
        }

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            llm: LlmConfig {
                api_key: required_env("LLM_API_KEY")?,
                base_url: env_or("LLM_BASE_URL", "https://api.openai.com/v1"),
                judge_model: env_or("JUDGE_MODEL", "gpt-4o-mini"),
                embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-3-large"),
                embedding_dimensions: parse_env("EMBEDDING_DIMENSIONS", 3072usize)?,
            },
            observer_host: env_or("OBSERVER_HOST", "0.0.0.0"),
            observer_port,
            analyze_host: env_or("ANALYZE_HOST", "0.0.0.0"),
            analyze_port: parse_env("ANALYZE_PORT", 8081u16)?,
            callback_url: env::var("CALLBACK_URL")
                .unwrap_or_else(|_| format!("http://localhost:{observer_port}/callback")),
            stage1_topic_url: env_or("STAGE1_TOPIC_URL", "http://localhost:8081/"),
            stage2_topic_url: env_or("STAGE2_TOPIC_URL", "http://localhost:8081/stage2"),
            retrieval,
            synthesis,
            pipeline,
        })
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            llm_base_url = self.llm.base_url.as_str(),
            judge_model = self.llm.judge_model.as_str(),
            embedding_model = self.llm.embedding_model.as_str(),
            embedding_dimensions = self.llm.embedding_dimensions,
            llm_api_key = if self.llm.api_key.is_empty() { "missing" } else { "set" },
            partitions = ?self.retrieval.partitions.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            alpha = self.retrieval.alpha,
            vector_threshold = self.retrieval.vector_threshold(),
            fts_threshold = self.retrieval.fts_threshold,
            top_k = self.retrieval.top_k,
            synthesis_partition = %self.synthesis.partition,
            stage1_record_cap = self.pipeline.stage1_record_cap,
            stage2_batch_size = self.pipeline.stage2_batch_size,
            cooldown_secs = self.pipeline.cooldown.as_secs(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> Result<String, PravahError> {
    env::var(key).map_err(|_| PravahError::Config(format!("{key} environment variable is required")))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, PravahError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PravahError::Config(format!("{key} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration, PravahError> {
    Ok(Duration::from_secs(parse_env(key, default.as_secs())?))
}
