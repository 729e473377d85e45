//! Ingestion and question answering over the shared index.
//!
//! ```text
//! ingest: file ─► DocumentParser ─► chunk_text ─► EmbeddingProvider ─► IndexStore::add
//! ask:    question ─► EmbeddingProvider ─► IndexStore::search ─► AnswerGenerator
//! submit: JobTracker::create ─► spawn(ingest) ─► JobTracker::update
//! ```
//!
//! One `RetrievalPipeline` is built at startup and shared behind an `Arc` by
//! the HTTP handlers, the CLI and background ingestion tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config, RetrievalConfig};
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::extract::DocumentParser;
use crate::generate::AnswerGenerator;
use crate::index::IndexStore;
use crate::jobs::JobTracker;
use crate::metrics::{MetricEvent, MetricsLog};
use crate::mirror::S3Mirror;
use crate::models::{AskResponse, ContextChunk, IngestReport, Job, JobStatus, NewPassage};

/// Answer returned when the index has nothing to offer.
pub const NO_CONTEXT_ANSWER: &str = "No relevant context found in the indexed documents.";

pub const MIN_QUESTION_CHARS: usize = 3;
pub const MAX_QUESTION_CHARS: usize = 500;

pub struct RetrievalPipeline {
    parser: DocumentParser,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<IndexStore>,
    generator: AnswerGenerator,
    metrics: MetricsLog,
    chunking: ChunkingConfig,
    retrieval: RetrievalConfig,
}

impl RetrievalPipeline {
    /// Assemble a pipeline from explicit components. Index and metrics files
    /// live under `config.data.dir`.
    pub fn new(
        config: &Config,
        parser: DocumentParser,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: AnswerGenerator,
    ) -> Self {
        Self {
            parser,
            embedder,
            index: Arc::new(IndexStore::new(&config.data)),
            generator,
            metrics: MetricsLog::new(config.data.metrics_path()),
            chunking: config.chunking.clone(),
            retrieval: config.retrieval.clone(),
        }
    }

    /// Build every component from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let parser = if config.ocr.enabled {
            DocumentParser::default()
        } else {
            DocumentParser::without_ocr()
        };
        let embedder = create_provider(&config.embedding)
            .with_context(|| format!("Failed to create '{}' embedder", config.embedding.provider))?;
        let generator = AnswerGenerator::from_config(&config.generation)?;

        let mut pipeline = Self::new(config, parser, embedder, generator);
        if let Some(ref mirror_config) = config.mirror {
            let mirror = S3Mirror::from_config(mirror_config)
                .context("Failed to configure index mirror")?;
            pipeline.index = Arc::new(IndexStore::new(&config.data).with_mirror(Arc::new(mirror)));
        }
        Ok(pipeline)
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn generator(&self) -> &AnswerGenerator {
        &self.generator
    }

    /// Parse, chunk, embed and index one file.
    pub async fn ingest(&self, path: &Path, doc_id: &str, source: &str) -> Result<IngestReport> {
        let start = Instant::now();

        let parser = self.parser.clone();
        let owned_path = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || parser.parse(&owned_path))
            .await
            .map_err(|e| RagError::ParseFailure(format!("parser task failed: {}", e)))??;

        let chunks = chunk_text(&text, self.chunking.size, self.chunking.overlap);
        if chunks.is_empty() {
            warn!(doc_id, source, "document produced no text");
        }

        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&chunks).await?
        };
        let passages: Vec<NewPassage> = chunks
            .into_iter()
            .map(|text| NewPassage {
                doc_id: doc_id.to_string(),
                source: source.to_string(),
                text,
            })
            .collect();
        let added = self.index.add(&passages, &vectors).await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        self.metrics.record(MetricEvent::Ingest {
            doc_id: doc_id.to_string(),
            chunks: added.len(),
            latency_ms,
        });
        info!(doc_id, source, chunks = added.len(), latency_ms, "document ingested");

        Ok(IngestReport {
            doc_id: doc_id.to_string(),
            chunks: added.len(),
            latency_ms,
        })
    }

    /// Answer `question` from the `top_k` best passages (config default when `None`).
    pub async fn ask(&self, question: &str, top_k: Option<usize>) -> Result<AskResponse> {
        let start = Instant::now();
        let question = question.trim();
        let question_chars = question.chars().count();
        if !(MIN_QUESTION_CHARS..=MAX_QUESTION_CHARS).contains(&question_chars) {
            return Err(RagError::InvalidInput(format!(
                "question must be between {} and {} characters",
                MIN_QUESTION_CHARS, MAX_QUESTION_CHARS
            )));
        }
        let top_k = top_k.unwrap_or(self.retrieval.top_k);
        if top_k == 0 || top_k > self.retrieval.max_top_k {
            return Err(RagError::InvalidInput(format!(
                "top_k must be between 1 and {}",
                self.retrieval.max_top_k
            )));
        }

        let query = embed_query(self.embedder.as_ref(), question).await?;
        let hits = self.index.search(&query, top_k).await?;

        let answer = if hits.is_empty() {
            NO_CONTEXT_ANSWER.to_string()
        } else {
            self.generator.generate(question, &hits).await
        };
        let contexts: Vec<ContextChunk> = hits.into_iter().map(ContextChunk::from).collect();

        let latency_ms = start.elapsed().as_millis() as u64;
        self.metrics.record(MetricEvent::Ask {
            question: question.to_string(),
            contexts: contexts.len(),
            latency_ms,
        });
        info!(contexts = contexts.len(), latency_ms, "question answered");

        Ok(AskResponse {
            answer,
            contexts,
            latency_ms,
        })
    }

    /// Queue `path` for background ingestion and return the job at once.
    ///
    /// The task uses the job id as `doc_id` and `filename` as source, and
    /// deletes `path` when it finishes, whatever the outcome.
    pub async fn submit(
        self: &Arc<Self>,
        path: PathBuf,
        filename: &str,
        jobs: Arc<JobTracker>,
    ) -> Result<Job> {
        let name = filename.to_string();
        let job = jobs.run_blocking(move |t| t.create(&name)).await?;
        let pipeline = Arc::clone(self);
        let job_id = job.id.clone();
        let source = filename.to_string();

        tokio::spawn(async move {
            pipeline.run_job(&job_id, &path, &source, &jobs).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove upload");
            }
        });
        Ok(job)
    }

    async fn run_job(&self, job_id: &str, path: &Path, source: &str, jobs: &Arc<JobTracker>) {
        let id = job_id.to_string();
        if let Err(e) = jobs
            .run_blocking(move |t| t.update(&id, JobStatus::Processing, None))
            .await
        {
            error!(job_id, error = %e, "failed to mark job processing");
            return;
        }
        let (status, message) = match self.ingest(path, job_id, source).await {
            Ok(_) => (JobStatus::Completed, None),
            Err(e) => {
                warn!(job_id, source, error = %e, "ingestion failed");
                (JobStatus::Failed, Some(e.to_string()))
            }
        };
        let id = job_id.to_string();
        if let Err(e) = jobs
            .run_blocking(move |t| t.update(&id, status, message))
            .await
        {
            error!(job_id, error = %e, "failed to record job outcome");
        }
    }
}
