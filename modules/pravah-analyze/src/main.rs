use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use pravah_analyze::{
    server, Classifier, HttpAckSink, MergeLayer, OpenAi, Stage1Worker, Stage2Worker,
};
use pravah_common::{Config, ItemAnalyzer, PairJudge, RetrievalConfig, TextEmbedder};
use pravah_retrieval::RetrievalEngine;
use pravah_store::{CanonicalStore, PgCanonicalStore, PgSearchIndex, SearchIndex};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
                .add_directive("pravah=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("Failed to load config")?;
    config.log_redacted();

    let pool = pravah_store::postgres::connect(&config.database_url, 10)
        .await
        .context("Failed to connect to Postgres")?;

    let llm = Arc::new(OpenAi::new(&config.llm)?);
    let embedder: Arc<dyn TextEmbedder> = llm.clone();
    let judge: Arc<dyn PairJudge> = llm.clone();
    let analyzer: Arc<dyn ItemAnalyzer> = llm;

    let index = Arc::new(PgSearchIndex::new(pool.clone()));
    let Some(write_partition) = config.retrieval.partitions.first().cloned() else {
        bail!("KB_PARTITIONS is empty");
    };
    index.ensure_partition(&write_partition).await?;

    // One database serves every configured label.
    let mut engine = RetrievalEngine::new(embedder.clone(), config.retrieval.clone());
    for partition in &config.retrieval.partitions {
        engine = engine.with_index(partition.label.clone(), index.clone() as Arc<dyn SearchIndex>);
    }

    let report = engine.validate_partitions().await;
    for (label, errors) in &report {
        for error in errors {
            tracing::warn!(label = %label, error = %error, "Partition check failed");
        }
    }
    if report.values().all(|errors| !errors.is_empty()) {
        bail!("No knowledge-base partition is reachable");
    }

    let canonical: Arc<dyn CanonicalStore> = Arc::new(PgCanonicalStore::new(pool.clone()));
    let merge = MergeLayer::builder()
        .canonical(canonical)
        .index(index.clone() as Arc<dyn SearchIndex>)
        .partition(write_partition)
        .embedder(embedder.clone())
        .judge(judge.clone())
        .analyzer(analyzer.clone())
        .build();

    let acks = Arc::new(HttpAckSink::new(config.callback_url.clone())?);
    let classifier = Classifier::new(Arc::new(engine), judge.clone());
    let stage1 = Arc::new(Stage1Worker::new(classifier, merge, acks.clone()));

    // Stage 2 searches and writes its own partition and table.
    let synthesis_partition = config.synthesis.partition.clone();
    index.ensure_partition(&synthesis_partition).await?;
    let synthesis_engine = RetrievalEngine::new(
        embedder.clone(),
        RetrievalConfig {
            partitions: vec![synthesis_partition.clone()],
            top_k: config.synthesis.top_k,
            ..config.retrieval.clone()
        },
    )
    .with_index(
        synthesis_partition.label.clone(),
        index.clone() as Arc<dyn SearchIndex>,
    );
    let synthesized: Arc<dyn CanonicalStore> = Arc::new(PgCanonicalStore::synthesized(pool));
    let synthesis_merge = MergeLayer::builder()
        .canonical(synthesized)
        .index(index as Arc<dyn SearchIndex>)
        .partition(synthesis_partition)
        .embedder(embedder)
        .judge(judge.clone())
        .analyzer(analyzer)
        .build();
    let stage2 = Arc::new(Stage2Worker::new(
        Classifier::new(Arc::new(synthesis_engine), judge),
        synthesis_merge,
        acks,
    ));

    let app = server::build_router(stage1, stage2);
    let addr = format!("{}:{}", config.analyze_host, config.analyze_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(addr = %addr, "pravah-analyze listening");
    axum::serve(listener, app).await?;

    Ok(())
}
