//! CLI command handlers
//!
//! Human-readable output honors `--quiet`; `--json` prints one JSON document
//! on stdout per command.

use anyhow::{Context as _, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;
use std::path::Path;

use super::Context;
use crate::document::{DocId, DocType, FilterClause, Metadata, MetadataFilter};
use crate::index::{OpenMode, StudyIndex};
use crate::ingest::{DeleteStatus, IngestOutcome, IngestRequest, IngestStatus, IngestionCoordinator};
use crate::output::{is_quiet, print_json};
use crate::search::{FusedResult, HybridQuery, QueryResponse};
use crate::{info_print, warn_print};

/// Requests handed to the coordinator per call during `ingest`
const INGEST_CHUNK_SIZE: usize = 256;

/// Characters of document text shown per result
const SNIPPET_CHARS: usize = 120;

pub(crate) struct QueryOptions {
    pub top_k: Option<usize>,
    pub alpha: Option<f32>,
    pub filters: Vec<FilterClause>,
    pub doc_type: Option<DocType>,
    pub show_scores: bool,
}

fn open(ctx: &Context, mode: OpenMode) -> Result<StudyIndex> {
    let index = StudyIndex::open(&ctx.db_path, &ctx.settings, mode)?;
    Ok(index)
}

fn progress_bar(total: usize) -> Result<ProgressBar> {
    if is_quiet() {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Parse a JSON array or JSON lines of ingest requests
pub(crate) fn parse_requests(raw: &str) -> Result<Vec<IngestRequest>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("invalid JSON array of documents");
    }

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid JSON on line {}", n + 1))
        })
        .collect()
}

fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        return Ok(raw);
    }
    std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))
}

pub(crate) async fn ingest(ctx: &Context, file: &Path) -> Result<()> {
    let requests = parse_requests(&read_input(file)?)?;
    IngestionCoordinator::validate_batch(&requests)?;
    if requests.is_empty() {
        info_print!("Nothing to ingest");
        return Ok(());
    }

    let index = open(ctx, OpenMode::Strict)?;
    let pb = progress_bar(requests.len())?;
    pb.set_message("ingesting");

    let mut outcomes: Vec<IngestOutcome> = Vec::with_capacity(requests.len());
    for chunk in requests.chunks(INGEST_CHUNK_SIZE) {
        if ctx.cancel_token.is_cancelled() {
            warn_print!("Ingestion cancelled after {} documents", outcomes.len());
            break;
        }
        let chunk_outcomes = index.coordinator().ingest(chunk.to_vec()).await?;
        pb.inc(chunk_outcomes.len() as u64);
        outcomes.extend(chunk_outcomes);
    }
    pb.finish_and_clear();

    if ctx.json {
        print_json(&outcomes)?;
        return Ok(());
    }

    let count = |status: IngestStatus| outcomes.iter().filter(|o| o.status == status).count();
    info_print!(
        "{} {} ingested, {} degraded, {} failed",
        "✅".green(),
        count(IngestStatus::Ingested),
        count(IngestStatus::Degraded),
        count(IngestStatus::Failed)
    );
    for outcome in outcomes.iter().filter(|o| o.status != IngestStatus::Ingested) {
        warn_print!(
            "  {} {} ({})",
            outcome.doc_id.as_str().yellow(),
            outcome.status.as_str(),
            outcome.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub(crate) async fn query(ctx: &Context, text: &str, options: QueryOptions) -> Result<()> {
    let index = open(ctx, OpenMode::Strict)?;

    let mut query = HybridQuery::new(text).filter(MetadataFilter::new(options.filters));
    if let Some(top_k) = options.top_k {
        query = query.top_k(top_k);
    }
    if let Some(alpha) = options.alpha {
        query = query.alpha(alpha);
    }
    if let Some(doc_type) = options.doc_type {
        query = query.doc_type(doc_type);
    }

    let response = tokio::select! {
        response = index.retriever().search(query) => response?,
        _ = ctx.cancel_token.cancelled() => anyhow::bail!("query cancelled"),
    };

    if ctx.json {
        print_json(&response)?;
        return Ok(());
    }
    print_response(&index, &response, options.show_scores).await
}

async fn print_response(index: &StudyIndex, response: &QueryResponse, show_scores: bool) -> Result<()> {
    if response.partial {
        let degraded: Vec<&str> = response.degraded.iter().map(|s| s.as_str()).collect();
        warn_print!(
            "{}",
            format!(
                "⚠️  Partial results: {} store unavailable (alpha forced to {})",
                degraded.join(", "),
                response.alpha_applied
            )
            .yellow()
        );
    }

    if response.results.is_empty() {
        println!("No results");
        return Ok(());
    }

    for (rank, result) in response.results.iter().enumerate() {
        println!(
            "{}. {}  {}",
            rank + 1,
            result.doc_id.as_str().bold(),
            format!("{:.3}", result.fused_score).green()
        );
        if let Some(doc) = index.get(&result.doc_id).await? {
            println!("   {}", snippet(&doc.text));
        }
        if !result.metadata.is_empty() {
            println!("   {}", format_metadata(&result.metadata).dimmed());
        }
        if show_scores {
            println!("   {}", format_scores(result).dimmed());
        }
    }

    info_print!(
        "{}",
        format!(
            "{} results in {} ms{}",
            response.results.len(),
            response.took_ms,
            if response.cached { " (cached)" } else { "" }
        )
        .dimmed()
    );
    Ok(())
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{}…", cut)
}

fn format_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_scores(result: &FusedResult) -> String {
    let raw = |value: Option<f32>| match value {
        Some(v) => format!("{:.3}", v),
        None => "-".to_string(),
    };
    format!(
        "lexical {:.3} (bm25 {}), vector {:.3} (cosine {})",
        result.lexical_score,
        raw(result.lexical_raw),
        result.vector_score,
        raw(result.vector_raw)
    )
}

pub(crate) async fn get(ctx: &Context, doc_id: &str) -> Result<()> {
    let id = DocId::parse(doc_id)?;
    let index = open(ctx, OpenMode::Strict)?;

    let Some(doc) = index.get(&id).await? else {
        anyhow::bail!("document '{}' not found", id);
    };

    if ctx.json {
        print_json(&doc)?;
        return Ok(());
    }
    println!("{}", doc.id.as_str().bold());
    println!("{}", format!("created {}", doc.created_at.to_rfc3339()).dimmed());
    if !doc.metadata.is_empty() {
        println!("{}", format_metadata(&doc.metadata).dimmed());
    }
    println!();
    println!("{}", doc.text);
    Ok(())
}

pub(crate) async fn delete(ctx: &Context, doc_ids: Vec<String>) -> Result<()> {
    let ids = doc_ids
        .into_iter()
        .map(DocId::parse)
        .collect::<crate::error::Result<Vec<_>>>()?;
    let index = open(ctx, OpenMode::Strict)?;
    let outcomes = index.coordinator().delete(ids).await?;

    if ctx.json {
        print_json(&outcomes)?;
        return Ok(());
    }
    for outcome in &outcomes {
        match outcome.status {
            DeleteStatus::Deleted => info_print!("🗑️  Deleted {}", outcome.doc_id),
            _ => warn_print!(
                "{}",
                format!(
                    "⚠️  {} {}: {}",
                    outcome.doc_id,
                    outcome.status.as_str(),
                    outcome.detail.as_deref().unwrap_or("")
                )
                .yellow()
            ),
        }
    }
    Ok(())
}

pub(crate) async fn stats(ctx: &Context) -> Result<()> {
    let index = open(ctx, OpenMode::Strict)?;
    let stats = index.stats().await?;

    if ctx.json {
        print_json(&stats)?;
        return Ok(());
    }
    println!("{}", "📊 Study index".bold());
    println!("  Path:       {}", stats.db_path.display());
    println!("  Model:      {} ({} dims)", stats.model_id, stats.dimensions);
    println!("  Lexical:    {} documents", stats.lexical_documents);
    println!("  Vector:     {} documents", stats.vector_documents);
    println!("  Disk:       {:.2} MB", stats.disk_bytes as f64 / (1024.0 * 1024.0));
    if stats.lexical_documents != stats.vector_documents {
        println!(
            "  {}",
            "Store counts differ: some documents are lexical-only (degraded ingest)".yellow()
        );
    }
    Ok(())
}

pub(crate) async fn reindex(ctx: &Context) -> Result<()> {
    let index = open(ctx, OpenMode::Reindex)?;
    if !index.needs_reindex() {
        info_print!("Model unchanged, re-embedding anyway");
    }

    let pb = progress_bar(0)?;
    pb.set_message("re-embedding");
    let summary = index
        .reindex(|done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
        .await?;
    pb.finish_and_clear();

    if ctx.json {
        print_json(&summary)?;
        return Ok(());
    }
    info_print!(
        "{} Re-embedded {}/{} documents",
        "✅".green(),
        summary.reindexed,
        summary.documents
    );
    for id in &summary.failed {
        warn_print!("  {} has no vector (lexical-only)", id.as_str().yellow());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MetadataValue;

    #[test]
    fn test_parse_json_array() {
        let requests = parse_requests(
            r#"[{"text": "derivative of x squared", "metadata": {"type": "question", "difficulty": 2}},
                {"text": "French Revolution causes", "doc_id": "hist-1"}]"#,
        )
        .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].metadata["difficulty"], MetadataValue::Int(2));
        assert_eq!(requests[1].doc_id.as_deref(), Some("hist-1"));
    }

    #[test]
    fn test_parse_json_lines() {
        let raw = "{\"text\": \"a\"}\n\n{\"text\": \"b\", \"metadata\": {\"type\": \"material\"}}\n";
        let requests = parse_requests(raw).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].metadata["type"], MetadataValue::from("material"));
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse_requests("{\"text\": \"ok\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "word ".repeat(100);
        let s = snippet(&long);
        assert!(s.ends_with('…'));
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 1);
        assert_eq!(snippet("short\n text"), "short text");
    }
}
