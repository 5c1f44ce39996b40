use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use strata_core::{Config, Pipeline, create_index, load_config};
use strata_index::{
    BoostConfig, ComposedChunk, CoverageReport, ExtractionReport, IngestReport, RankedResult,
    SearchRequest, compose_chunk, extract_tree, read_ingest_file, recompose, verify_coverage,
    write_ingest_file,
};
use strata_memory::{MetaKey, MetadataFilter};

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Code RAG pipeline: extract, embed, index and search a source tree",
    long_about = "Code RAG pipeline over Java/Spring repositories.\n\n\
                  Examples:\n  \
                    strata extract ./repo -o chunks.json      Chunk a tree into an ingest file\n  \
                    strata ingest chunks.json                 Embed and store an ingest file\n  \
                    strata index ./repo                       Extract and ingest in one run\n  \
                    strata search 'create order' -b layer=service:1.5"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: `STRATA_CONFIG` or config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk a source tree and write the ingest file
    Extract {
        root: PathBuf,

        /// Ingest file to write
        #[arg(short, long, default_value = "chunks.json")]
        output: PathBuf,

        /// Glob selecting module directories under the root
        #[arg(long)]
        module_pattern: Option<String>,
    },
    /// Embed and store the records of an ingest file
    Ingest { file: PathBuf },
    /// Extract and ingest a source tree in one run
    Index {
        root: PathBuf,

        /// Also write the ingest file here
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        module_pattern: Option<String>,
    },
    /// Hybrid semantic search over the index
    Search {
        query: String,

        /// Number of results (default: `retrieval.top_k`)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Exact-match filter, repeatable
        #[arg(short, long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,

        /// Score multiplier, repeatable
        #[arg(short, long = "boost", value_name = "FIELD=VALUE:FACTOR")]
        boosts: Vec<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the number of stored records
    Count,
    /// Delete every stored record, keeping the index configuration
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Recompose an ingest file with the current composer and rebuild the index from it
    Reembed {
        file: PathBuf,

        #[arg(long)]
        yes: bool,
    },
    /// Compare an ingest file with the source tree it was extracted from
    Verify { root: PathBuf, file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Extract {
            root,
            output,
            module_pattern,
        } => {
            override_pattern(&mut config, module_pattern);
            let (records, report) = extract(&root, &config).await?;
            write_ingest_file(&output, &records)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            print_extraction(&report);
            println!("wrote {} records to {}", records.len(), output.display());
        }
        Command::Ingest { file } => {
            let records = read_records(&file).await?;
            let pipeline = Pipeline::build(config).await?;
            let report = pipeline.ingestor().ingest(records).await?;
            print_ingest(&report);
        }
        Command::Index {
            root,
            output,
            module_pattern,
        } => {
            override_pattern(&mut config, module_pattern);
            let (records, report) = extract(&root, &config).await?;
            print_extraction(&report);
            if let Some(output) = output {
                write_ingest_file(&output, &records).await?;
            }
            let pipeline = Pipeline::build(config).await?;
            let report = pipeline.ingestor().ingest(records).await?;
            print_ingest(&report);
        }
        Command::Search {
            query,
            top_k,
            filters,
            boosts,
            json,
        } => {
            let request = search_request(&config, query, top_k, &filters, &boosts)?;
            let pipeline = Pipeline::build(config).await?;
            let results = pipeline.retriever()?.search(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Command::Count => {
            let index = create_index(&config).await?;
            println!("{}", index.count().await?);
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every record without --yes");
            }
            let index = create_index(&config).await?;
            let before = index.count().await?;
            index.delete_all().await?;
            println!("deleted {before} records");
        }
        Command::Reembed { file, yes } => {
            if !yes {
                bail!("refusing to rebuild the index without --yes");
            }
            let records: Vec<ComposedChunk> =
                read_records(&file).await?.into_iter().map(recompose).collect();
            write_ingest_file(&file, &records).await?;
            tracing::info!(records = records.len(), file = %file.display(), "ingest file recomposed");
            let pipeline = Pipeline::build(config).await?;
            pipeline.index().delete_all().await?;
            let report = pipeline.ingestor().ingest(records).await?;
            print_ingest(&report);
        }
        Command::Verify { root, file } => {
            let records = read_records(&file).await?;
            let report = verify_coverage(&root, &records, &config.extract).await?;
            print_coverage(&report);
        }
    }
    Ok(())
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn override_pattern(config: &mut Config, pattern: Option<String>) {
    if pattern.is_some() {
        config.extract.module_pattern = pattern;
    }
}

async fn extract(
    root: &Path,
    config: &Config,
) -> anyhow::Result<(Vec<ComposedChunk>, ExtractionReport)> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let extraction = extract_tree(root, &config.extract).await?;
    let records = extraction.chunks.into_iter().map(compose_chunk).collect();
    Ok((records, extraction.report))
}

async fn read_records(file: &Path) -> anyhow::Result<Vec<ComposedChunk>> {
    read_ingest_file(file)
        .await
        .with_context(|| format!("reading ingest file {}", file.display()))
}

fn search_request(
    config: &Config,
    query: String,
    top_k: Option<usize>,
    filters: &[String],
    boosts: &[String],
) -> anyhow::Result<SearchRequest> {
    let pairs = filters
        .iter()
        .map(|f| {
            f.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                .with_context(|| format!("filter `{f}` is not key=value"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let filter = MetadataFilter::from_pairs(pairs)?;
    let boosts = BoostConfig::from_specs(boosts)?;
    Ok(
        SearchRequest::new(query, top_k.unwrap_or(config.retrieval.top_k))
            .with_filter(filter)
            .with_boosts(boosts),
    )
}

fn print_extraction(report: &ExtractionReport) {
    println!(
        "modules: {} | files: {} scanned, {} chunked | chunks: {} | {} ms",
        report.modules.join(", "),
        report.files_scanned,
        report.files_chunked,
        report.chunks,
        report.duration_ms
    );
    for error in &report.errors {
        println!("  skipped {}: {}", error.file_path, error.error);
    }
}

fn print_ingest(report: &IngestReport) {
    println!(
        "records: {} | inserted: {} | fallbacks: {} | failed: {} | {} ms",
        report.records,
        report.inserted,
        report.embedding_fallbacks.len(),
        report.failed.len(),
        report.duration_ms
    );
    for id in &report.embedding_fallbacks {
        println!("  embedding failed: {id}");
    }
    for (id, error) in &report.failed {
        println!("  insert failed: {id}: {error}");
    }
}

fn print_results(results: &[RankedResult]) {
    if results.is_empty() {
        println!("no results");
        return;
    }
    for (rank, r) in results.iter().enumerate() {
        let meta = &r.metadata;
        let location = meta.text(MetaKey::FilePath).unwrap_or("?");
        let lines = match (meta.int(MetaKey::LineStart), meta.int(MetaKey::LineEnd)) {
            (Some(start), Some(end)) => format!(":{start}-{end}"),
            _ => String::new(),
        };
        println!(
            "{}. {location}{lines}  [{}] {}  score {:.4} (semantic {:.4})",
            rank + 1,
            meta.text(MetaKey::ChunkType).unwrap_or("?"),
            describe(r),
            r.boosted_similarity,
            r.similarity
        );
    }
}

fn describe(result: &RankedResult) -> String {
    let meta = &result.metadata;
    if let (Some(method), Some(path)) = (meta.text(MetaKey::HttpMethod), meta.text(MetaKey::ApiPath)) {
        return format!("{method} {path}");
    }
    match (meta.text(MetaKey::ClassName), meta.text(MetaKey::MethodName)) {
        (Some(class), Some(method)) => format!("{class}.{method}"),
        (Some(class), None) => class.to_owned(),
        _ => meta
            .text(MetaKey::Heading)
            .or_else(|| meta.text(MetaKey::SchemaName))
            .unwrap_or(result.id.as_str())
            .to_owned(),
    }
}

fn print_coverage(report: &CoverageReport) {
    println!(
        "source files: {} | chunked files: {} | missing: {} | extra: {} | empty: {}",
        report.source_files,
        report.chunked_files,
        report.missing.len(),
        report.extra.len(),
        report.empty.len()
    );
    for file in &report.missing {
        println!("  missing: {file}");
    }
    for file in &report.extra {
        println!("  extra: {file}");
    }
    for (file, types) in &report.chunk_types {
        let counts: Vec<String> = types.iter().map(|(t, n)| format!("{t}={n}")).collect();
        println!("  {file}: {}", counts.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_search_flags() {
        let cli = Cli::parse_from([
            "strata", "search", "create order", "-k", "3", "-f", "layer=service", "-b",
            "layer=service:1.5", "--json",
        ]);
        let Command::Search {
            query,
            top_k,
            filters,
            boosts,
            json,
        } = cli.command
        else {
            panic!("expected search");
        };
        assert_eq!(query, "create order");
        assert_eq!(top_k, Some(3));
        assert_eq!(filters, ["layer=service"]);
        assert_eq!(boosts, ["layer=service:1.5"]);
        assert!(json);
    }

    #[test]
    fn search_request_from_flags() {
        let config = Config::default();
        let request = search_request(
            &config,
            "q".into(),
            None,
            &["layer=service".into(), "line_start=10".into()],
            &["layer=service:2".into()],
        )
        .unwrap();
        assert_eq!(request.top_k, 5);
        assert_eq!(request.filter.map(|f| f.fields().count()), Some(2));
        assert!(!request.boosts.is_empty());

        assert!(search_request(&config, "q".into(), None, &["layer".into()], &[]).is_err());
        assert!(search_request(&config, "q".into(), None, &["line_start=x".into()], &[]).is_err());
        assert!(search_request(&config, "q".into(), None, &[], &["bad".into()]).is_err());
    }

    #[test]
    fn clear_and_reembed_parse_confirmation() {
        let cli = Cli::parse_from(["strata", "clear"]);
        assert!(matches!(cli.command, Command::Clear { yes: false }));
        let cli = Cli::parse_from(["strata", "--config", "x.toml", "reembed", "c.json", "--yes"]);
        assert!(matches!(cli.command, Command::Reembed { yes: true, .. }));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }
}
