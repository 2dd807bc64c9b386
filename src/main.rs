use std::sync::Arc;

use anyhow::Context;

use mail_answer::channels::{EmailConfig, GmailConfig, GmailSource, ImapSource, MessageSource};
use mail_answer::config::{PipelineConfig, SourceKind};
use mail_answer::llm::{
    LlmConfig, LlmProvider, LlmSynthesizer, QueryTranslator, SynthesisConfig, create_provider,
};
use mail_answer::pipeline::PipelineController;
use mail_answer::retrieval::{ConfluenceConfig, ConfluenceRetriever};

const USAGE: &str = "\
Usage:
  mail-answer                              answer unread mail once
  mail-answer sql <ddl-file> <question...> translate a question to SQL
  mail-answer github <description...>      translate a description to a GitHub query";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => run_pipeline().await,
        Some("sql") => {
            let [_, ddl_file, question @ ..] = args.as_slice() else {
                anyhow::bail!("missing <ddl-file>\n{USAGE}");
            };
            if question.is_empty() {
                anyhow::bail!("missing <question>\n{USAGE}");
            }
            let ddl = tokio::fs::read_to_string(ddl_file)
                .await
                .with_context(|| format!("reading table DDL from {ddl_file}"))?;
            let sql = translator()?.to_sql(&question.join(" "), &ddl).await?;
            println!("{sql}");
            Ok(())
        }
        Some("github") => {
            let description = args[1..].join(" ");
            if description.trim().is_empty() {
                anyhow::bail!("missing <description>\n{USAGE}");
            }
            let query = translator()?.to_github_query(&description).await?;
            println!("{query}");
            Ok(())
        }
        Some("-h" | "--help" | "help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command '{other}'\n{USAGE}"),
    }
}

/// One pass over the inbox. Per-message failures are reported, not fatal.
async fn run_pipeline() -> anyhow::Result<()> {
    eprintln!("📬 Mail Answer v{}", env!("CARGO_PKG_VERSION"));

    // ── Message source ───────────────────────────────────────────────────
    let source: Arc<dyn MessageSource> = match SourceKind::from_env()? {
        SourceKind::Gmail => {
            let config = GmailConfig::from_env()?;
            eprintln!("   Source: Gmail ({})", config.from_address);
            Arc::new(GmailSource::new(config)?)
        }
        SourceKind::Imap => {
            let config = EmailConfig::from_env()?;
            eprintln!(
                "   Source: IMAP {} / SMTP {}",
                config.imap_host, config.smtp_host
            );
            Arc::new(ImapSource::new(config))
        }
    };

    // ── Knowledge base ───────────────────────────────────────────────────
    let confluence = ConfluenceConfig::from_env()?;
    eprintln!("   Confluence: {}", confluence.base_url);
    let retriever = Arc::new(ConfluenceRetriever::new(confluence)?);

    // ── Model ────────────────────────────────────────────────────────────
    let llm = llm_from_env()?;
    eprintln!("   Model: {}", llm.model_name());
    let synthesizer = Arc::new(LlmSynthesizer::new(llm, SynthesisConfig::from_env()?));

    let controller =
        PipelineController::new(source, retriever, synthesizer, PipelineConfig::from_env()?);

    match controller.run_once().await {
        Ok(report) => {
            eprintln!("   Done: {report}");
            if report.unacknowledged() > 0 {
                eprintln!(
                    "   Warning: {} message(s) were answered but not marked read and will be answered again next run",
                    report.unacknowledged()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: run aborted: {e}");
            std::process::exit(1);
        }
    }
}

fn llm_from_env() -> anyhow::Result<Arc<dyn LlmProvider>> {
    let config = LlmConfig::from_env()?;
    Ok(create_provider(&config)?)
}

fn translator() -> anyhow::Result<QueryTranslator> {
    Ok(QueryTranslator::new(llm_from_env()?))
}
