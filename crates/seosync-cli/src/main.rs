use anyhow::Result;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "seosync")]
#[command(version, about = "Sync daily Search Console and GA4 page metrics into Google Sheets")]
struct Cli {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    seosync_pipeline::init_logging(std::env::var("LOG_LEVEL").ok().as_deref());

    let summary = seosync_pipeline::run_pipeline_from_env().await?;
    println!(
        "pipeline complete: run_id={} target_date={} gsc_rows={} ga4_rows={} outcome={:?}",
        summary.run_id,
        summary.target_date,
        summary.search_rows,
        summary.analytics_rows,
        summary.outcome()
    );

    Ok(())
}
