use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use siefore_update::{
    ApprovalStatus, GrowthLine, Period, Pipeline, PipelineConfig, RunOptions, RunOutcome,
    StageFailure, GROWTH_CONCEPTS,
};

const USAGE: &str = "\
Usage: siefore-update [--config <file>] <command>

Commands:
  run [--force]          Detect a new period, extract, enrich and send it for review
  approve <period>       Approve the pending review and integrate it
  reject <period>        Reject the pending review
  integrate <period>     Integrate an already approved period
  status [period]        Show the history and the review state of a period
  growth <period>        Year-to-date and year-over-year growth per afore
  export <file>          Write the history as the published JSON dataset";

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config");

    let config = PipelineConfig::load(config_path.as_deref().map(Path::new))
        .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    tracing::debug!(version = siefore_update::VERSION, ?config, "starting");

    let command = args.first().map(String::as_str).unwrap_or("");
    match command {
        "run" => {
            let force_rereview = args.iter().any(|a| a == "--force");
            run(&config, RunOptions { force_rereview })
        }
        "approve" => approve(&config, period_arg(&args)?),
        "reject" => reject(&config, period_arg(&args)?),
        "integrate" => integrate(&config, period_arg(&args)?),
        "growth" => growth(&config, period_arg(&args)?),
        "status" => status(&config, args.get(1).map(|p| Period::parse(p)).transpose()?),
        "export" => {
            let path = args.get(1).context("export needs an output file")?;
            export(&config, Path::new(path))
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

/// Remove `--flag value` from the argument list and return the value
fn take_option(args: &mut Vec<String>, flag: &str) -> Option<PathBuf> {
    let idx = args.iter().position(|a| a == flag)?;
    args.remove(idx);
    if idx < args.len() {
        Some(PathBuf::from(args.remove(idx)))
    } else {
        None
    }
}

fn period_arg(args: &[String]) -> Result<Period> {
    let Some(raw) = args.get(1) else {
        bail!("missing <period> argument (e.g. 2025.11)");
    };
    Ok(Period::parse(raw)?)
}

fn report(failure: StageFailure) -> anyhow::Error {
    eprintln!("❌ Pipeline stopped at the {} stage", failure.stage);
    eprintln!("   {}", failure.source);
    failure.into()
}

fn run(config: &PipelineConfig, options: RunOptions) -> Result<()> {
    println!("🔄 CONSAR Siefore Update");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut pipeline = Pipeline::from_config(config)?;

    match pipeline.run(options).map_err(report)? {
        RunOutcome::UpToDate { source, stored } => {
            println!("\n✓ History is up to date");
            println!("   Source publishes: {}", source.human());
            if let Some(stored) = stored {
                println!("   Latest stored:    {}", stored.human());
            }
        }
        RunOutcome::AlreadyDecided { status } => {
            println!("\n✓ {} was already {} (revision {})", status.period, status.state, status.revision);
            println!("   Re-run with --force to open a new review");
        }
        RunOutcome::AwaitingApproval { status, summary, consistency } => {
            println!("\n📊 {}", summary.summary());
            if let Some(report) = &consistency {
                println!("🔍 {}", report.summary());
                for check in report.checks.iter().filter(|c| !c.passed) {
                    println!("   ⚠️  {}", check.message);
                }
            }
            println!("\n⏳ {} is pending review (revision {})", status.period, status.revision);
            println!("   Approve:  siefore-update approve {}", status.period);
            println!("   Reject:   siefore-update reject {}", status.period);
        }
    }

    Ok(())
}

fn approve(config: &PipelineConfig, period: Period) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config)?;

    let status = pipeline.approve(period).map_err(report)?;
    println!("✅ {} approved (revision {})", status.period, status.revision);

    println!("\n💾 Integrating...");
    let result = pipeline.integrate(period).map_err(report)?;
    print_integration(&result);
    Ok(())
}

fn reject(config: &PipelineConfig, period: Period) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config)?;
    let status = pipeline.reject(period).map_err(report)?;
    println!("🚫 {} rejected (revision {}); history unchanged", status.period, status.revision);
    Ok(())
}

fn integrate(config: &PipelineConfig, period: Period) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config)?;
    let result = pipeline.integrate(period).map_err(report)?;
    print_integration(&result);
    Ok(())
}

fn print_integration(result: &siefore_update::IntegrationResult) {
    println!("✓ Backup:  {}", result.backup_path.display());
    println!("✓ Removed: {}", result.removed);
    println!("✓ Added:   {}", result.added);
    println!("✓ Store:   {} records", result.store_size);

    println!("\n{:<15} {:>22} {:>20}", "Afore", "Total Assets MXN", "USD");
    for total in &result.totals {
        println!(
            "{:<15} {:>22} {:>20}",
            total.afore.label(),
            total.value_mxn.round_dp(0),
            total.value_usd.round_dp(0)
        );
    }

    match result.within_expected_range {
        Some(false) => println!("\n⚠️  Industry Total Assets {} outside the expected range", result.industry_total_mxn),
        _ => println!("\n🎉 {} integrated", result.period.human()),
    }
}

fn status(config: &PipelineConfig, period: Option<Period>) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;

    let latest = pipeline.store().latest_period()?;
    println!("🗄️  History: {} records", pipeline.store().count()?);
    match latest {
        Some(latest) => println!("   Latest period: {} ({})", latest, latest.release_tag()),
        None => println!("   Empty"),
    }

    let Some(period) = period else {
        return Ok(());
    };

    println!("\n✋ Reviews for {}", period.human());
    let history = pipeline.gate().history(period)?;
    if history.is_empty() {
        println!("   none");
    }
    for status in &history {
        print_status(status);
    }

    let events = pipeline.gate().events_for_period(period)?;
    if !events.is_empty() {
        println!("\n📜 Events");
        for event in events {
            println!("   {}  {:<16} {}", event.timestamp.format("%Y-%m-%d %H:%M:%S"), event.event_type, event.data);
        }
    }

    Ok(())
}

fn print_status(status: &ApprovalStatus) {
    let decided = status
        .decided_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "   rev {}  {:<9} {} records  created {}  decided {}",
        status.revision,
        status.state.as_str(),
        status.record_count,
        status.created_at.format("%Y-%m-%d %H:%M"),
        decided
    );
}

fn growth(config: &PipelineConfig, period: Period) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.store().growth(period)?;

    println!("📈 Growth for {}", period.human());
    println!("   YTD vs {}, YoY vs {}", report.ytd_base.human(), report.yoy_base.human());

    for concept in GROWTH_CONCEPTS {
        println!("\n{}", concept.label());
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!(
            "{:<15} {:>16} {:>12} {:>9} {:>9} {:>9} {:>9}",
            "Afore", "MXN (M)", "USD (M)", "YTD MXN", "YTD USD", "YoY MXN", "YoY USD"
        );
        for line in report.lines_for(concept) {
            let name = line.afore.map(|a| a.label()).unwrap_or_default();
            print_growth_line(name, line);
        }
        if let Some(total) = report.total(concept) {
            print_growth_line("TOTAL", total);
        }
    }

    Ok(())
}

fn print_growth_line(name: &str, line: &GrowthLine) {
    let millions = Decimal::from(1_000_000);
    let pct = |value: Option<Decimal>| {
        value
            .map(|p| format!("{}%", p.round_dp(1)))
            .unwrap_or_else(|| "-".to_string())
    };
    let ytd = line.ytd.as_ref();
    let yoy = line.yoy.as_ref();
    println!(
        "{:<15} {:>16} {:>12} {:>9} {:>9} {:>9} {:>9}",
        name,
        (line.current.mxn / millions).round_dp(0),
        (line.current.usd / millions).round_dp(2),
        pct(ytd.and_then(|g| g.pct_mxn)),
        pct(ytd.and_then(|g| g.pct_usd)),
        pct(yoy.and_then(|g| g.pct_mxn)),
        pct(yoy.and_then(|g| g.pct_usd)),
    );
}

fn export(config: &PipelineConfig, path: &Path) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let written = pipeline
        .export(path)
        .with_context(|| format!("Failed to export to {}", path.display()))?;
    println!("✓ Exported {} records to {}", written, path.display());
    Ok(())
}
