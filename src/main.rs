use std::path::{Path, PathBuf};

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use voucher_ocr::{
    app_state::AppState,
    config::AppConfig,
    models::{
        job::{JobPayload, JobSnapshot, JobStatus},
        voucher::VoucherCode,
    },
    services::acquisition::is_remote,
    signals,
};

#[derive(Parser)]
#[command(name = "voucher-ocr")]
#[command(about = "Extract 16-digit voucher codes from voucher photos")]
#[command(version)]
struct Cli {
    /// Image paths or http(s) URLs
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Only recognize the whole image, skip the half-image variants
    #[arg(long)]
    no_split: bool,

    /// Number of images processed at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Keep the engine's intermediate images under <scratch>/debug/
    #[arg(long)]
    debug_images: bool,
}

#[derive(Serialize)]
struct CliReport {
    input: String,
    status: String,
    text: String,
    vouchers: Vec<VoucherCode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    debug_images: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CliReport {
    fn from_snapshot(input: &str, snapshot: Option<JobSnapshot>) -> Self {
        match snapshot {
            Some(job) => {
                let outcome = job.result.unwrap_or_default();
                Self {
                    input: input.to_string(),
                    status: job.status.to_string(),
                    text: outcome.text,
                    vouchers: outcome.vouchers,
                    debug_images: outcome.debug_images,
                    error: job.error,
                }
            }
            None => Self::rejected(input, "job was not tracked".to_string()),
        }
    }

    fn rejected(input: &str, error: String) -> Self {
        Self {
            input: input.to_string(),
            status: JobStatus::Failed.to_string(),
            text: String::new(),
            vouchers: Vec::new(),
            debug_images: Vec::new(),
            error: Some(error),
        }
    }

    fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let mut config = AppConfig::from_env()?;
    if cli.no_split {
        config.split_variants = false;
    }
    if let Some(concurrency) = cli.concurrency {
        config.worker_concurrency = concurrency.max(1);
    }
    if cli.debug_images {
        config.ocr_debug_images = true;
    }
    let debug_dir = config.scratch_dir.join("debug");

    let state = AppState::build(config).await?;

    let mut submitted: Vec<(String, Result<Uuid, String>)> = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let payload = if is_remote(input) {
            JobPayload::from_url(input.as_str())
        } else {
            JobPayload::from_path(input.as_str())
        };
        let id = state.queue.enqueue(payload).await.map_err(|e| e.to_string());
        submitted.push((input.clone(), id));
    }

    let waits = submitted.iter().map(|(_, id)| {
        let queue = state.queue.clone();
        let id = id.clone().ok();
        async move {
            match id {
                Some(id) => queue.wait_for(id).await,
                None => None,
            }
        }
    });

    let snapshots = tokio::select! {
        snapshots = join_all(waits) => Some(snapshots),
        _ = signals::shutdown_signal() => None,
    };

    // Drains active jobs and terminates the engine before exit.
    state.queue.shutdown().await?;

    let snapshots = match snapshots {
        Some(snapshots) => snapshots,
        None => submitted
            .iter()
            .map(|(_, id)| id.as_ref().ok().and_then(|id| state.queue.get_job_state(*id)))
            .collect(),
    };

    let reports: Vec<CliReport> = submitted
        .iter()
        .zip(snapshots)
        .map(|((input, id), snapshot)| match id {
            Ok(_) => CliReport::from_snapshot(input, snapshot),
            Err(e) => CliReport::rejected(input, e.clone()),
        })
        .collect();

    for report in &reports {
        if let Err(e) = write_debug_log(&debug_dir, report).await {
            tracing::warn!(error = %e, "Failed to write debug log");
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    let failed = reports.iter().filter(|r| r.failed()).count();
    if failed > 0 {
        return Err(format!("{failed} of {} image(s) failed", reports.len()).into());
    }
    Ok(())
}

fn print_report(report: &CliReport) {
    println!("== {} [{}]", report.input, report.status);
    if let Some(error) = &report.error {
        println!("error: {error}");
        return;
    }
    if !report.text.is_empty() {
        println!("{}", report.text);
    }
    if report.vouchers.is_empty() {
        println!("vouchers: none");
    } else {
        let codes: Vec<&str> = report.vouchers.iter().map(VoucherCode::as_str).collect();
        println!("vouchers: {}", codes.join(", "));
    }
}

/// `<scratch>/debug/<stem>.log` with the full report for one input.
async fn write_debug_log(debug_dir: &Path, report: &CliReport) -> std::io::Result<()> {
    tokio::fs::create_dir_all(debug_dir).await?;
    let stem = Path::new(report.input.split(['?', '#']).next().unwrap_or_default())
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let path: PathBuf = debug_dir.join(format!("{stem}.log"));

    let mut body = format!(
        "input: {}\nstatus: {}\nlogged_at: {}\n",
        report.input,
        report.status,
        chrono::Utc::now().to_rfc3339()
    );
    if let Some(error) = &report.error {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("vouchers:\n");
    for code in &report.vouchers {
        body.push_str(&format!("  {code}\n"));
    }
    if !report.debug_images.is_empty() {
        body.push_str("debug_images:\n");
        for image in &report.debug_images {
            body.push_str(&format!("  {}\n", image.display()));
        }
    }
    body.push_str("text:\n");
    body.push_str(&report.text);
    body.push('\n');

    tokio::fs::write(path, body).await
}
