//! Generate a workout program from a parameters file and print the workouts
//! as they stream in. Ctrl-C cancels the job.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use program_stream::prelude::*;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportChoice {
    /// Read the response body incrementally.
    Native,
    /// Diff a growing response buffer.
    Poll,
}

#[derive(Debug, Parser)]
#[command(name = "program-stream")]
#[command(about = "Generate a workout program and stream its workouts")]
struct Args {
    /// JSON file with job parameters
    #[arg(long)]
    params: PathBuf,

    /// Backend base URL
    #[arg(long, env = "PROGRAM_STREAM_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token for the generation endpoint
    #[arg(long, env = "PROGRAM_STREAM_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, value_enum, default_value_t = TransportChoice::Native)]
    transport: TransportChoice,

    /// Retries after the first attempt for transient failures
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Log every received frame at debug level
    #[arg(long)]
    debug_frames: bool,

    /// Print the request body and exit
    #[arg(long)]
    dry_run: bool,

    /// Print workouts as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities {
            incremental_post_body: self.transport == TransportChoice::Native,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }
}

fn load_env() {
    let _ = dotenvy::dotenv();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env();
    program_stream::init_observability();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.params)?;
    let params: JobParameters = serde_json::from_str(&raw)?;

    if args.dry_run {
        let prepared = params.prepare(chrono::Local::now().date_naive())?;
        println!("{}", serde_json::to_string_pretty(&prepared.body)?);
        return Ok(());
    }

    let Some(endpoint) = args.endpoint.clone() else {
        return Err("missing --endpoint (or PROGRAM_STREAM_ENDPOINT)".into());
    };
    let config = GenerationClientConfig::new(endpoint).debug_frames(args.debug_frames);
    let credentials: Arc<dyn CredentialProvider> = match &args.token {
        Some(token) => Arc::new(StaticCredentials::new(token.clone())),
        None => Arc::new(EnvCredentials::default()),
    };
    let orchestrator = GenerationOrchestrator::builder(config, credentials)
        .capabilities(args.capabilities())
        .retry_policy(args.retry_policy())
        .build()?;
    let controller = GenerationController::new(Arc::new(orchestrator));

    let mut notices = controller.notices();
    let handle = controller.start(params);
    tokio::pin!(handle);
    let outcome = loop {
        tokio::select! {
            outcome = &mut handle => break outcome?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancelling...");
                controller.cancel();
            }
            notice = notices.recv() => match notice {
                Ok(notice) => report(&notice, &controller),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress output fell behind");
                }
                Err(RecvError::Closed) => {}
            },
        }
    };

    let job = controller.snapshot();
    for unit in &job.partial_results {
        if args.json {
            println!("{}", serde_json::to_string(unit)?);
        } else {
            let date = unit.scheduled_date.as_deref().unwrap_or("-");
            println!("{date}  {}", unit.title);
        }
    }

    match outcome {
        GenerationOutcome::Completed { result_count } => {
            eprintln!(
                "done: {result_count} workouts in {}s",
                job.elapsed_seconds
            );
            Ok(())
        }
        GenerationOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(())
        }
        GenerationOutcome::Failed { error } => Err(error.into()),
    }
}

fn report(notice: &JobNotice, controller: &GenerationController) {
    match notice {
        JobNotice::UnitAdded {
            id,
            progress_current,
        } => {
            let total = controller.snapshot().progress_total;
            eprintln!("[{progress_current}/{total}] {id}");
        }
        JobNotice::Status {
            message: Some(message),
        } => eprintln!("{message}"),
        JobNotice::Warning { message } => eprintln!("warning: {message}"),
        JobNotice::Retrying { attempt, error } => {
            eprintln!("retry {attempt} after: {error}");
        }
        _ => {}
    }
}
