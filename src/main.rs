use std::path::PathBuf;
use std::sync::Arc;

use stream_fetch::{Engine, EngineConfig, Job};
use tracing_subscriber::EnvFilter;

/// Tiny CLI front-end: `stream-fetch <url>=<destination> ...`.
///
/// Real job lists normally come from a playlist parser; this binary exists
/// to exercise [`Engine`] end-to-end without one.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: stream-fetch <url>=<destination> [<url>=<destination> ...]");
        std::process::exit(2);
    }

    let jobs: Vec<Job> = args
        .iter()
        .filter_map(|arg| {
            let (url, destination) = arg.split_once('=')?;
            Some(Job::new(url.to_string(), PathBuf::from(destination)))
        })
        .collect();

    if jobs.len() != args.len() {
        eprintln!("each argument must be of the form <url>=<destination>");
        std::process::exit(2);
    }

    let engine = match Engine::new(EngineConfig::default()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to start engine: {e}");
            std::process::exit(1);
        }
    };

    let callback: Arc<dyn Fn(&str, f64, Option<String>) + Send + Sync> = Arc::new(|name, percent, speed| {
        match speed {
            Some(speed) => println!("{name}: {percent:.1}% ({speed})"),
            None => println!("{name}: {percent:.1}%"),
        }
    });

    let outcomes = engine.run(jobs, Some(callback)).await;

    let mut failures = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => println!("done: {}", outcome.job.destination_path.display()),
            Err(e) => {
                failures += 1;
                eprintln!("failed: {} ({e})", outcome.job.destination_path.display());
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
}
