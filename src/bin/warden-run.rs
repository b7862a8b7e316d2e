use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use warden::{AllowList, MatchStrength, Supervisor, TaskDescriptor, TaskOutcome};

/// Engine-side driver: runs a single task descriptor under the sandbox and
/// prints the classified outcome. Meant for manual testing, not end users.
#[derive(Parser)]
struct Args {
    /// JSON task descriptor
    descriptor: PathBuf,

    /// Serialized allow-list payload
    #[arg(long)]
    allow_list: Option<PathBuf>,

    /// Print every surfaced access as it arrives
    #[arg(long)]
    print_accesses: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let descriptor: TaskDescriptor =
        serde_json::from_slice(&std::fs::read(&args.descriptor).context("read descriptor")?)
            .context("parse descriptor")?;
    let allowlist = match &args.allow_list {
        Some(path) => Arc::new(
            AllowList::from_bytes(&std::fs::read(path).context("read allow-list")?)
                .context("parse allow-list")?,
        ),
        None => Arc::new(AllowList::new(descriptor.image_case_insensitive)),
    };

    let mut supervisor = Supervisor::new(descriptor, allowlist)?;

    let token = supervisor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    if args.print_accesses {
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor.set_access_sink(tx);
        tokio::spawn(async move {
            while let Some(access) = rx.recv().await {
                println!(
                    "{:>8} {:?} {:?} {}",
                    access.pid, access.operation, access.requested, access.path
                );
            }
        });
    }

    let result = supervisor.run().await;

    println!("outcome: {:?}", result.outcome);
    println!("exit code: {:?}", result.exit_code);
    println!(
        "violations: {} (existence-based: {})",
        result.counters.violations, result.counters.existence_based_violations
    );
    println!(
        "allow-listed: {} cacheable, {} not cacheable",
        result.counters.allowlisted_cacheable, result.counters.allowlisted_not_cacheable
    );
    println!("cacheable: {}", result.is_cacheable);
    for violation in &result.violations {
        println!("  ! {:?} {}", violation.requested, violation.path);
    }
    for (path, verdict) in &result.path_verdicts {
        if *verdict != MatchStrength::MatchesAndCacheable {
            println!("  ~ {:?} {}", verdict, path);
        }
    }
    for diag in &result.diagnostics {
        println!("  * {}", diag);
    }

    if result.outcome != TaskOutcome::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
