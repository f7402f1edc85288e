use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use studysearch::cli::{self, Cli};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let announce = !cli.quiet && !cli.json;

    let cancel_token = CancellationToken::new();
    let cancel_clone = cancel_token.clone();

    // First press: graceful shutdown via CancellationToken. Second press: force exit.
    ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            eprintln!("\n⚠️  Force shutdown!");
            std::process::exit(130);
        }
        if announce {
            eprintln!("\n🛑 Shutting down gracefully... (press Ctrl-C again to force)");
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        cancel_clone.cancel();
    })?;

    cli::run(cli, cancel_token).await
}
