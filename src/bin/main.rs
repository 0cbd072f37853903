/// Cadence administrative CLI
///
/// Provides definition lifecycle, instance control and event-log commands,
/// plus the wait-step timeout watcher loop.
use cadence_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
