use clap::Parser;
use media_sweep::cli::{run, Cli};
use media_sweep::logging;
use media_sweep::report::RunOutcome;

#[tokio::main]
async fn main() {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_file.as_deref(), cli.verbose) {
        eprintln!("[ERROR] {e:#}");
        std::process::exit(RunOutcome::Aborted.exit_code());
    }

    match run(cli).await {
        Ok(report) => {
            println!("{report}");
            let outcome = report.outcome();
            tracing::info!(?outcome, "CLI completed");
            std::process::exit(outcome.exit_code());
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "CLI exited with error");
            eprintln!("[ERROR] {e:#}");
            std::process::exit(RunOutcome::Aborted.exit_code());
        }
    }
}
