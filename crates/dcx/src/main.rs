use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;
mod commands;

#[tokio::main]
async fn main() {
    if let Err(e) = dcx_core::logging::init() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // A user interrupt on the controlling terminal cancels the root token;
    // every suspension point in the core observes it.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, cancelling");
            signal_token.cancel();
        }
    });

    let parsed = cli::Cli::parse();
    let code = match parsed.dispatch(&cancel).await {
        Ok(()) => 0,
        Err(e) => {
            match &e {
                dcx_core::errors::DcxError::Cancelled => {
                    tracing::debug!("cancelled");
                }
                other => {
                    tracing::error!("{other}");
                }
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}
