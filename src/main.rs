use clap::Parser;
use sftp_relay::cli::{self, CliArgs, EXIT_CANCELLED, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use sftp_relay::logging;
use sorng_relay::relay::{relay, CancelToken, TransferProgress};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if let Err(e) = logging::init_logging(args.log_level.as_deref(), args.json_logs) {
        eprintln!("{:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let (source, target) = match (config.source.to_endpoint(), config.target.to_endpoint()) {
        (Ok(s), Ok(t)) => (s, t),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling relay (again to force exit)");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(i32::from(EXIT_CANCELLED));
            }
        });
    }

    let mut options = cli::relay_options(&config, cancel);
    options.progress = Some(Arc::new(|p: &TransferProgress| {
        tracing::debug!(
            bytes = p.bytes_transferred,
            elapsed_ms = p.elapsed_ms,
            "{:.0} B/s",
            p.speed_bytes_per_sec
        );
    }));

    match relay(
        &source,
        &config.source.path,
        &target,
        &config.target.path,
        &options,
    )
    .await
    {
        Ok(summary) => {
            if args.json_logs {
                match serde_json::to_string(&summary) {
                    Ok(line) => println!("{}", line),
                    Err(e) => {
                        tracing::error!("Failed to serialise summary: {}", e);
                        return ExitCode::from(EXIT_FAILURE);
                    }
                }
            } else {
                println!(
                    "[{}] bytes copied from {} to {} in {} ms",
                    summary.bytes_transferred, summary.source, summary.target, summary.duration_ms
                );
            }
            ExitCode::from(EXIT_OK)
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(cli::exit_code(&e))
        }
    }
}
