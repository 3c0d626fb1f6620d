//! Encrypt an existing plaintext payment store in place.
//!
//! Usage: `paygate-encrypt [--remove-plaintext]`, reading `PAYGATE_STORE_DIR`
//! and `PAYGATE_STORE_KEY_PATH` like the daemon.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::{encrypt_existing, MigrationOptions, PaywallConfig};

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut options = MigrationOptions::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--remove-plaintext" => options.remove_plaintext = true,
            other => {
                tracing::error!("unknown argument: {other}");
                eprintln!("usage: paygate-encrypt [--remove-plaintext]");
                std::process::exit(2);
            }
        }
    }

    let config = match PaywallConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    match encrypt_existing(&config.store_dir, &config.store_key_path, options) {
        Ok(report) => {
            println!(
                "processed: {}, skipped: {}, diverged: {}, failed: {}",
                report.processed, report.skipped, report.diverged, report.failed
            );
            if report.failed > 0 || report.diverged > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("Migration failed: {e}");
            std::process::exit(1);
        }
    }
}
