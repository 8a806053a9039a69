use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use eddie_mirror_lib::{config, Confirm, EventSink, TracingSink};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, Layer};

/// Yes/no on the controlling terminal.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{} [y/N] ", prompt);
        let _ = stderr.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eddie_mirror_lib=info,eddie_mirror=info,warn".into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
        .init();

    let loaded = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => config::load_from_path(&path),
        None => config::load_default(),
    };
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight batches");
                cancel.cancel();
            }
        });
    }

    let confirm: Option<Arc<dyn Confirm>> = if std::io::stdin().is_terminal() {
        Some(Arc::new(StdinConfirm))
    } else {
        None
    };
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    match eddie_mirror_lib::run(settings, sink, confirm, cancel).await {
        Ok(report) if report.interrupted => ExitCode::from(130),
        Ok(report) if report.aborted > 0 => {
            warn!(aborted = report.aborted, "Some mailboxes did not finish");
            ExitCode::from(1)
        }
        Ok(report) => {
            info!(processed = report.processed, "Mirror up to date");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
