use std::{fs, io};

use clap::{CommandFactory, FromArgMatches};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fragtreer::{FragTreer, FragTreerError};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn make_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

/// Log to STDERR, and to `log_file` too when given. The returned guard must be held
/// until the program exits so the file writer is flushed.
fn init_logging(args: &FragTreer) -> Result<Option<WorkerGuard>, FragTreerError> {
    let stderr_layer = fmt::layer()
        .compact()
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_writer(io::stderr)
        .with_filter(make_filter());

    if let Some(path) = args.log_file() {
        let handle = fs::File::create(path)?;
        let (writer, guard) = tracing_appender::non_blocking(handle);
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(make_filter()),
            )
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
        Ok(None)
    }
}

fn main() -> Result<(), FragTreerError> {
    let matches = FragTreer::command().get_matches();
    let args = FragTreer::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let args = args.configure(&matches)?;
    let _guard = init_logging(&args)?;
    if let Err(e) = args.main() {
        error!("An error occurred: {e}");
        return Err(e);
    }
    Ok(())
}
