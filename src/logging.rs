use std::path::Path;

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// If a global tracing subscriber is not already configured, log to stderr and to `file_path`,
/// and add a panic hook pointing at the log file.
///
/// `log` records from the whole crate are forwarded to the subscriber.
pub fn install_file_logger(file_path: &Path) {
    let directory = file_path.parent().unwrap_or_else(|| Path::new("."));
    if std::fs::create_dir_all(directory).is_err() {
        install_stderr_logger();
        return;
    }

    let Some(file_name) = file_path.file_name() else {
        install_stderr_logger();
        return;
    };

    let writer = tracing_appender::rolling::never(directory, file_name);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(skip_noisy_dependencies));

    if registry()
        .with(file_layer)
        .with(stderr_layer())
        .try_init()
        .is_ok()
    {
        update_panic_hook(file_path);
    }
}

/// Console only logger, for commands that produce no artifacts.
pub fn install_stderr_logger() {
    let _ = registry().with(stderr_layer()).try_init();
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing_core::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(skip_noisy_dependencies))
}

fn skip_noisy_dependencies(metadata: &tracing_core::Metadata<'_>) -> bool {
    match metadata.module_path() {
        // Backend internals log at `info` on every kernel launch.
        Some(path) if path.starts_with("burn") || path.starts_with("cubecl") => {
            *metadata.level() < Level::INFO
        }
        _ => true,
    }
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}
