use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

const ANSI_BLUE: Style = Style::new().blue();

/// Time elapsed since `s`, styled as a log suffix.
pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Progress bar for the whole workflow run.
pub(crate) fn get_style_run() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Spinner for a single running node.
pub(crate) fn get_style_node() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

/// Installs a global `tracing` subscriber that prints through the progress
/// bars instead of tearing them.
///
/// The filter is read from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();
}
