use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

/// Elapsed time since `s`, rendered as a dim blue suffix for log lines.
pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let style = Style::new().blue();
    style.apply_to(format!("(+{}ms)", s.elapsed().as_millis()))
}

pub(crate) fn get_style_workflow() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=>-"))
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
}

/// Installs a stderr subscriber that cooperates with the progress bars.
///
/// Only the first call has an effect. The filter is read from `RUST_LOG` and
/// defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use std::sync::Once;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let indicatif = tracing_indicatif::IndicatifLayer::new();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
            .with(indicatif)
            .try_init();

        if let Err(err) = result {
            eprintln!("logging was already initialized: {err}");
        }
    });
}
