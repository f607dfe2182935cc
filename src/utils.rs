use std::sync::LazyLock;

use indicatif::ProgressStyle;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

static JOB_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Style of the per-cycle progress bar.
pub(crate) fn progress_style() -> ProgressStyle {
    PROGRESS_STYLE.clone()
}

/// Style of a single running job.
pub(crate) fn job_style() -> ProgressStyle {
    JOB_STYLE.clone()
}

/// Installs a global subscriber printing to stderr, with progress bars
/// drawn by `tracing-indicatif`.
///
/// The filter is read from `RUST_LOG` and falls back to `level`. Fails if a
/// global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, Registry, fmt};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let indicatif = IndicatifLayer::new();

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_styles_build() {
        let _ = progress_style();
        let _ = job_style();
    }
}
