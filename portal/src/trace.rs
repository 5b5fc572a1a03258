use anyhow::{anyhow, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber.
///
/// Only the portal crates log at `level`. Records that upstream crates emit
/// through `log` are bridged by the subscriber and filtered out.
pub fn init_tracing(level: LevelFilter) -> Result<()> {
    if level == LevelFilter::OFF {
        return Ok(());
    }

    let is_terminal = atty::is(atty::Stream::Stderr);

    let builder = FmtSubscriber::builder()
        .with_env_filter(format!(
            "portal={level},portal_feed={level},walrus_pool={level}"
        ))
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_target(false);

    let result = if !is_terminal {
        builder.without_time().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("Failed to initialize tracing: {}", e))?;

    tracing::debug!("Initialized tracing with level: {}", level);

    Ok(())
}
