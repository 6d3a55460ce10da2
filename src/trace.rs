use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `levels` accepts anything `EnvFilter`
/// understands, e.g. `info` or `pvesd=debug,hyper=warn`.
pub fn init(color: bool, levels: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_new(levels)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_writer(std::io::stderr)
        .try_init()
}
