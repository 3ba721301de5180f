use anyhow::{bail, Result};
use clap::Parser;
use fsevents_sdk::{Backend, CreateFlags, EventId, EventSequence, MAX_EXCLUSION_PATHS};
use futures::StreamExt;
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Print file system events under the given paths until interrupted.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Paths to watch.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Coalescing latency in seconds.
    #[arg(long, default_value_t = 0.1)]
    latency: f64,
    /// Replay history after this event ID instead of starting from now.
    #[arg(long)]
    since: Option<u64>,
    /// Report individual files instead of their directories.
    #[arg(long)]
    file_events: bool,
    #[arg(long)]
    no_defer: bool,
    #[arg(long)]
    watch_root: bool,
    #[arg(long, conflicts_with = "mark_self")]
    ignore_self: bool,
    #[arg(long)]
    mark_self: bool,
    /// Subtree to leave out; may be given up to 8 times.
    #[arg(long = "exclude")]
    exclusions: Vec<PathBuf>,
}

impl Cli {
    fn flags(&self) -> CreateFlags {
        let mut flags = CreateFlags::empty();
        flags.set(CreateFlags::FILE_EVENTS, self.file_events);
        flags.set(CreateFlags::NO_DEFER, self.no_defer);
        flags.set(CreateFlags::WATCH_ROOT, self.watch_root);
        flags.set(CreateFlags::IGNORE_SELF, self.ignore_self);
        flags.set(CreateFlags::MARK_SELF, self.mark_self);
        flags
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.exclusions.len() > MAX_EXCLUSION_PATHS {
        bail!("at most {MAX_EXCLUSION_PATHS} --exclude paths are supported");
    }
    let latency = Duration::try_from_secs_f64(cli.latency)?;
    let backend = Backend::default();
    info!(
        backend = backend.name(),
        current = %backend.current_event_id(),
        paths = ?cli.paths,
        "watching"
    );

    let mut events = EventSequence::new(&cli.paths)
        .backend(backend)
        .since(cli.since.map_or(EventId::SINCE_NOW, EventId))
        .latency(latency)
        .flags(cli.flags())
        .exclude(&cli.exclusions);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => println!("{event} {:?}", event.scan_type()),
                None => bail!("event stream ended; see the log for why"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    events.cancel();
    Ok(())
}
