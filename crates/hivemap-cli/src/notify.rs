//! `hivemap notify`: a round trip through the change hub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use hivemap_config::{log_cli_info, Config};
use hivemap_notify::{
    AllowAll, ChangeFilter, HiveId, KeyTree, NotifyHub, Principal, WaitResult, WatchSpec,
    WorkerDelivery,
};

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Key to watch
    #[arg(long, default_value = "/machine/software")]
    watch: String,

    /// Key changed by the reporting thread
    #[arg(long, default_value = "/machine/software/vendor/app")]
    change: String,

    /// Watch the whole subtree
    #[arg(long)]
    subtree: bool,

    /// Also watch this key, mounted as a separate file
    #[arg(long)]
    secondary: Option<String>,

    /// Wait limit in milliseconds (defaults to notify.sync_wait_ms)
    #[arg(long)]
    wait_ms: Option<u64>,
}

pub fn run(config: &Config, args: NotifyArgs) -> Result<()> {
    let wait = Duration::from_millis(args.wait_ms.unwrap_or(config.notify.sync_wait_ms));
    let result = round_trip(config, &args, wait)?;
    println!("{}: {:?}", args.watch, result);
    Ok(())
}

pub fn round_trip(config: &Config, args: &NotifyArgs, wait: Duration) -> Result<WaitResult> {
    let tree = Arc::new(KeyTree::new());
    let delivery =
        Arc::new(WorkerDelivery::from_config(&config.notify).context("Failed to start delivery worker")?);
    let hub = NotifyHub::new(tree.clone(), Arc::new(AllowAll), delivery.clone());
    let principal = Principal::new("hivemap-cli");

    let watched = hub
        .open_key(tree.create(&args.watch), principal.clone())
        .context("Failed to open watched key")?;
    let secondary = match &args.secondary {
        Some(path) => Some(
            hub.open_key(tree.mount(path, HiveId(1)), principal)
                .context("Failed to open secondary key")?,
        ),
        None => None,
    };
    let changed = tree.create(&args.change);

    let mut spec = WatchSpec::new(ChangeFilter::LAST_SET | ChangeFilter::NAME);
    if args.subtree {
        spec = spec.subtree();
    }
    if let Some(secondary) = &secondary {
        spec = spec.with_secondary(secondary);
    }
    let mut waiter = hub.watch_sync(&watched, &spec).context("Watch failed")?;
    log_cli_info!(
        "Watch queued",
        key = tracing::field::display(&args.watch),
        outcome = tracing::field::debug(waiter.outcome())
    );

    let reporter = hub.clone();
    let dispatched = std::thread::spawn(move || reporter.report_change(changed, ChangeFilter::LAST_SET))
        .join()
        .map_err(|_| anyhow::anyhow!("reporting thread panicked"))?;
    log_cli_info!("Change reported", dispatched = dispatched);

    let result = waiter.wait(Some(wait));
    drop(waiter);
    drop(secondary);
    drop(watched);
    delivery.shutdown();
    Ok(result)
}
