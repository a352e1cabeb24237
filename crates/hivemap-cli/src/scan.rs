//! `hivemap scan`: walk a file view by view.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use hivemap_config::{log_cli_info, Config};
use hivemap_view::{CacheStats, MmapCacheManager, ViewCacheRegistry};

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// File to scan
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Views kept resident per file
    #[arg(long)]
    max_views: Option<u32>,

    /// View size in bytes (power of two)
    #[arg(long)]
    view_size: Option<u32>,

    /// Pin and unpin every Nth view
    #[arg(long, value_name = "N")]
    pin_every: Option<usize>,
}

/// Totals of one scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub views: usize,
    pub pinned: usize,
    pub bytes: u64,
    pub checksum: u64,
    pub stats: CacheStats,
}

pub fn run(config: &Config, args: ScanArgs) -> Result<()> {
    let mut config = config.clone();
    if let Some(n) = args.max_views {
        config.views.max_views_per_file = n;
    }
    if let Some(n) = args.view_size {
        config.views.view_size = n;
    }
    config.validate().context("Invalid view settings")?;

    let report = scan(&config, &args.file, args.pin_every)?;

    println!();
    println!("  hivemap scan: {}", args.file.display());
    println!("  ========================================");
    println!("  Views walked:   {}", report.views);
    println!("  Views pinned:   {}", report.pinned);
    println!("  Bytes read:     {}", report.bytes);
    println!("  Checksum:       {:#018x}", report.checksum);
    println!();
    let s = report.stats;
    println!("  Resident:       {} / {}", s.resident, s.max_views);
    println!("  Mapped:         {}", s.mapped);
    println!("  Hits / maps:    {} / {}", s.hits, s.maps);
    println!("  Evictions:      {}", s.evictions);
    println!("  Sweeps:         {}", s.sweeps);
    println!("  Over cap:       {}", s.over_cap);
    println!("  Pins / unpins:  {} / {}", s.pins, s.unpins);
    Ok(())
}

pub fn scan(config: &Config, path: &std::path::Path, pin_every: Option<usize>) -> Result<ScanReport> {
    let host = Arc::new(MmapCacheManager::new(&config.host));
    let registry = ViewCacheRegistry::new(host, config);
    let file = registry
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let view_size = u64::from(config.views.view_size);
    let mut report = ScanReport::default();
    {
        let mut guard = file.lock_exclusive();
        let mut offset = 0;
        while offset < file.len() {
            let view = guard
                .map(offset)
                .with_context(|| format!("Failed to map view at {offset:#x}"))?;
            report.bytes += u64::from(view.len());
            report.checksum = view
                .bytes()
                .iter()
                .fold(report.checksum, |acc, b| acc.rotate_left(5) ^ u64::from(*b));

            let pin_this = pin_every.is_some_and(|n| n > 0 && report.views % n == 0);
            if pin_this {
                let pinned = guard
                    .pin(&view)
                    .with_context(|| format!("Failed to pin view at {offset:#x}"))?;
                drop(view);
                guard
                    .unpin(pinned, false)
                    .with_context(|| format!("Failed to unpin view at {offset:#x}"))?;
                report.pinned += 1;
            }
            report.views += 1;
            offset += view_size;
        }
    }
    report.stats = file.stats();
    log_cli_info!("Scan complete", views = report.views, bytes = report.bytes);

    registry.close(file.id()).context("Failed to close file")?;
    Ok(report)
}
