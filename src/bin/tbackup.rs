use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use thinbak::archiver::{new_cancel_flag, RunOptions, SystemDeviceOpener, ThinArchiver};
use thinbak::manifest::JsonFileArchiveStore;
use thinbak::manifest_fetcher::RepositoryFetcher;
use thinbak::report::mk_report;
use thinbak::tools::SystemToolRunner;

//------------------------------------------

/// Back up one or more thin logical volumes incrementally into a
/// deduplicating local archive.
#[derive(Parser)]
#[command(name = "tbackup")]
struct Cli {
    /// Suppress informational output; only errors are printed.
    #[arg(long)]
    quiet: bool,

    /// Discard the previous `_last` archive after a successful run instead
    /// of retaining it as `_prev`.
    #[arg(long)]
    purge_previous: bool,

    /// Thin pool allocation unit, in bytes.
    #[arg(long, default_value_t = 65536)]
    block_size: u64,

    /// Directory holding the archive manifests and chunk store.
    #[arg(long, default_value = "/var/lib/tbackup")]
    repo: PathBuf,

    /// One or more `vg/lv` volumes to back up.
    #[arg(required = true)]
    volumes: Vec<String>,
}

fn parse_volume(spec: &str) -> Result<(String, String)> {
    let (vg, lv) = spec
        .split_once('/')
        .ok_or_else(|| anyhow!("'{spec}' is not a vg/lv pair"))?;
    Ok((vg.to_string(), lv.to_string()))
}

fn run(cli: Cli) -> Result<exitcode::ExitCode> {
    let volumes = cli
        .volumes
        .iter()
        .map(|s| parse_volume(s))
        .collect::<Result<Vec<_>>>()?;

    let report = mk_report(cli.quiet);
    let tools = SystemToolRunner;
    let store = JsonFileArchiveStore::new(&cli.repo)
        .with_context(|| format!("opening archive repository at '{}'", cli.repo.display()))?;
    let fetcher = RepositoryFetcher::new(&cli.repo);
    let device_opener = SystemDeviceOpener;
    let cancel = new_cancel_flag();

    let archiver = ThinArchiver::new(
        &tools,
        &store,
        &fetcher,
        &device_opener,
        Arc::clone(&report),
        cli.block_size,
        cancel,
    );

    let opts = RunOptions {
        volumes,
        retain_last: !cli.purge_previous,
    };

    let failed = archiver
        .run(&opts)
        .map_err(|e| anyhow::Error::new(e).context("backup run aborted"))?;

    report.finish_progress();

    if failed.is_empty() {
        Ok(exitcode::OK)
    } else {
        Ok(exitcode::SOFTWARE)
    }
}

fn main() {
    let cli = Cli::parse();
    let quiet = cli.quiet;
    let report = mk_report(quiet);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report.fatal(&format!("{e:#}"));
            std::process::exit(exitcode::SOFTWARE);
        }
    }
}

//------------------------------------------
