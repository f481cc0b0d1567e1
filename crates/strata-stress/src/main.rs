use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use strata_cache::TableConfig;
use strata_cache::config::Config;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Persist into a temporary directory instead of the configured table.
    #[arg(long)]
    fs: bool,

    /// Send metrics to a local sink that discards them.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    workloads.validate()?;

    let mut config = Config::get(cli.config.as_deref())?;

    // SAFETY: the runtime is not started yet, so this is still single threaded.
    unsafe { logging::init_logging(&config) };

    if cli.metrics {
        let sink = logging::spawn_metrics_sink().context("failed to start metrics sink")?;
        config.metrics.statsd = Some(sink.to_string());
        config
            .metrics
            .custom_tags
            .insert("env".into(), "stresstest".into());
    }
    config.configure_metrics()?;

    let table_dir = match cli.fs {
        true => {
            let dir = tempfile::tempdir().context("failed to create table directory")?;
            config.store.table = TableConfig::Filesystem {
                path: dir.path().to_owned(),
            };
            Some(dir)
        }
        false => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(stresstest::perform_stresstest(
        config.store,
        workloads,
        cli.duration,
    ))?;

    drop(table_dir);
    Ok(())
}
