// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The command-line surface of a gantry harness binary.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use gantry_metadata::GantryExitCode;
use gantry_runner::{
    config::{FileConfig, RunConfig, ShardSpec},
    errors::{ConfigParseError, LoaderError, PlanError, RunnerBuildError, TreeBuildError},
    list::{Loader, RootRegistry, TestList, TestPlan},
    reporter::{EventAggregator, ReporterKind},
    runner::RunnerBuilder,
    store::CACHE_DIR_ENV,
};
use std::{io::IsTerminal, time::Duration};
use tracing::debug;

/// The default config file, consulted when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "gantry.toml";

/// A parallel test runner with fixtures, projects, and isolated workers.
#[derive(Debug, Parser)]
#[command(name = "gantry", version)]
pub struct GantryApp {
    /// Config file [default: gantry.toml if present]
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(flatten)]
    run_opts: RunOpts,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tests (the default command)
    Run {
        #[clap(flatten)]
        run_opts: RunOpts,
    },

    /// List the planned tests without executing anything
    List {
        #[clap(flatten)]
        run_opts: RunOpts,
    },
}

#[derive(Clone, Debug, Default, Args)]
#[command(next_help_heading = "Runner options")]
struct RunOpts {
    /// Number of worker processes [default: logical CPUs]
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Per-test timeout in milliseconds (0 disables the timeout)
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Number of retries for failing tests
    #[arg(long, value_name = "N")]
    retries: Option<usize>,

    /// Reporters to use, comma-separated
    #[arg(long, value_enum, value_name = "A,B", value_delimiter = ',')]
    reporter: Vec<ReporterKind>,

    /// Root directory for per-test artifacts
    #[arg(long, value_name = "DIR")]
    output: Option<Utf8PathBuf>,

    /// Only run tests whose title path matches this regex
    #[arg(long, value_name = "REGEX")]
    grep: Option<String>,

    /// Only run these projects (may be repeated)
    #[arg(long = "project", value_name = "NAME")]
    projects: Vec<String>,

    /// Run only one shard of the plan, e.g. 2/3
    #[arg(long, value_name = "C/T")]
    shard: Option<ShardSpec>,

    /// Fail the run if any spec is marked `only`
    #[arg(long)]
    forbid_only: bool,

    /// Write snapshots instead of comparing against them
    #[arg(long)]
    update_snapshots: bool,

    /// Stop starting new tests after this many failures
    #[arg(long, value_name = "N")]
    max_failures: Option<usize>,

    /// Cancel the run after this many milliseconds
    #[arg(long, value_name = "MS")]
    global_timeout: Option<u64>,
}

impl RunOpts {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(timeout) = self.timeout {
            config.timeout = Some(Duration::from_millis(timeout));
        }
        if let Some(retries) = self.retries {
            config.retries = Some(retries);
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(grep) = &self.grep {
            config.grep = Some(grep.clone());
        }
        if !self.projects.is_empty() {
            config.project_filter = self.projects.clone();
        }
        if let Some(shard) = self.shard {
            config.shard = Some(shard);
        }
        if self.forbid_only {
            config.forbid_only = true;
        }
        if self.update_snapshots {
            config.update_snapshots = true;
        }
        if let Some(max_failures) = self.max_failures {
            config.max_failures = Some(max_failures);
        }
        if let Some(global_timeout) = self.global_timeout {
            config.global_timeout = Some(Duration::from_millis(global_timeout));
        }
    }
}

/// An error the CLI reports to the user before exiting with
/// [`GantryExitCode::SETUP_ERROR`].
#[derive(Debug, thiserror::Error)]
enum ExpectedError {
    #[error(transparent)]
    Config(#[from] ConfigParseError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    TreeBuild(#[from] TreeBuildError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    RunnerBuild(#[from] RunnerBuildError),
}

/// Parses arguments and executes. Returns the process exit code.
pub(crate) fn parse_and_exec(loader: &dyn Loader) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let app = GantryApp::parse();
    match app.exec(loader) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(err) = source {
                eprintln!("  caused by: {err}");
                source = err.source();
            }
            GantryExitCode::SETUP_ERROR
        }
    }
}

impl GantryApp {
    fn exec(self, loader: &dyn Loader) -> Result<i32, ExpectedError> {
        let GantryApp {
            config: config_file,
            command,
            run_opts,
        } = self;
        let (run_opts, list_only) = match command {
            Some(Command::Run { run_opts }) => (run_opts, false),
            Some(Command::List { run_opts }) => (run_opts, true),
            None => (run_opts, false),
        };

        let mut config = load_config(config_file.as_deref())?;
        run_opts.apply(&mut config);

        let mut registry = RootRegistry::new();
        loader.load(&mut registry)?;
        let list = TestList::build(registry, &config)?;
        let plan = TestPlan::build(&list, &config)?;

        if list_only {
            for entry in plan.entries() {
                let marker = if entry.skip.is_some() { " (skipped)" } else { "" };
                println!("{}{marker}", entry.instance.name());
            }
            println!(
                "{} tests planned across {} projects",
                plan.initial_run_count(),
                config.projects.len()
            );
            return Ok(GantryExitCode::OK);
        }

        // Workers inherit the cache directory through the environment.
        if std::env::var_os(CACHE_DIR_ENV).is_none() {
            std::env::set_var(CACHE_DIR_ENV, config.output_dir.join(".cache"));
        }

        let colorize = std::io::stdout().is_terminal();
        let kinds = if run_opts.reporter.is_empty() {
            vec![ReporterKind::List]
        } else {
            run_opts.reporter.clone()
        };
        let reporters = kinds
            .into_iter()
            .map(|kind| kind.build(&config.output_dir, colorize))
            .collect();
        let mut aggregator = EventAggregator::new(&config, &list, reporters);

        let runner = RunnerBuilder::new().build(&plan, &config)?;
        debug!(
            tests = plan.initial_run_count(),
            workers = config.workers,
            "starting run"
        );
        let (stats, status) = runner.execute(|event| aggregator.write_event(event));
        debug!(?status, ?stats, "run finished");

        Ok(status.exit_code())
    }
}

fn load_config(config_file: Option<&camino::Utf8Path>) -> Result<RunConfig, ConfigParseError> {
    match config_file {
        Some(path) => Ok(FileConfig::load(path)?.into_run_config()),
        None => {
            let default = Utf8PathBuf::from(DEFAULT_CONFIG_FILE);
            if default.exists() {
                Ok(FileConfig::load(&default)?.into_run_config())
            } else {
                Ok(RunConfig::default())
            }
        }
    }
}
