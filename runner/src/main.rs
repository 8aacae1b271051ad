// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;
mod execute;
mod fixtures;

use anyhow::Context;
use cephci_framework::compute;
use cephci_framework::config::{load_yaml, CredentialsFile};
use clap::Parser;
use config::{CleanupOptions, ListOptions, ProcessArgs, RunOptions};
use tracing::{debug, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::execute::ExecutionStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    set_tracing_subscriber(&runner_args);

    info!(?runner_args);

    match &runner_args.command {
        config::Command::Run(opts) => {
            let exit_code = run_tests(opts).await?.tests_failed;
            debug!(exit_code);
            std::process::exit(exit_code.try_into()?);
        }
        config::Command::List(opts) => list_tests(opts),
        config::Command::Cleanup(opts) => cleanup_nodes(opts).await?,
    }

    Ok(())
}

async fn run_tests(run_opts: &RunOptions) -> anyhow::Result<ExecutionStats> {
    let mut executions = vec![fixtures::execution_setup(run_opts).await?];

    let execution_stats =
        execute::run_tests_with_ctx(&mut executions, run_opts).await;
    if !execution_stats.failed_test_cases.is_empty() {
        println!("\nfailures:");
        for tc in &execution_stats.failed_test_cases {
            println!("    {}", tc.fully_qualified_name());
        }
        println!();
    }

    println!(
        "test result: {}. {} passed; {} failed; {} skipped; {} not run; \
        finished in {:.2}s\n",
        if execution_stats.tests_failed != 0 { "FAILED" } else { "ok" },
        execution_stats.tests_passed,
        execution_stats.tests_failed,
        execution_stats.tests_skipped,
        execution_stats.tests_not_run,
        execution_stats.duration.as_secs_f64()
    );

    Ok(execution_stats)
}

fn list_tests(list_opts: &ListOptions) {
    println!("Tests enabled after applying filters:\n");

    let mut count = 0;
    for tc in cephci_tests::cephci_testcase::filtered_test_cases(
        &list_opts.include_filter,
        &list_opts.exclude_filter,
    ) {
        match tc.polarion_id() {
            Some(id) => println!("    {} ({id})", tc.fully_qualified_name()),
            None => println!("    {}", tc.fully_qualified_name()),
        }
        count += 1
    }

    println!("\n{} test(s) selected", count);
}

async fn cleanup_nodes(opts: &CleanupOptions) -> anyhow::Result<()> {
    let credentials: CredentialsFile = load_yaml(&opts.credentials)?;
    let provider =
        compute::build_provider(opts.provider, &credentials.globals).await?;

    info!(provider = %opts.provider, pattern = %opts.pattern, "sweeping nodes");
    let destroyed =
        provider.cleanup(&opts.pattern).await.context("node sweep failed")?;
    println!("{destroyed} node(s) destroyed");

    Ok(())
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("cephci-runner".into(), std::io::stdout);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stdout_log = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stdout_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}
