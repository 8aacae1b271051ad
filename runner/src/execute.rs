// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cephci_tests::cephci_testcase::{Framework, TestCase, TestOutcome};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::RunOptions;
use crate::fixtures::TestFixtures;

/// Statistics returned after executing a set of tests.
pub struct ExecutionStats {
    /// The number of tests that passed.
    pub tests_passed: u32,

    /// The number of tests that failed.
    pub tests_failed: u32,

    /// The number of tests that marked themselves as skipped.
    pub tests_skipped: u32,

    /// The number of tests the runner decided not to run (e.g. because a
    /// fixture failed partway through the queue).
    pub tests_not_run: u32,

    /// The total time spent running tests and fixtures, from just before
    /// the first per-test setup to just after the final teardown.
    pub duration: Duration,

    /// The test cases that returned a failed result.
    pub failed_test_cases: Vec<&'static TestCase>,
}

/// Executes every selected test against the supplied cluster contexts.
pub async fn run_tests_with_ctx(
    ctx: &mut Vec<(Arc<Framework>, TestFixtures)>,
    run_opts: &RunOptions,
) -> ExecutionStats {
    let mut executions = Vec::new();

    for tc in cephci_tests::cephci_testcase::filtered_test_cases(
        &run_opts.include_filter,
        &run_opts.exclude_filter,
    ) {
        executions.push(tc);
    }

    let stats = ExecutionStats {
        tests_passed: 0,
        tests_failed: 0,
        tests_skipped: 0,
        tests_not_run: executions.len() as u32,
        duration: Duration::default(),
        failed_test_cases: Vec::new(),
    };

    if executions.is_empty() {
        info!("No tests selected for execution");
        return stats;
    }

    let stats = Arc::new(Mutex::new(stats));

    async fn run_tests(
        execution_rx: crossbeam_channel::Receiver<&'static TestCase>,
        test_ctx: Arc<Framework>,
        mut fixtures: TestFixtures,
        stats: Arc<Mutex<ExecutionStats>>,
        sigint_rx: watch::Receiver<bool>,
    ) -> Result<(), ()> {
        loop {
            // Check for SIGINT only at the top of the loop. The recv()
            // below returns immediately, because either test cases remain
            // in the queue or the sender is closed; the only long blocking
            // operation to guard in this loop is the test run itself.
            if *sigint_rx.borrow() {
                info!("Test run interrupted by SIGINT");
                break;
            }

            let tc = match execution_rx.recv() {
                Ok(tc) => tc,
                // RecvError means the channel is closed: all done.
                Err(_) => break,
            };

            match tc.polarion_id() {
                Some(id) => {
                    info!("Starting test {} ({id})", tc.fully_qualified_name())
                }
                None => info!("Starting test {}", tc.fully_qualified_name()),
            }

            // A fixture failure means the cluster is not fit to take more
            // tests. Stop and report what already ran.
            if let Err(e) = fixtures.test_setup().await {
                error!("Error running test setup fixture: {e:#}");
                break;
            }

            {
                let mut stats = stats.lock().unwrap();
                stats.tests_not_run -= 1;
            }

            let timeout = test_ctx.test_timeout();
            let test_outcome = match tokio::time::timeout(
                timeout,
                tc.run(test_ctx.as_ref()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => TestOutcome::Failed(Some(format!(
                    "test timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            info!(
                "test {} ... {}{}",
                tc.fully_qualified_name(),
                match test_outcome {
                    TestOutcome::Passed => "ok",
                    TestOutcome::Failed(_) => "FAILED: ",
                    TestOutcome::Skipped(_) => "skipped: ",
                },
                match &test_outcome {
                    TestOutcome::Failed(Some(s))
                    | TestOutcome::Skipped(Some(s)) => s,
                    TestOutcome::Failed(None) | TestOutcome::Skipped(None) =>
                        "[no message]",
                    _ => "",
                }
            );

            let failed = matches!(test_outcome, TestOutcome::Failed(_));
            {
                let mut stats = stats.lock().unwrap();
                match test_outcome {
                    TestOutcome::Passed => stats.tests_passed += 1,
                    TestOutcome::Failed(_) => {
                        stats.tests_failed += 1;
                        stats.failed_test_cases.push(tc);
                    }
                    TestOutcome::Skipped(_) => stats.tests_skipped += 1,
                }
            }

            if let Err(e) = fixtures.test_cleanup().await {
                error!("Error running cleanup fixture: {e:#}");
                break;
            }

            // A failed abort-on-fail test leaves this cluster unfit for
            // whatever was still queued.
            if failed && tc.abort_on_fail() {
                error!(
                    "{} failed with abort-on-fail set; not running further \
                     tests on this cluster",
                    tc.fully_qualified_name()
                );
                break;
            }
        }

        if let Err(e) = fixtures.execution_cleanup().await {
            error!("Error tearing the cluster down: {e:#}");
        }

        Ok(())
    }

    let sigint_rx = set_sigint_handler();
    info!("Running {} test(s)", executions.len());
    let start_time = Instant::now();

    let (execution_tx, execution_rx) =
        crossbeam_channel::unbounded::<&'static TestCase>();

    let mut test_runners = tokio::task::JoinSet::new();

    for (ctx, fixtures) in ctx.drain(..) {
        test_runners.spawn(run_tests(
            execution_rx.clone(),
            ctx,
            fixtures,
            Arc::clone(&stats),
            sigint_rx.clone(),
        ));
    }

    for tc in executions {
        execution_tx.send(tc).expect("workers hold the receiver");
    }
    std::mem::drop(execution_tx);

    while test_runners.join_next().await.is_some() {}

    let mut stats =
        Mutex::into_inner(Arc::into_inner(stats).expect("only one ref"))
            .expect("lock not panicked");
    stats.duration = start_time.elapsed();

    stats
}

/// Installs a global SIGINT handler. The first SIGINT publishes `true` on
/// the returned channel so workers can stop between tests; a second SIGINT
/// exits immediately with the customary 130, at the cost of leaking
/// whatever was still running.
fn set_sigint_handler() -> watch::Receiver<bool> {
    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to set SIGINT handler");

    let (sigint_tx, sigint_rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            sigint.recv().await;

            if *sigint_tx.borrow() {
                error!(
                    "SIGINT received while shutting down, rudely terminating"
                );
                error!("provisioned nodes may have been leaked!");
                std::process::exit(130);
            }

            warn!("SIGINT received, sending shutdown signal to tests");
            let _ = sigint_tx.send(true);
        }
    });

    sigint_rx
}
