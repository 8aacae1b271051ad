// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of scenario tests. `#[cephci_testcase]` repacks an async test
//! function into a [`TestOutcome`]-returning future and records it, with
//! its suite metadata, in a distributed inventory the runner enumerates.

pub use anyhow::{Context, Result};
pub use cephci_framework;
pub use cephci_framework::{Framework, FrameworkParameters};
pub use cephci_testcase_macros::*;
pub use futures::future::BoxFuture;
pub use inventory::submit as inventory_submit;
use thiserror::Error;

/// Returned (via `anyhow`) by a test body that cannot run meaningfully in
/// the current cluster configuration. The macro downcasts to this and maps
/// it to [`TestOutcome::Skipped`] instead of a failure.
#[derive(Debug, Error)]
#[error("test skipped: {reason:?}")]
pub struct TestSkippedError {
    pub reason: Option<String>,
}

/// What running one test produced.
#[derive(Debug, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,

    /// Failed, with the rendered error when there was one.
    Failed(Option<String>),

    /// The test declined to run, e.g. a precondition on the cluster shape
    /// was not met. Carries the reason when one was given.
    Skipped(Option<String>),
}

/// Metadata riding on a registered test: the per-test keys of the YAML
/// suites this harness's scenarios descend from.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestMetadata {
    /// Polarion test-management id, e.g. `CEPH-83604848`.
    pub polarion_id: Option<&'static str>,

    /// When set, a failure of this test halts further testing on the
    /// cluster that ran it; the cluster is assumed unfit for whatever was
    /// still queued.
    pub abort_on_fail: bool,
}

/// Fn-pointer wrapper for the test body, so [`TestCase::new`] stays a
/// `const fn` for the inventory record.
pub struct TestFunction {
    pub f: fn(&Framework) -> BoxFuture<'_, TestOutcome>,
}

/// One registered test: where it lives, what it is called, its suite
/// metadata, and the repacked body to execute.
pub struct TestCase {
    pub(crate) module_path: &'static str,
    pub(crate) name: &'static str,
    pub(crate) metadata: TestMetadata,
    pub(crate) function: TestFunction,
}

impl TestCase {
    pub const fn new(
        module_path: &'static str,
        name: &'static str,
        metadata: TestMetadata,
        function: TestFunction,
    ) -> Self {
        Self { module_path, name, metadata, function }
    }

    /// `module_path::function_name`, the name filters match against.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn polarion_id(&self) -> Option<&'static str> {
        self.metadata.polarion_id
    }

    pub fn abort_on_fail(&self) -> bool {
        self.metadata.abort_on_fail
    }

    /// Runs the test body against the supplied cluster context.
    pub async fn run(&self, ctx: &Framework) -> TestOutcome {
        (self.function.f)(ctx).await
    }
}

inventory::collect!(TestCase);

/// True when `name` contains every `must_include` string and none of the
/// `must_exclude` strings.
fn name_matches(
    name: &str,
    must_include: &[String],
    must_exclude: &[String],
) -> bool {
    must_include.iter().all(|inc| name.contains(inc.as_str()))
        && !must_exclude.iter().any(|exc| name.contains(exc.as_str()))
}

pub fn all_test_cases() -> impl Iterator<Item = &'static TestCase> {
    inventory::iter::<TestCase>.into_iter()
}

/// The registered tests whose fully qualified names pass the filters.
pub fn filtered_test_cases<'rule>(
    must_include: &'rule [String],
    must_exclude: &'rule [String],
) -> impl Iterator<Item = &'static TestCase> + 'rule {
    all_test_cases().filter(move |tc| {
        name_matches(&tc.fully_qualified_name(), must_include, must_exclude)
    })
}

/// Returns from a test body early, marking the test as skipped with the
/// supplied reason.
#[macro_export]
macro_rules! cephci_skip {
    ($reason:expr) => {
        return Err($crate::TestSkippedError {
            reason: Some($reason.to_string()),
        }
        .into())
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn nop(_ctx: &Framework) -> BoxFuture<'_, TestOutcome> {
        Box::pin(async { TestOutcome::Passed })
    }

    fn case(metadata: TestMetadata) -> TestCase {
        TestCase::new(
            "cephci_tests::rados",
            "pool_roundtrip",
            metadata,
            TestFunction { f: nop },
        )
    }

    #[test]
    fn fully_qualified_names_join_module_and_function() {
        let tc = case(TestMetadata::default());
        assert_eq!(
            tc.fully_qualified_name(),
            "cephci_tests::rados::pool_roundtrip"
        );
        assert_eq!(tc.name(), "pool_roundtrip");
    }

    #[test]
    fn metadata_defaults_to_no_id_and_no_abort() {
        let tc = case(TestMetadata::default());
        assert_eq!(tc.polarion_id(), None);
        assert!(!tc.abort_on_fail());
    }

    #[test]
    fn metadata_carries_suite_annotations() {
        let tc = case(TestMetadata {
            polarion_id: Some("CEPH-83604848"),
            abort_on_fail: true,
        });
        assert_eq!(tc.polarion_id(), Some("CEPH-83604848"));
        assert!(tc.abort_on_fail());
    }

    #[test]
    fn name_filters_require_every_include_and_no_exclude() {
        let include = vec!["rados".to_string(), "pool".to_string()];
        let exclude = vec!["bench".to_string()];

        let name = "cephci_tests::rados::pool_roundtrip";
        assert!(name_matches(name, &include, &exclude));
        assert!(name_matches(name, &[], &[]));

        assert!(!name_matches(
            "cephci_tests::rados::pool_bench_write",
            &include,
            &exclude
        ));
        assert!(!name_matches(
            "cephci_tests::mon::quorum_recovers",
            &include,
            &exclude
        ));
    }
}
