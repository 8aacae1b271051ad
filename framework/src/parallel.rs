// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spawn-and-join task groups for concurrent provisioning and teardown.
//!
//! There is deliberately no scheduling policy here: tasks start when
//! spawned, run concurrently, and the group waits for all of them. The only
//! guarantees are that every task is awaited and that no failure is
//! silently dropped.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::error;

pub struct Parallel<T> {
    tasks: JoinSet<anyhow::Result<T>>,
}

impl<T: Send + 'static> Parallel<T> {
    pub fn new() -> Self {
        Self { tasks: JoinSet::new() }
    }

    pub fn spawn(
        &mut self,
        task: impl Future<Output = anyhow::Result<T>> + Send + 'static,
    ) {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task. Returns the collected values, or the first
    /// error once all tasks have finished. Results are in completion order,
    /// not spawn order.
    pub async fn join_all(mut self) -> anyhow::Result<Vec<T>> {
        let mut values = Vec::with_capacity(self.tasks.len());
        let mut first_err = None;

        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::Error::new(join_err)),
            };

            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    error!(error = %e, "parallel task failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }

    /// Waits for every task and hands back each result individually. Used
    /// on teardown paths, which must attempt everything regardless of
    /// failures.
    pub async fn join_all_settled(mut self) -> Vec<anyhow::Result<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());

        while let Some(joined) = self.tasks.join_next().await {
            results.push(match joined {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::Error::new(join_err)),
            });
        }

        results
    }
}

impl<T: Send + 'static> Default for Parallel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::Parallel;

    #[tokio::test]
    async fn join_all_collects_every_value() {
        let mut group = Parallel::new();
        for i in 0..5u32 {
            group.spawn(async move { Ok(i) });
        }
        assert_eq!(group.len(), 5);

        let mut values = group.join_all().await.unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn one_failure_still_awaits_the_rest() {
        let completed = Arc::new(AtomicU32::new(0));
        let mut group = Parallel::new();

        group.spawn(async { Err(anyhow::anyhow!("provisioning failed")) });
        for _ in 0..4 {
            let completed = completed.clone();
            group.spawn(async move {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = group.join_all().await.unwrap_err();
        assert!(err.to_string().contains("provisioning failed"));
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn settled_join_reports_each_result() {
        let mut group = Parallel::new();
        group.spawn(async { Ok(1u32) });
        group.spawn(async { Err(anyhow::anyhow!("teardown hiccup")) });
        group.spawn(async { Ok(3u32) });

        let results = group.join_all_settled().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }
}
