//! Concurrent execution over a dependency graph.
//!
//! Every type whose dependencies have all completed is launched at once; the
//! scheduler then waits for whichever in-flight task finishes first and
//! releases its dependents. Independent branches therefore run concurrently,
//! with no cap beyond how many types are ready at the same moment.

use crate::{DependencyGraph, Error, RecordType};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use tracing::{debug, warn};

impl DependencyGraph {
    /// Run `task` once per type, never starting a type before all of its
    /// dependencies have finished successfully.
    ///
    /// Results come back in completion order. On the first failure no further
    /// types are launched, tasks already in flight are driven to completion,
    /// and the failure is returned. A cycle surfaces as
    /// [`Error::CyclicDependency`] once nothing is running and nothing is ready.
    pub async fn run<F, Fut, T, E>(&self, mut task: F) -> Result<Vec<(RecordType, T)>, E>
    where
        F: FnMut(RecordType) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let count = self.len();
        let dependents = self.dependents();
        let mut unresolved: Vec<usize> = self
            .dependency_indexes()
            .iter()
            .map(|deps| deps.len())
            .collect();
        let mut done = vec![false; count];
        let mut ready: VecDeque<usize> = (0..count).filter(|&i| unresolved[i] == 0).collect();
        let mut running = FuturesUnordered::new();
        let mut results = Vec::with_capacity(count);
        let mut failure: Option<E> = None;

        loop {
            if failure.is_none() {
                while let Some(i) = ready.pop_front() {
                    let name = self.types()[i].clone();
                    debug!(record_type = %name, "scheduler launching");
                    running.push(task(name).map(move |result| (i, result)));
                }
            }

            let Some((i, result)) = running.next().await else {
                break;
            };

            match result {
                Ok(value) => {
                    done[i] = true;
                    results.push((self.types()[i].clone(), value));
                    for &child in &dependents[i] {
                        unresolved[child] -= 1;
                        if unresolved[child] == 0 {
                            ready.push_back(child);
                        }
                    }
                }
                Err(err) => {
                    warn!(record_type = %self.types()[i], "scheduled task failed");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        if results.len() < count {
            let stuck: Vec<usize> = (0..count).filter(|&i| !done[i]).collect();
            return Err(self.cycle_error(&stuck, &done).into());
        }

        Ok(results)
    }
}
