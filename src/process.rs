use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// One independent subprocess invocation within a batch.
#[derive(Clone, Debug)]
pub struct BatchTask {
    pub id: usize,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Uniform per-task result record. A task that could not even be spawned
/// reports `exit: None` with the failure text as its output.
#[derive(Clone, Debug)]
pub struct BatchTaskResult {
    pub exit: Option<i32>,
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl BatchTaskResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit == Some(0) && !self.timed_out
    }
}

/// Runs batches of independent subprocess tasks with bounded parallelism.
///
/// Output is captured by redirecting both streams to a per-task file in the
/// capture directory and reading it back after the child exits, so a child
/// that fills its pipe can never deadlock the caller. With a single job the
/// batch degrades to strict sequential execution through the same per-task
/// path, preserving the result shape.
pub struct BatchExecutor {
    capture_dir: PathBuf,
    jobs: usize,
}

impl BatchExecutor {
    #[must_use]
    pub fn new(capture_dir: &Path, jobs: usize) -> Self {
        Self {
            capture_dir: capture_dir.to_path_buf(),
            jobs: jobs.max(1),
        }
    }

    pub fn run(&self, tasks: Vec<BatchTask>) -> anyhow::Result<BTreeMap<usize, BatchTaskResult>> {
        let mut results = BTreeMap::new();

        if tasks.is_empty() {
            return Ok(results);
        }

        if self.jobs == 1 || tasks.len() == 1 {
            for task in &tasks {
                results.insert(task.id, self.run_task(task));
            }

            return Ok(results);
        }

        let task_queue: ArrayQueue<BatchTask> = ArrayQueue::new(tasks.len());
        let result_queue: ArrayQueue<(usize, BatchTaskResult)> = ArrayQueue::new(tasks.len());

        for task in tasks {
            if task_queue.push(task).is_err() {
                return Err(anyhow!("Batch task queue was unexpectedly full"));
            }
        }

        std::thread::scope(|scope| {
            let workers = (0..self.jobs)
                .map(|_worker_index| {
                    scope.spawn(|| {
                        while let Some(task) = task_queue.pop() {
                            let id = task.id;
                            let result = self.run_task(&task);

                            if result_queue.push((id, result)).is_err() {
                                warn!("Batch result queue was unexpectedly full");
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            for worker in workers {
                if worker.join().is_err() {
                    warn!("Batch executor worker panicked");
                }
            }
        });

        while let Some((id, result)) = result_queue.pop() {
            results.insert(id, result);
        }

        Ok(results)
    }

    fn run_task(&self, task: &BatchTask) -> BatchTaskResult {
        let capture_path = self.capture_dir.join(format!("task-{:05}.log", task.id));

        run_with_timeout(
            &task.program,
            &task.args,
            task.timeout,
            &capture_path,
        )
    }
}

/// Run a single subprocess with combined output captured to `capture_path`
/// and a hard wall-clock timeout. The capture file is removed after being
/// read back.
pub fn run_with_timeout(
    program: &Path,
    args: &[String],
    timeout: Duration,
    capture_path: &Path,
) -> BatchTaskResult {
    let started = Instant::now();

    match spawn_and_wait(program, args, timeout, capture_path) {
        Ok((exit, timed_out)) => {
            let output = std::fs::read_to_string(capture_path).unwrap_or_default();
            let _ = std::fs::remove_file(capture_path);

            BatchTaskResult {
                exit,
                output,
                duration: started.elapsed(),
                timed_out,
            }
        }
        Err(err) => {
            let _ = std::fs::remove_file(capture_path);

            debug!("Subprocess {program:?} failed to run: {err:#}");

            BatchTaskResult {
                exit: None,
                output: format!("{err:#}"),
                duration: started.elapsed(),
                timed_out: false,
            }
        }
    }
}

fn spawn_and_wait(
    program: &Path,
    args: &[String],
    timeout: Duration,
    capture_path: &Path,
) -> anyhow::Result<(Option<i32>, bool)> {
    let capture_file = std::fs::File::create(capture_path)
        .with_context(|| format!("Unable to create capture file {capture_path:?}"))?;

    let capture_stderr = capture_file
        .try_clone()
        .context("Unable to clone capture file handle")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(capture_file))
        .stderr(Stdio::from(capture_stderr))
        .spawn()
        .with_context(|| format!("Unable to spawn subprocess {program:?}"))?;

    let deadline = Instant::now() + timeout;

    loop {
        match child
            .try_wait()
            .context("Unable to poll subprocess status")?
        {
            Some(status) => return Ok((status.code(), false)),
            None if Instant::now() >= deadline => {
                warn!(
                    "Subprocess {program:?} exceeded its {}s timeout and was killed",
                    timeout.as_secs()
                );

                child
                    .kill()
                    .context("Unable to kill timed-out subprocess")?;
                child
                    .wait()
                    .context("Unable to reap timed-out subprocess")?;

                return Ok((None, true));
            }
            None => std::thread::sleep(WAIT_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: usize, program: &str, args: &[&str], timeout: Duration) -> BatchTask {
        BatchTask {
            id,
            program: PathBuf::from(program),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            timeout,
        }
    }

    #[test]
    fn batch_reports_every_task_by_id() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 2);

        let tasks = (0..4)
            .map(|id| {
                task(
                    id,
                    "sh",
                    &["-c", &format!("echo task-{id}")],
                    Duration::from_secs(10),
                )
            })
            .collect();

        let results = executor.run(tasks).expect("Batch execution failed");

        assert_eq!(results.len(), 4);

        for (id, result) in &results {
            assert!(result.success());
            assert!(result.output.contains(&format!("task-{id}")));
        }
    }

    #[test]
    fn failed_task_does_not_abort_siblings() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 2);

        let tasks = vec![
            task(0, "sh", &["-c", "exit 3"], Duration::from_secs(10)),
            task(1, "sh", &["-c", "echo ok"], Duration::from_secs(10)),
            task(2, "/nonexistent/binary", &[], Duration::from_secs(10)),
        ];

        let results = executor.run(tasks).expect("Batch execution failed");

        assert_eq!(results[&0].exit, Some(3));
        assert!(!results[&0].success());
        assert!(results[&1].success());
        assert_eq!(results[&2].exit, None);
        assert!(!results[&2].timed_out);
    }

    #[test]
    fn timed_out_task_is_killed_and_marked() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 1);

        let tasks = vec![task(
            0,
            "sh",
            &["-c", "sleep 30"],
            Duration::from_millis(200),
        )];

        let started = Instant::now();
        let results = executor.run(tasks).expect("Batch execution failed");

        assert!(results[&0].timed_out);
        assert!(!results[&0].success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn sequential_fallback_matches_parallel_result_shape() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 1);

        let tasks = vec![
            task(7, "sh", &["-c", "echo seven"], Duration::from_secs(10)),
            task(9, "sh", &["-c", "echo nine"], Duration::from_secs(10)),
        ];

        let results = executor.run(tasks).expect("Batch execution failed");

        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![7, 9]);
        assert!(results[&7].output.contains("seven"));
        assert!(results[&9].output.contains("nine"));
    }
}
