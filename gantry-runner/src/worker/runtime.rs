// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request loop that runs inside a worker process.
//!
//! A worker reads `Init`, rebuilds the test tree through the loader,
//! answers `Ready`, and then serves `Run` requests one at a time until it
//! is stopped, it fails a test, or the parent goes away. All communication
//! is frames over stdin/stdout; sanctioned test output travels as `Stdio`
//! frames.

use super::{FixtureStore, TestContext};
use crate::{
    config::RunConfig,
    errors::{IpcError, TestFailure},
    fixture::{FixtureHash, FixtureScope},
    ipc::{Channel, ParentMessage, RunRequest, WorkerInit, WorkerMessage},
    list::{Loader, RootRegistry, TestList},
    reporter::events::{ErrorSummary, TestStatus},
    store::{OutputLayout, SnapshotStore, CACHE_DIR_ENV},
    time::{deadline, stopwatch, with_deadline, DeadlineOutcome},
};
use camino::Utf8PathBuf;
use std::{collections::HashMap, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

/// Environment variable marking a process as a spawned worker.
pub const WORKER_ENV: &str = "GANTRY_WORKER";

/// Minimum time granted to test-fixture teardown, even when the test body
/// consumed the whole timeout.
pub(crate) const TEARDOWN_FLOOR: Duration = Duration::from_secs(5);

/// Returns true when this process was spawned as a worker and should call
/// [`worker_main`] instead of parsing the CLI.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Runs the worker runtime over stdin/stdout to completion and returns the
/// process exit code.
///
/// The worker is single-threaded cooperative: a current-thread runtime,
/// with true parallelism only across worker processes.
pub fn worker_main(loader: &dyn Loader) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("gantry worker: failed to create runtime: {err}");
            return 1;
        }
    };
    let channel = Channel::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    runtime.block_on(serve(loader, channel))
}

/// Serves the worker protocol over an arbitrary pipe. Separated from
/// [`worker_main`] so tests can drive a worker over an in-memory duplex.
pub async fn serve<R, W>(loader: &dyn Loader, mut channel: Channel<R, W>) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let init = match channel.recv::<ParentMessage>().await {
        Ok(Some(ParentMessage::Init(init))) => init,
        Ok(_) => {
            warn!("worker expected init as the first message");
            return 1;
        }
        Err(_) => return 1,
    };

    let mut registry = RootRegistry::new();
    if let Err(err) = loader.load(&mut registry) {
        let _ = channel
            .send(&WorkerMessage::TeardownError {
                error: ErrorSummary {
                    message: err.to_string(),
                    location: err.file().map(|f| f.to_string()),
                },
            })
            .await;
        return 1;
    }
    let list = match TestList::build(registry, &init.config) {
        Ok(list) => list,
        Err(err) => {
            let _ = channel
                .send(&WorkerMessage::TeardownError {
                    error: ErrorSummary {
                        message: err.to_string(),
                        location: None,
                    },
                })
                .await;
            return 1;
        }
    };

    if channel.send(&WorkerMessage::Ready {}).await.is_err() {
        return 1;
    }

    let mut runtime = WorkerRuntime::new(init, list);
    loop {
        match channel.recv::<ParentMessage>().await {
            Ok(Some(ParentMessage::Run(req))) => {
                let retire = match runtime.run_test(&mut channel, req).await {
                    Ok(retire) => retire,
                    Err(_) => return 1,
                };
                if retire {
                    // One failure per worker: wait for the parent's stop.
                    return runtime.await_stop(&mut channel).await;
                }
            }
            Ok(Some(ParentMessage::Stop {})) => {
                return runtime.stop(&mut channel).await;
            }
            Ok(Some(ParentMessage::Init(_))) => {
                warn!("worker received a second init");
                return 1;
            }
            // Parent death: immediate exit.
            Ok(None) => return 0,
            Err(_) => return 1,
        }
    }
}

struct WorkerRuntime {
    worker_index: usize,
    fixture_hash: FixtureHash,
    config: RunConfig,
    list: TestList,
    layout: OutputLayout,
    cache_dir: Option<Utf8PathBuf>,
    worker_store: FixtureStore,
}

impl WorkerRuntime {
    fn new(init: WorkerInit, list: TestList) -> Self {
        let layout = OutputLayout::new(init.config.output_dir.clone());
        Self {
            worker_index: init.worker_index,
            fixture_hash: init.fixture_hash,
            config: init.config,
            list,
            layout,
            cache_dir: std::env::var(CACHE_DIR_ENV).ok().map(Utf8PathBuf::from),
            worker_store: FixtureStore::new(FixtureScope::Worker),
        }
    }

    /// Runs one test, emitting its event stream. Returns true when the
    /// worker must retire (the attempt missed its expectation).
    async fn run_test<R, W>(
        &mut self,
        channel: &mut Channel<R, W>,
        req: RunRequest,
    ) -> Result<bool, IpcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        channel
            .send(&WorkerMessage::TestBegin {
                test_id: req.test_id.clone(),
            })
            .await?;

        let watch = stopwatch();
        let (status, error, stdio) = self.execute_attempt(&req).await;
        let duration_ms = watch.snapshot().duration.as_millis() as u64;

        for (stream, data) in stdio {
            channel
                .send(&WorkerMessage::Stdio {
                    test_id: req.test_id.clone(),
                    stream,
                    data,
                })
                .await?;
        }
        channel
            .send(&WorkerMessage::TestEnd {
                test_id: req.test_id.clone(),
                status,
                error,
                duration_ms,
            })
            .await?;

        let retire = status != req.expected_status;
        if retire {
            channel
                .send(&WorkerMessage::Done {
                    pending_worker: true,
                })
                .await?;
        }
        Ok(retire)
    }

    /// Runs setup, body and test-scope teardown under the deadline pair.
    async fn execute_attempt(
        &mut self,
        req: &RunRequest,
    ) -> (
        TestStatus,
        Option<ErrorSummary>,
        Vec<(crate::ipc::StdioStream, String)>,
    ) {
        let Some(instance) = self.list.instance_for_id(&req.test_id) else {
            return (
                TestStatus::Failed,
                Some(ErrorSummary {
                    message: format!("unknown test id `{}`", req.test_id),
                    location: None,
                }),
                Vec::new(),
            );
        };
        if instance.case.fixture_hash != self.fixture_hash {
            return (
                TestStatus::Failed,
                Some(ErrorSummary {
                    message: format!(
                        "fixture hash mismatch: worker is bound to {}, test requires {}",
                        self.fixture_hash, instance.case.fixture_hash
                    ),
                    location: Some(instance.spec.location.to_string()),
                }),
                Vec::new(),
            );
        }

        let location = instance.spec.location.to_string();
        let fail = |message: String| ErrorSummary {
            message,
            location: Some(location.clone()),
        };

        let output_dir = self.layout.attempt_dir(&instance, req.retry);
        if let Err(err) = std::fs::create_dir_all(&output_dir) {
            return (
                TestStatus::Failed,
                Some(fail(format!(
                    "failed to create output directory `{output_dir}`: {err}"
                ))),
                Vec::new(),
            );
        }

        let (stdio_tx, mut stdio_rx) = tokio::sync::mpsc::unbounded_channel();
        let timeout = Duration::from_millis(req.timeout_ms);
        let mut dl = std::pin::pin!(deadline(timeout));

        // Phase 1: fixtures. Worker-scope fixtures are lazy and idempotent
        // across the tests sharing this worker; test-scope fixtures are
        // fresh every attempt. Both count against the test's timeout.
        let registry = self.list.fixtures();
        let worker_store = &mut self.worker_store;
        let refs = &instance.spec.fixture_refs;
        let setup = with_deadline(dl.as_mut(), async {
            worker_store.instantiate(registry, refs, None).await?;
            let mut test_store = FixtureStore::new(FixtureScope::Test);
            test_store
                .instantiate(registry, refs, Some(worker_store.values()))
                .await?;
            Ok::<_, TestFailure>(test_store)
        })
        .await;

        let (mut status, mut error, mut test_store) = match setup {
            DeadlineOutcome::Completed(Ok(test_store)) => (TestStatus::Passed, None, Some(test_store)),
            DeadlineOutcome::Completed(Err(err)) => {
                (TestStatus::Failed, Some(fail(err.message().to_owned())), None)
            }
            DeadlineOutcome::TimedOut => (
                TestStatus::TimedOut,
                Some(fail(format!(
                    "test timed out after {}ms during fixture setup",
                    req.timeout_ms
                ))),
                None,
            ),
        };

        // Phase 2: the body, as a spawned task. On timeout the task is
        // abandoned, not cancelled; its settlement is ignored and the
        // worker retires.
        if let Some(test_store) = &test_store {
            let mut fixtures = HashMap::new();
            for def in registry.topo_closure(refs) {
                if let Some(value) = test_store
                    .value(def.name())
                    .or_else(|| self.worker_store.value(def.name()))
                {
                    fixtures.insert(def.name().to_owned(), value);
                }
            }
            let snapshot_dir = instance
                .project
                .snapshot_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from("__snapshots__"));
            let ctx = TestContext {
                fixtures,
                project: instance.project.clone(),
                worker_index: self.worker_index,
                retry: req.retry,
                output_dir,
                snapshots: SnapshotStore::new(snapshot_dir, self.config.update_snapshots),
                cache_dir: self.cache_dir.clone(),
                stdio_tx,
            };

            debug!(test = %instance.name(), retry = req.retry, "running test body");
            let body = instance.spec.body().clone();
            let handle = tokio::spawn(body(ctx));
            match with_deadline(dl.as_mut(), handle).await {
                DeadlineOutcome::Completed(Ok(Ok(()))) => {}
                DeadlineOutcome::Completed(Ok(Err(err))) => {
                    status = TestStatus::Failed;
                    error = Some(fail(err.message().to_owned()));
                }
                DeadlineOutcome::Completed(Err(join_err)) => {
                    status = TestStatus::Failed;
                    error = Some(fail(panic_message(join_err)));
                }
                DeadlineOutcome::TimedOut => {
                    status = TestStatus::TimedOut;
                    error = Some(fail(format!("test timed out after {}ms", req.timeout_ms)));
                }
            }
        } else {
            drop(stdio_tx);
        }

        // Phase 3: test-scope teardown, under an extended deadline on the
        // same clock.
        if let Some(mut test_store) = test_store.take() {
            let remaining = dl.as_ref().remaining();
            dl.as_mut().reset(remaining.max(TEARDOWN_FLOOR));
            match with_deadline(dl.as_mut(), test_store.teardown()).await {
                DeadlineOutcome::Completed(errors) => {
                    if let Some(first) = errors.into_iter().next() {
                        // A teardown failure attaches to the test but never
                        // masks an earlier failure.
                        if status == TestStatus::Passed {
                            status = TestStatus::Failed;
                            error = Some(fail(first.message().to_owned()));
                        }
                    }
                }
                DeadlineOutcome::TimedOut => {
                    if status == TestStatus::Passed {
                        status = TestStatus::TimedOut;
                        error = Some(fail("fixture teardown timed out".to_owned()));
                    }
                }
            }
        }

        let mut stdio = Vec::new();
        while let Ok(chunk) = stdio_rx.try_recv() {
            stdio.push(chunk);
        }
        (status, error, stdio)
    }

    /// After a failure: drain requests until the parent's `Stop` arrives,
    /// then tear down and exit.
    async fn await_stop<R, W>(&mut self, channel: &mut Channel<R, W>) -> i32
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            match channel.recv::<ParentMessage>().await {
                Ok(Some(ParentMessage::Stop {})) => return self.stop(channel).await,
                Ok(Some(other)) => {
                    debug!(?other, "ignoring request while retiring");
                }
                Ok(None) => return 0,
                Err(_) => return 1,
            }
        }
    }

    /// Clean shutdown: worker-fixture teardown in reverse order, reporting
    /// failures as run-level errors.
    async fn stop<R, W>(&mut self, channel: &mut Channel<R, W>) -> i32
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        for err in self.worker_store.teardown().await {
            let _ = channel
                .send(&WorkerMessage::TeardownError {
                    error: ErrorSummary {
                        message: err.message().to_owned(),
                        location: None,
                    },
                })
                .await;
        }
        let _ = channel
            .send(&WorkerMessage::Done {
                pending_worker: false,
            })
            .await;
        0
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            if let Some(message) = panic.downcast_ref::<&str>() {
                format!("test panicked: {message}")
            } else if let Some(message) = panic.downcast_ref::<String>() {
                format!("test panicked: {message}")
            } else {
                "test panicked".to_owned()
            }
        }
        Err(err) => format!("test task failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Project, RunConfig},
        errors::LoaderError,
        fixture::SetUpFixture,
        ipc::StdioStream,
        list::SourceLocation,
    };
    use camino_tempfile::Utf8TempDir;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::io::{duplex, split};

    static SERVER_SETUPS: AtomicUsize = AtomicUsize::new(0);

    fn loader(registry: &mut RootRegistry) -> Result<(), LoaderError> {
        registry
            .fixture(
                "server",
                FixtureScope::Worker,
                Vec::<String>::new(),
                |_args| async {
                    SERVER_SETUPS.fetch_add(1, Ordering::SeqCst);
                    Ok(SetUpFixture::value("srv".to_owned()))
                },
            )
            .map_err(|err| LoaderError::new(err.to_string()))?;

        let file = registry.file("tests/w.rs");
        file.spec("passes", SourceLocation::new("tests/w.rs", 1, 1), |ctx| async move {
            ctx.write_stdout("hello from test\n");
            Ok(())
        });
        file.spec("fails", SourceLocation::new("tests/w.rs", 2, 1), |_ctx| async {
            Err("deliberate failure".into())
        });
        file.spec("hangs", SourceLocation::new("tests/w.rs", 3, 1), |_ctx| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        file.spec("served", SourceLocation::new("tests/w.rs", 4, 1), |ctx| async move {
            let server: Arc<String> = ctx.fixture("server")?;
            assert_eq!(*server, "srv");
            Ok(())
        })
        .with_fixtures(["server"]);
        file.spec("served2", SourceLocation::new("tests/w.rs", 5, 1), |ctx| async move {
            let _server: Arc<String> = ctx.fixture("server")?;
            Ok(())
        })
        .with_fixtures(["server"]);
        Ok(())
    }

    struct Harness {
        channel: Channel<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        list: TestList,
        worker: tokio::task::JoinHandle<i32>,
        _output: Utf8TempDir,
    }

    impl Harness {
        async fn start(hash_refs: &[&str]) -> Self {
            let output = Utf8TempDir::new().unwrap();
            let config = RunConfig {
                workers: 1,
                output_dir: output.path().to_owned(),
                projects: vec![Project::new("default")],
                ..RunConfig::default()
            };
            let mut registry = RootRegistry::new();
            loader(&mut registry).unwrap();
            let list = TestList::build(registry, &config).unwrap();
            let fixture_hash = list.fixtures().worker_hash(
                "default",
                &hash_refs.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            );

            let (parent_side, worker_side) = duplex(1024 * 1024);
            let (parent_read, parent_write) = split(parent_side);
            let (worker_read, worker_write) = split(worker_side);

            let worker = tokio::spawn(async move {
                serve(&loader, Channel::new(worker_read, worker_write)).await
            });

            let mut channel = Channel::new(parent_read, parent_write);
            channel
                .send(&ParentMessage::Init(WorkerInit {
                    worker_index: 0,
                    project_index: 0,
                    config: config.clone(),
                    fixture_hash,
                }))
                .await
                .unwrap();
            let ready: WorkerMessage = channel.recv().await.unwrap().unwrap();
            assert!(matches!(ready, WorkerMessage::Ready {}));

            Self {
                channel,
                list,
                worker,
                _output: output,
            }
        }

        fn request(&self, title: &str, timeout_ms: u64) -> RunRequest {
            let instance = self
                .list
                .iter_instances()
                .find(|i| i.spec.title == title)
                .unwrap();
            RunRequest {
                test_id: instance.id().clone(),
                timeout_ms,
                retry: 0,
                expected_status: instance.case.expected_status,
            }
        }

        /// Dispatches a test expected to pass and collects frames through
        /// its `TestEnd`.
        async fn run(&mut self, title: &str, timeout_ms: u64) -> Vec<WorkerMessage> {
            let req = self.request(title, timeout_ms);
            self.channel
                .send(&ParentMessage::Run(req))
                .await
                .unwrap();
            let mut messages = Vec::new();
            loop {
                let msg: WorkerMessage = self.channel.recv().await.unwrap().unwrap();
                let is_end = matches!(msg, WorkerMessage::TestEnd { .. });
                messages.push(msg);
                if is_end {
                    break;
                }
            }
            messages
        }

        async fn stop(mut self) -> i32 {
            self.channel.send(&ParentMessage::Stop {}).await.unwrap();
            loop {
                match self.channel.recv::<WorkerMessage>().await {
                    Ok(Some(WorkerMessage::Done { .. })) | Ok(None) | Err(_) => break,
                    Ok(Some(_)) => continue,
                }
            }
            drop(self.channel);
            self.worker.await.unwrap()
        }
    }

    #[tokio::test]
    async fn passing_test_emits_begin_stdio_end() {
        let mut harness = Harness::start(&[]).await;
        let messages = harness.run("passes", 5_000).await;

        assert!(matches!(messages[0], WorkerMessage::TestBegin { .. }));
        let stdio = messages
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Stdio { stream, data, .. } => Some((stream, data)),
                _ => None,
            })
            .expect("stdio frame present");
        assert_eq!(*stdio.0, StdioStream::Stdout);
        assert_eq!(stdio.1, "hello from test\n");
        let end = messages.last().unwrap();
        assert!(
            matches!(end, WorkerMessage::TestEnd { status, .. } if *status == TestStatus::Passed)
        );
        assert_eq!(harness.stop().await, 0);
    }

    #[tokio::test]
    async fn failing_test_retires_the_worker() {
        let mut harness = Harness::start(&[]).await;
        let req = harness.request("fails", 5_000);
        harness
            .channel
            .send(&ParentMessage::Run(req))
            .await
            .unwrap();

        let mut saw_failed_end = false;
        loop {
            let msg: WorkerMessage = harness.channel.recv().await.unwrap().unwrap();
            match msg {
                WorkerMessage::TestEnd { status, error, .. } => {
                    assert_eq!(status, TestStatus::Failed);
                    assert!(error.unwrap().message.contains("deliberate failure"));
                    saw_failed_end = true;
                }
                WorkerMessage::Done { pending_worker } => {
                    assert!(pending_worker, "worker waits for stop after a failure");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_failed_end);
        assert_eq!(harness.stop().await, 0);
    }

    #[tokio::test]
    async fn hanging_test_times_out_and_is_abandoned() {
        let mut harness = Harness::start(&[]).await;
        let req = harness.request("hangs", 100);
        harness
            .channel
            .send(&ParentMessage::Run(req))
            .await
            .unwrap();

        loop {
            let msg: WorkerMessage = harness.channel.recv().await.unwrap().unwrap();
            if let WorkerMessage::TestEnd { status, error, .. } = &msg {
                assert_eq!(*status, TestStatus::TimedOut);
                assert!(error.as_ref().unwrap().message.contains("timed out"));
                break;
            }
        }
        assert_eq!(harness.stop().await, 0);
    }

    #[tokio::test]
    async fn worker_fixture_is_set_up_once_across_tests() {
        SERVER_SETUPS.store(0, Ordering::SeqCst);
        let mut harness = Harness::start(&["server"]).await;

        let messages = harness.run("served", 5_000).await;
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::TestEnd { status, .. }) if *status == TestStatus::Passed
        ));
        let messages = harness.run("served2", 5_000).await;
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::TestEnd { status, .. }) if *status == TestStatus::Passed
        ));

        assert_eq!(
            SERVER_SETUPS.load(Ordering::SeqCst),
            1,
            "worker fixture instantiated exactly once"
        );
        assert_eq!(harness.stop().await, 0);
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        // Worker bound to the bare hash; dispatch a test requiring `server`.
        let mut harness = Harness::start(&[]).await;
        let req = harness.request("served", 5_000);
        harness
            .channel
            .send(&ParentMessage::Run(req))
            .await
            .unwrap();

        loop {
            let msg: WorkerMessage = harness.channel.recv().await.unwrap().unwrap();
            if let WorkerMessage::TestEnd { status, error, .. } = &msg {
                assert_eq!(*status, TestStatus::Failed);
                assert!(error
                    .as_ref()
                    .unwrap()
                    .message
                    .contains("fixture hash mismatch"));
                break;
            }
        }
        assert_eq!(harness.stop().await, 0);
    }
}
