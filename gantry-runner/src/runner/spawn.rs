// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker processes: the current binary re-executed with a marker
//! environment variable.

use super::{PoolEvent, WorkerLink, WorkerSpawner};
use crate::{
    errors::SpawnError,
    ipc::{write_frame, ParentMessage, WorkerInit, WorkerMessage},
    worker::WORKER_ENV,
};
use camino::Utf8PathBuf;
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::debug;

/// Spawns workers by re-executing a program (normally the current test
/// binary) with [`WORKER_ENV`] set.
pub(crate) struct ProcessSpawner {
    program: Utf8PathBuf,
}

impl ProcessSpawner {
    /// A spawner for the currently running executable.
    pub(crate) fn current_exe() -> Result<Self, SpawnError> {
        let program = std::env::current_exe().map_err(SpawnError::CurrentExe)?;
        let program = Utf8PathBuf::from_path_buf(program)
            .map_err(|path| SpawnError::CurrentExe(std::io::Error::other(format!(
                "executable path `{}` is not UTF-8",
                path.display()
            ))))?;
        Ok(Self { program })
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        init: WorkerInit,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Box<dyn WorkerLink>, SpawnError> {
        let worker_index = init.worker_index;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(SpawnError::Spawn)?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Writer: the init frame first, then whatever the dispatcher sends.
        let (tx, mut rx) = mpsc::unbounded_channel::<ParentMessage>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            if write_frame(&mut stdin, &ParentMessage::Init(init))
                .await
                .is_err()
            {
                return;
            }
            while let Some(message) = rx.recv().await {
                if write_frame(&mut stdin, &message).await.is_err() {
                    break;
                }
            }
        });

        // Reader: worker frames become pool events.
        let frame_events = events.clone();
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                match crate::ipc::read_frame::<_, WorkerMessage>(&mut stdout).await {
                    Ok(Some(message)) => {
                        if frame_events
                            .send(PoolEvent::Message {
                                worker_index,
                                message,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // A corrupt stream (e.g. a stray println! in user
                        // code) ends the worker; the exit event takes over.
                        debug!(worker = worker_index, %err, "worker frame stream error");
                        break;
                    }
                }
            }
        });

        // Stderr: raw lines, attributed to the in-flight test.
        let stderr_events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_events
                    .send(PoolEvent::Stderr {
                        worker_index,
                        chunk: format!("{line}\n"),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        // Exit watcher, with a force-kill switch.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                res = kill_rx => {
                    if res.is_ok() {
                        let _ = child.kill().await;
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            debug!(worker = worker_index, ?code, "worker exited");
            let _ = events.send(PoolEvent::Exited { worker_index, code });
        });

        Ok(Box::new(ProcessLink {
            tx,
            kill_tx: Some(kill_tx),
        }))
    }
}

struct ProcessLink {
    tx: mpsc::UnboundedSender<ParentMessage>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerLink for ProcessLink {
    fn send(&self, message: ParentMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}
