//! Stage execution: one sandboxed subprocess per run.
//!
//! A run spawns the jailed child, streams both output pipes back as
//! base64 chunks, enforces the combined output byte cap, honors an
//! inbound `stop` command, and always closes with the
//! `ExitCode`/`Duration`/`completed` trio once the child has started.
//! The pipe-transfer tasks are joined before the run returns, so
//! nothing outlives the stage.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crucible_core::checks::check_exit_code;
use crucible_core::jail::jail_argv;
use crucible_core::protocol::{ClientEnvelope, TestCase, WorkerEvent, COMMAND_STOP};
use crucible_core::rules::Stage;

use crate::transport::Outbound;

/// Pipe read chunk size; one chunk becomes one `Output` envelope.
const READ_CHUNK: usize = 512;

/// One execution of a stage, optionally bound to a test case.
pub struct StageRun<'a> {
    pub stage: &'a Stage,
    /// Test case and its index, when this run is a test fan-out of the
    /// final stage.
    pub test_case: Option<(&'a TestCase, usize)>,
    /// Staged source paths substituted for `{sources}`.
    pub source_files: &'a [String],
    pub request_id: &'a str,
}

impl StageRun<'_> {
    /// Run the stage to completion.
    ///
    /// Returns the stage verdict: with a test case attached, whether
    /// every check passed; otherwise whether the child exited zero.
    /// The driver stops the stage chain on `false`.
    pub async fn run(
        &self,
        events: &mpsc::Sender<Outbound>,
        commands: &mut mpsc::Receiver<ClientEnvelope>,
    ) -> bool {
        let start_time = Instant::now();
        let stage_name = &self.stage.name;

        let (command_line, argv) = jail_argv(self.stage, self.source_files);
        info!(stage = %stage_name, "running stage command: {command_line}");

        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.send_error(events, format!("Failed to run program process: {e}"))
                    .await;
                return false;
            }
        };
        let pid = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.send_error(events, "Failed to get program's output pipes".to_owned())
                .await;
            kill_child(pid, stage_name);
            return false;
        };

        // Emitted before the pipe tasks exist, so `started` precedes
        // every `Output` envelope.
        self.send(
            events,
            WorkerEvent::started(stage_name, self.request_id, self.test_case.map(|(_, i)| i)),
        )
        .await;

        let output_transferred = Arc::new(AtomicU64::new(0));
        let killed = Arc::new(AtomicBool::new(false));

        let stdout_task = self.spawn_pipe_transfer(
            "stdout",
            stdout,
            events.clone(),
            Arc::clone(&output_transferred),
            pid,
        );
        let stderr_task = self.spawn_pipe_transfer(
            "stderr",
            stderr,
            events.clone(),
            Arc::clone(&output_transferred),
            pid,
        );

        // Wait for exit while listening for client commands. A closed
        // inbound channel means the connection is gone; the child is
        // killed and the wait continues so the pipes drain and the
        // terminal envelopes still go out (into the void).
        let mut commands_open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                envelope = commands.recv(), if commands_open => match envelope {
                    Some(envelope) if envelope.command.as_deref() == Some(COMMAND_STOP) => {
                        info!(stage = %stage_name, "stop requested by client");
                        kill_child(pid, stage_name);
                        killed.store(true, Ordering::Release);
                    }
                    Some(envelope) => {
                        warn!(stage = %stage_name, "received unknown client command: {:?}", envelope.command);
                    }
                    None => {
                        commands_open = false;
                        kill_child(pid, stage_name);
                        killed.store(true, Ordering::Release);
                    }
                },
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.send_error(events, format!("Failed to wait program process: {e}"))
                    .await;
                return false;
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        let duration_sec = start_time.elapsed().as_secs_f64();
        let transferred = output_transferred.load(Ordering::Acquire);

        if killed.load(Ordering::Acquire) {
            info!(
                stage = %stage_name,
                "process killed by client request, exit code: {exit_code}, stage duration: {duration_sec:.2} sec, output: {transferred} bytes"
            );
        } else {
            info!(
                stage = %stage_name,
                "process exit code: {exit_code}, stage duration: {duration_sec:.2} sec, output: {transferred} bytes"
            );
        }

        let mut tests_passed = None;
        if let Some((test_case, index)) = self.test_case {
            let mut passed = true;
            for check in &test_case.checks {
                match check_exit_code(check, exit_code) {
                    Ok(true) => {}
                    Ok(false) => {
                        passed = false;
                        break;
                    }
                    Err(e) => {
                        self.send_error(events, e.to_string()).await;
                        passed = false;
                        break;
                    }
                }
            }
            self.send(
                events,
                WorkerEvent::test_result(index, passed, stage_name, self.request_id),
            )
            .await;
            tests_passed = Some(passed);
        }

        self.send(
            events,
            WorkerEvent::exit_code(exit_code, stage_name, self.request_id),
        )
        .await;
        self.send(
            events,
            WorkerEvent::duration(duration_sec, stage_name, self.request_id),
        )
        .await;
        self.send(events, WorkerEvent::completed(stage_name, self.request_id))
            .await;

        tests_passed.unwrap_or(exit_code == 0)
    }

    fn spawn_pipe_transfer<R>(
        &self,
        kind: &'static str,
        mut pipe: R,
        events: mpsc::Sender<Outbound>,
        output_transferred: Arc<AtomicU64>,
        pid: Option<u32>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stage_name = self.stage.name.clone();
        let request_id = self.request_id.to_owned();
        let output_limit = self.stage.limits.output_bytes;

        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let n = match pipe.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = events
                            .send(Outbound::Event(WorkerEvent::error(
                                format!("Error while reading {kind}: {e}"),
                                &stage_name,
                                &request_id,
                            )))
                            .await;
                        break;
                    }
                };

                let encoded = BASE64.encode(&buf[..n]);
                if events
                    .send(Outbound::Event(WorkerEvent::output(
                        encoded,
                        kind,
                        &stage_name,
                        &request_id,
                    )))
                    .await
                    .is_err()
                {
                    break;
                }

                // Combined stdout+stderr accounting; the chunk that
                // crosses the cap is the last one transferred.
                let total =
                    output_transferred.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
                if total >= output_limit {
                    info!(stage = %stage_name, "killing process due to excessive output ({total} bytes)");
                    kill_child(pid, &stage_name);
                    break;
                }
            }
        })
    }

    async fn send(&self, events: &mpsc::Sender<Outbound>, event: WorkerEvent) {
        let _ = events.send(Outbound::Event(event)).await;
    }

    async fn send_error(&self, events: &mpsc::Sender<Outbound>, description: String) {
        error!(stage = %self.stage.name, "{description}");
        self.send(
            events,
            WorkerEvent::error(description, &self.stage.name, self.request_id),
        )
        .await;
    }
}

/// SIGKILL the sandbox wrapper. Its descendants die with the pid
/// namespace; processes outside one are a documented limitation.
fn kill_child(pid: Option<u32>, stage_name: &str) {
    let Some(pid) = pid else {
        return;
    };
    #[allow(clippy::cast_possible_wrap)] // pids fit in i32
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        error!(stage = %stage_name, "couldn't kill pid {pid}: {e}");
    }
}
