//! Slurm adapter
//!
//! Drives `sbatch`, `squeue`, `sacct` and `scancel`. The commands either run
//! as local processes (gateway on the login node) or over the tunnel
//! session on the cluster side.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::retry::RetryPolicy;
use super::{JobSpec, JobState, SchedulerClient, SchedulerError};
use crate::tunnel::{shell_quote, TunnelBridge, TunnelError, TunnelSession};

/// Slurm-specific submission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<String>,
    /// Directory (cluster side) for job stdout/stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    /// Raw `#SBATCH` lines appended verbatim (without the prefix)
    #[serde(default)]
    pub extra_directives: Vec<String>,
    /// Run commands through the tunnel session when one is configured
    #[serde(default = "default_remote")]
    pub remote: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            qos: None,
            log_dir: None,
            extra_directives: Vec::new(),
            remote: default_remote(),
            command_timeout_secs: default_command_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_remote() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    30
}

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs scheduler CLI commands somewhere
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, SchedulerError>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, SchedulerError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SchedulerError::Unavailable(format!("failed to run {}: {}", program, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs commands on the cluster through the shared tunnel session
#[derive(Clone)]
pub struct TunnelRunner {
    bridge: Arc<TunnelBridge>,
    session: TunnelSession,
}

impl TunnelRunner {
    pub fn new(bridge: Arc<TunnelBridge>, session: TunnelSession) -> Self {
        Self { bridge, session }
    }
}

#[async_trait]
impl CommandRunner for TunnelRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, SchedulerError> {
        let output = self
            .bridge
            .exec(&self.session, program, args, stdin)
            .await
            .map_err(|e| match e {
                TunnelError::AuthFailed(msg) => SchedulerError::Unauthorized(msg),
                other => SchedulerError::Unavailable(other.to_string()),
            })?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// [`SchedulerClient`] backed by the Slurm command line tools
pub struct SlurmScheduler {
    runner: Arc<dyn CommandRunner>,
    settings: SlurmSettings,
}

impl SlurmScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: SlurmSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &SlurmSettings {
        &self.settings
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, SchedulerError> {
        let limit = Duration::from_secs(self.settings.command_timeout_secs);
        trace!("Running {} {:?}", program, args);
        match timeout(limit, self.runner.run(program, args, stdin)).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Unavailable(format!(
                "{} timed out after {}s",
                program,
                limit.as_secs()
            ))),
        }
    }

    async fn submit_once(&self, script: &str) -> Result<String, SchedulerError> {
        let output = self
            .exec("sbatch", &["--parsable".to_string()], Some(script))
            .await?;
        if !output.success() {
            return Err(classify_failure(&output.stderr));
        }
        parse_sbatch_output(&output.stdout)
    }

    /// Id of a queued or running job carrying `name`, if any
    async fn find_by_name(&self, name: &str) -> Result<Option<String>, SchedulerError> {
        let output = self
            .exec(
                "squeue",
                &[
                    "--noheader".to_string(),
                    format!("--name={}", name),
                    "--format=%i".to_string(),
                ],
                None,
            )
            .await?;
        if !output.success() {
            return Err(classify_failure(&output.stderr));
        }
        Ok(parse_job_ids(&output.stdout).into_iter().next())
    }

    async fn query_once(&self, job_id: &str) -> Result<JobState, SchedulerError> {
        let squeue = self
            .exec(
                "squeue",
                &[
                    "--noheader".to_string(),
                    "--jobs".to_string(),
                    job_id.to_string(),
                    "--format=%T|%N".to_string(),
                ],
                None,
            )
            .await?;

        if squeue.success() {
            if let Some(state) = parse_squeue(&squeue.stdout) {
                return Ok(state);
            }
        } else if !is_invalid_job_id(&squeue.stderr) {
            return Err(classify_failure(&squeue.stderr));
        }

        // Job left the queue: ask accounting how it ended
        let sacct = self
            .exec(
                "sacct",
                &[
                    "--noheader".to_string(),
                    "--parsable2".to_string(),
                    "--allocations".to_string(),
                    "--jobs".to_string(),
                    job_id.to_string(),
                    "--format=State,ExitCode,NodeList".to_string(),
                ],
                None,
            )
            .await?;

        if !sacct.success() {
            return Err(classify_failure(&sacct.stderr));
        }
        Ok(parse_sacct(&sacct.stdout).unwrap_or(JobState::Unknown))
    }

    async fn cancel_once(&self, job_id: &str) -> Result<(), SchedulerError> {
        let output = self.exec("scancel", &[job_id.to_string()], None).await?;
        if output.success() || is_already_finished(&output.stderr) {
            return Ok(());
        }
        if is_invalid_job_id(&output.stderr) {
            return Err(SchedulerError::NotFound(job_id.to_string()));
        }
        Err(classify_failure(&output.stderr))
    }
}

#[async_trait]
impl SchedulerClient for SlurmScheduler {
    async fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError> {
        let script = render_batch_script(job, &self.settings);
        debug!("Submitting job '{}':\n{}", job.name, script);

        // A failed attempt may still have reached the controller: look the
        // job up by its name before every resubmission.
        let mut attempted = false;
        let job_id = self
            .settings
            .retry
            .run("sbatch", || {
                let resubmit = std::mem::replace(&mut attempted, true);
                let script = &script;
                async move {
                    if resubmit {
                        if let Some(job_id) = self.find_by_name(&job.name).await? {
                            info!(
                                "Found job '{}' as {} from an earlier attempt",
                                job.name, job_id
                            );
                            return Ok(job_id);
                        }
                    }
                    self.submit_once(script).await
                }
            })
            .await?;

        info!("Slurm accepted job '{}' as {}", job.name, job_id);
        Ok(job_id)
    }

    async fn cancel_named(&self, name: &str) -> Result<(), SchedulerError> {
        self.settings
            .retry
            .run("scancel", || async {
                let output = self
                    .exec("scancel", &[format!("--name={}", name)], None)
                    .await?;
                if output.success() || is_already_finished(&output.stderr) {
                    Ok(())
                } else {
                    Err(classify_failure(&output.stderr))
                }
            })
            .await
    }

    async fn query(&self, job_id: &str) -> Result<JobState, SchedulerError> {
        self.settings
            .retry
            .run("squeue", || self.query_once(job_id))
            .await
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.settings
            .retry
            .run("scancel", || self.cancel_once(job_id))
            .await
    }
}

// ============================================================================
// Pure rendering and parsing
// ============================================================================

/// Render the batch script submitted on sbatch's stdin
pub fn render_batch_script(job: &JobSpec, settings: &SlurmSettings) -> String {
    let res = &job.spec.resources;
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH --job-name={}", job.name),
        format!("#SBATCH --nodes={}", res.nodes),
        "#SBATCH --ntasks=1".to_string(),
        format!("#SBATCH --cpus-per-task={}", res.cpu),
        format!("#SBATCH --mem={}", res.memory),
        format!("#SBATCH --time={}", res.time_limit),
    ];

    if res.gpu > 0 {
        lines.push(format!("#SBATCH --gres=gpu:{}", res.gpu));
    }
    if let Some(partition) = &settings.partition {
        lines.push(format!("#SBATCH --partition={}", partition));
    }
    if let Some(account) = &settings.account {
        lines.push(format!("#SBATCH --account={}", account));
    }
    if let Some(qos) = &settings.qos {
        lines.push(format!("#SBATCH --qos={}", qos));
    }
    if let Some(log_dir) = &settings.log_dir {
        lines.push(format!(
            "#SBATCH --output={}/%x-%j.out",
            log_dir.trim_end_matches('/')
        ));
    }
    for directive in &settings.extra_directives {
        lines.push(format!("#SBATCH {}", directive));
    }

    lines.push(String::new());
    for (key, value) in &job.spec.environment {
        lines.push(format!("export {}={}", key, shell_quote(value)));
    }
    lines.push(format!("export SERVICE_PORT={}", job.port));
    lines.push(String::new());
    lines.push(job.spec.command.clone());
    lines.push(String::new());

    lines.join("\n")
}

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+(?:_\d+)?)(?:;\S+)?$").expect("valid job id pattern"))
}

fn nodelist_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([^\[,]+)(?:\[(\d+)[^\]]*\])?").expect("valid nodelist pattern")
    })
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
pub fn parse_sbatch_output(stdout: &str) -> Result<String, SchedulerError> {
    let line = stdout.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or("");
    job_id_pattern()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            SchedulerError::Unavailable(format!("unexpected sbatch output: '{}'", stdout.trim()))
        })
}

/// Job ids from `squeue --format=%i`, one per line
pub fn parse_job_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|line| job_id_pattern().captures(line)?.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// First host of a Slurm nodelist (`gpu[03-04],gpu07` -> `gpu03`)
pub fn first_host(nodelist: &str) -> Option<String> {
    let nodelist = nodelist.trim();
    if nodelist.is_empty() || nodelist == "(null)" || nodelist == "None assigned" {
        return None;
    }
    let caps = nodelist_pattern().captures(nodelist)?;
    let prefix = caps.get(1)?.as_str();
    Some(match caps.get(2) {
        Some(index) => format!("{}{}", prefix, index.as_str()),
        None => prefix.to_string(),
    })
}

/// Parse `squeue --format=%T|%N`; `None` when the job is not in the queue
pub fn parse_squeue(stdout: &str) -> Option<JobState> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (state, nodes) = line.split_once('|').unwrap_or((line, ""));

    match state {
        "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "SUSPENDED" | "RESV_DEL_HOLD" => {
            Some(JobState::Queued)
        }
        "CONFIGURING" | "RUNNING" | "COMPLETING" | "RESIZING" | "SIGNALING" | "STAGE_OUT" => {
            match first_host(nodes) {
                Some(node) => Some(JobState::Running { node }),
                None => Some(JobState::Queued),
            }
        }
        // Terminal states still listed briefly; let sacct give the exit code
        _ => None,
    }
}

/// Parse `sacct --parsable2 --format=State,ExitCode,NodeList`
pub fn parse_sacct(stdout: &str) -> Option<JobState> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split('|');
    let state = fields.next()?.split_whitespace().next()?;
    let exit = fields.next().unwrap_or("0:0");
    let nodes = fields.next().unwrap_or("");

    let (code, signal) = exit
        .split_once(':')
        .map(|(c, s)| (c.parse::<i32>().unwrap_or(0), s.parse::<i32>().unwrap_or(0)))
        .unwrap_or((0, 0));

    match state {
        "PENDING" | "REQUEUED" | "SUSPENDED" => Some(JobState::Queued),
        "RUNNING" | "COMPLETING" | "CONFIGURING" => match first_host(nodes) {
            Some(node) => Some(JobState::Running { node }),
            None => Some(JobState::Queued),
        },
        // Time limit counts as a clean end of service
        "COMPLETED" | "TIMEOUT" => Some(JobState::Exited { code: 0 }),
        _ => {
            let code = if code != 0 {
                code
            } else if signal != 0 {
                128 + signal
            } else {
                1
            };
            Some(JobState::Exited { code })
        }
    }
}

fn is_invalid_job_id(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

fn is_already_finished(stderr: &str) -> bool {
    stderr.contains("already completing or completed") || stderr.contains("Job has already finished")
}

/// Map scheduler / transport stderr onto the error taxonomy
pub fn classify_failure(stderr: &str) -> SchedulerError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    const AUTH: &[&str] = &["permission denied (publickey", "host key verification failed"];
    const QUOTA: &[&str] = &[
        "qosmaxsubmitjob",
        "assocmaxsubmitjob",
        "qosmax",
        "assocgrp",
        "job violates accounting/qos policy",
        "quota",
    ];
    const INVALID: &[&str] = &[
        "invalid",
        "requested node configuration is not available",
        "access/permission denied",
        "unrecognized option",
        "memory specification can not be satisfied",
    ];

    if AUTH.iter().any(|p| lower.contains(p)) {
        SchedulerError::Unauthorized(message)
    } else if QUOTA.iter().any(|p| lower.contains(p)) {
        SchedulerError::QuotaExceeded(message)
    } else if INVALID.iter().any(|p| lower.contains(p)) {
        SchedulerError::InvalidSpec(message)
    } else {
        SchedulerError::Unavailable(message)
    }
}
