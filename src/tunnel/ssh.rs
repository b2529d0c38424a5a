//! OpenSSH control-master transport
//!
//! The master connection is started once in the background; forwards, checks
//! and remote commands are multiplexed over its control socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    ExecOutput, ForwardDirection, ForwardSpec, TunnelConnector, TunnelCredentials, TunnelError,
    TunnelTransport,
};

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Control socket for a destination. Kept short: unix socket paths are
/// limited to ~100 bytes.
pub fn control_path(dir: &Path, credentials: &TunnelCredentials) -> PathBuf {
    let key = format!(
        "{}:{}",
        credentials.destination(),
        credentials.port.unwrap_or(22)
    );
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    dir.join(format!("cm-{}", hex))
}

/// `-L`/`-R` argument for a forward
pub fn forward_args(spec: &ForwardSpec) -> [String; 2] {
    match spec.direction {
        ForwardDirection::Local => [
            "-L".to_string(),
            format!("127.0.0.1:{}:{}", spec.local_port, spec.remote),
        ],
        ForwardDirection::Remote => [
            "-R".to_string(),
            format!("{}:127.0.0.1:{}", spec.remote, spec.local_port),
        ],
    }
}

/// Single remote command line with every argument quoted
pub fn remote_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Starts control masters
pub struct SshConnector {
    control_dir: PathBuf,
    connect_timeout_secs: u64,
    server_alive_interval_secs: u64,
}

impl SshConnector {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            connect_timeout_secs: 15,
            server_alive_interval_secs: 15,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn connect(
        &self,
        credentials: &TunnelCredentials,
    ) -> Result<Arc<dyn TunnelTransport>, TunnelError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let transport = SshTransport {
            control_path: control_path(&self.control_dir, credentials),
            destination: credentials.destination(),
            port: credentials.port,
        };

        // A master left over from a previous run is reused as is
        if transport.check().await.is_ok() {
            debug!("Reusing control master {}", transport.control_path.display());
            return Ok(Arc::new(transport));
        }

        let mut args = transport.base_args();
        args.extend([
            "-M".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.server_alive_interval_secs),
        ]);
        if let Some(identity) = &credentials.identity_file {
            let expanded = shellexpand::tilde(identity).into_owned();
            args.extend(["-i".to_string(), expanded]);
        }
        args.extend([
            "-f".to_string(),
            "-N".to_string(),
            transport.destination.clone(),
        ]);

        let output = run_ssh(&args, None).await?;
        if output.status != 0 {
            let stderr = output.stderr.trim().to_string();
            return Err(if stderr.contains("Permission denied") {
                TunnelError::AuthFailed(stderr)
            } else {
                TunnelError::ConnectFailed(stderr)
            });
        }

        debug!(
            "Control master up for {} at {}",
            transport.destination,
            transport.control_path.display()
        );
        Ok(Arc::new(transport))
    }
}

/// One control master
pub struct SshTransport {
    control_path: PathBuf,
    destination: String,
    port: Option<u16>,
}

impl SshTransport {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
        ];
        if let Some(port) = self.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        args
    }

    async fn control(&self, op: &str, extra: &[String]) -> Result<ExecOutput, TunnelError> {
        let mut args = self.base_args();
        args.extend(["-O".to_string(), op.to_string()]);
        args.extend(extra.iter().cloned());
        args.push(self.destination.clone());
        run_ssh(&args, None).await
    }
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn check(&self) -> Result<(), TunnelError> {
        let output = self.control("check", &[]).await?;
        if output.status == 0 {
            Ok(())
        } else {
            Err(TunnelError::Down(output.stderr.trim().to_string()))
        }
    }

    async fn open_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        let output = self.control("forward", &forward_args(spec)).await?;
        if output.status == 0 {
            Ok(())
        } else {
            Err(TunnelError::ForwardFailed(format!(
                "{}: {}",
                spec,
                output.stderr.trim()
            )))
        }
    }

    async fn close_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        let output = self.control("cancel", &forward_args(spec)).await?;
        if output.status == 0 {
            Ok(())
        } else {
            Err(TunnelError::ForwardFailed(format!(
                "cancel {}: {}",
                spec,
                output.stderr.trim()
            )))
        }
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutput, TunnelError> {
        let mut ssh_args = self.base_args();
        ssh_args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.destination.clone(),
            "--".to_string(),
            remote_command(program, args),
        ]);
        let output = run_ssh(&ssh_args, stdin).await?;
        // 255 is ssh's own failure, not the remote command's
        if output.status == 255 {
            return Err(TunnelError::Exec(output.stderr.trim().to_string()));
        }
        Ok(output)
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let output = self.control("exit", &[]).await?;
        if output.status != 0 {
            debug!("ssh -O exit: {}", output.stderr.trim());
        }
        Ok(())
    }
}

async fn run_ssh(args: &[String], stdin: Option<&str>) -> Result<ExecOutput, TunnelError> {
    trace!("ssh {:?}", args);
    let mut child = Command::new("ssh")
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    Ok(ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> TunnelCredentials {
        TunnelCredentials {
            cluster: "meluxina".to_string(),
            host: "login.lxp.lu".to_string(),
            user: Some("u100".to_string()),
            port: Some(8822),
            identity_file: None,
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_control_path_is_stable_and_short() {
        let dir = Path::new("/tmp/hpcserve");
        let a = control_path(dir, &creds());
        let b = control_path(dir, &creds());
        assert_eq!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cm-"));
        assert_eq!(name.len(), 3 + 16);

        let mut other = creds();
        other.user = Some("u200".to_string());
        assert_ne!(control_path(dir, &other), a);
    }

    #[test]
    fn test_forward_args() {
        assert_eq!(
            forward_args(&ForwardSpec::local(41000, "gpu01:8000")),
            ["-L".to_string(), "127.0.0.1:41000:gpu01:8000".to_string()]
        );
        assert_eq!(
            forward_args(&ForwardSpec::remote("0.0.0.0:9464", 9464)),
            ["-R".to_string(), "0.0.0.0:9464:127.0.0.1:9464".to_string()]
        );
    }

    #[test]
    fn test_remote_command_quotes_args() {
        let cmd = remote_command(
            "squeue",
            &["--jobs".to_string(), "12; rm -rf ~".to_string()],
        );
        assert_eq!(cmd, "squeue '--jobs' '12; rm -rf ~'");
    }
}
