use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::decode::decode_line;
use crate::{AgentClient, AgentEngine, AgentError, AgentMessageStream, ConnectOptions};

const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Runs the `claude` CLI as a long-lived stream-json process per connection.
pub struct ClaudeCliEngine {
    binary: String,
    extra_args: Vec<String>,
}

impl ClaudeCliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command_args(&self, options: &ConnectOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--permission-mode",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        args.push(options.permission_mode.clone());

        if let Some(session_id) = &options.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if let Some(prompt) = &options.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentEngine for ClaudeCliEngine {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn AgentClient>, AgentError> {
        tokio::fs::create_dir_all(&options.working_directory)
            .await
            .map_err(AgentError::Spawn)?;

        let mut child = Command::new(&self.binary)
            .args(self.command_args(&options))
            .current_dir(&options.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let stdin = child.stdin.take().ok_or(AgentError::Closed)?;
        let stdout = child.stdout.take().ok_or(AgentError::Closed)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("claude stderr: {line}");
                }
            });
        }

        tracing::info!(
            binary = %self.binary,
            cwd = %options.working_directory.display(),
            resume = ?options.resume_session_id,
            pid = ?child.id(),
            "agent process started"
        );

        Ok(Arc::new(ClaudeCliClient {
            spawned_in: options.working_directory.clone(),
            working_directory: ArcSwap::from_pointee(options.working_directory),
            stdin: TokioMutex::new(Some(stdin)),
            stdout: TokioMutex::new(Some(stdout)),
            child: TokioMutex::new(child),
        }))
    }
}

pub struct ClaudeCliClient {
    spawned_in: PathBuf,
    working_directory: ArcSwap<PathBuf>,
    stdin: TokioMutex<Option<ChildStdin>>,
    stdout: TokioMutex<Option<ChildStdout>>,
    child: TokioMutex<Child>,
}

impl ClaudeCliClient {
    async fn write_frame(&self, frame: &Value) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::Closed)?;
        let mut line = frame.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("stdin flush failed: {e}")))
    }
}

#[async_trait]
impl AgentClient for ClaudeCliClient {
    fn working_directory(&self) -> PathBuf {
        (**self.working_directory.load()).clone()
    }

    fn set_working_directory(&self, directory: PathBuf) {
        self.working_directory.store(Arc::new(directory));
    }

    async fn query(&self, text: &str, session_id: &str) -> Result<(), AgentError> {
        // the process cannot move; a different directory needs a new connection
        let requested = self.working_directory();
        if requested != self.spawned_in {
            return Err(AgentError::Rejected(format!(
                "process runs in {}, not {}",
                self.spawned_in.display(),
                requested.display()
            )));
        }

        self.write_frame(&json!({
            "type": "user",
            "message": { "role": "user", "content": text },
            "parent_tool_use_id": null,
            "session_id": session_id,
        }))
        .await
    }

    async fn receive_messages(&self) -> Result<AgentMessageStream, AgentError> {
        let stdout = self
            .stdout
            .lock()
            .await
            .take()
            .ok_or(AgentError::StreamTaken)?;

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line(&line) {
                        Ok(Some(message)) => {
                            yield Ok(message);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(AgentError::Transport(format!("stdout read failed: {e}")));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn interrupt(&self) -> Result<(), AgentError> {
        self.write_frame(&json!({
            "type": "control_request",
            "request_id": format!("req_{}", Uuid::new_v4().simple()),
            "request": { "subtype": "interrupt" },
        }))
        .await
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        // closing stdin asks the CLI to finish; the kill is the fallback
        drop(self.stdin.lock().await.take());

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "agent process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::Transport(format!("wait failed: {e}"))),
            Err(_) => {
                tracing::warn!("agent process ignored stdin close, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| AgentError::Transport(format!("kill failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_and_prompt_flags_follow_options() {
        let engine = ClaudeCliEngine::new("claude")
            .with_extra_args(vec!["--model".into(), "opus".into()]);
        let options = ConnectOptions::new("/w", "bypassPermissions")
            .with_resume(Some("s-1".to_string()))
            .with_system_prompt(Some("be brief".to_string()));
        let args = engine.command_args(&options);

        let pos = args.iter().position(|arg| arg == "--permission-mode").unwrap();
        assert_eq!(args[pos + 1], "bypassPermissions");
        let pos = args.iter().position(|arg| arg == "--resume").unwrap();
        assert_eq!(args[pos + 1], "s-1");
        assert!(args.contains(&"--append-system-prompt".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--model", "opus"]);
    }

    #[test]
    fn fresh_connection_has_no_resume_flag() {
        let engine = ClaudeCliEngine::new("claude");
        let args = engine.command_args(&ConnectOptions::new("/w", "default"));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = ClaudeCliEngine::new("/nonexistent/claude-binary");
        let err = match engine.connect(ConnectOptions::new(dir.path(), "default")).await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, AgentError::Spawn(_)));
    }
}
