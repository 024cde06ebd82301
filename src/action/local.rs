//! Local action executor - runs scripts through a shell subprocess

use crate::action::{
    parse_outputs, ActionCommand, ActionError, ActionExecutor, ActionInvocation, ActionOutcome,
    BuiltinAction,
};
use crate::cache::{cache_key, CacheError, CacheStore};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Executes actions on the local machine
///
/// Scripts run as `<shell> -c <script>` in the working directory. The child
/// is killed when the invocation future is dropped, which is how timeouts
/// and cancellation stop a running step.
#[derive(Clone)]
pub struct LocalActionExecutor {
    /// Shell used for scripts
    shell: String,

    /// Working directory for scripts and cache paths
    working_dir: PathBuf,

    cache: Arc<dyn CacheStore>,
}

impl LocalActionExecutor {
    pub fn new(working_dir: impl Into<PathBuf>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: working_dir.into(),
            cache,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn run_script(
        &self,
        invocation: &ActionInvocation,
        script: &str,
        on_line: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<ActionOutcome, ActionError> {
        debug!(
            "Spawning {} for {} (script length: {})",
            self.shell,
            invocation.label(),
            script.len()
        );

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .current_dir(&self.working_dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActionError::Spawn(format!("{}: {}", self.shell, e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ActionError::Internal("child output was not captured".to_string()));
        };
        let mut stdout_lines = BufReader::new(stdout).split(b'\n');
        let mut stderr_lines = BufReader::new(stderr).split(b'\n');

        // stdout alone feeds `::set-output`; the log interleaves both streams
        let mut stdout_text = String::new();
        let mut log = String::new();
        let (mut stdout_open, mut stderr_open) = (true, true);
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_segment(), if stdout_open => match line.map_err(read_error)? {
                    Some(bytes) => {
                        let line = String::from_utf8_lossy(&bytes);
                        on_line(&line);
                        stdout_text.push_str(&line);
                        stdout_text.push('\n');
                        log.push_str(&line);
                        log.push('\n');
                    }
                    None => stdout_open = false,
                },
                line = stderr_lines.next_segment(), if stderr_open => match line.map_err(read_error)? {
                    Some(bytes) => {
                        let line = String::from_utf8_lossy(&bytes);
                        on_line(&line);
                        log.push_str(&line);
                        log.push('\n');
                    }
                    None => stderr_open = false,
                },
            }
        }

        let status = child.wait().await.map_err(read_error)?;
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            warn!("{} exited with code {}", invocation.label(), exit_code);
        }

        Ok(ActionOutcome {
            exit_code,
            outputs: parse_outputs(&stdout_text),
            log,
        })
    }

    /// Resolve a workflow-supplied path inside the working directory
    fn workspace_path(&self, input: &str, raw: &str) -> Result<PathBuf, ActionError> {
        let relative = Path::new(raw);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ActionError::InvalidInput {
                name: input.to_string(),
                reason: format!("'{}' is not a path inside the working directory", raw),
            });
        }
        Ok(self.working_dir.join(relative))
    }

    /// Cache entry for a step: the `key` prefix plus a hash of the platform,
    /// the `toolchain` input and the contents of every `lock-files` entry
    async fn entry_key(&self, invocation: &ActionInvocation) -> Result<String, ActionError> {
        let prefix = required_input(invocation, "key")?;
        let toolchain = invocation.inputs.get("toolchain").cloned().unwrap_or_default();

        let mut descriptors: Vec<(String, Vec<u8>)> = vec![
            ("os".to_string(), std::env::consts::OS.as_bytes().to_vec()),
            ("arch".to_string(), std::env::consts::ARCH.as_bytes().to_vec()),
            ("toolchain".to_string(), toolchain.into_bytes()),
        ];

        let lock_files = invocation.inputs.get("lock-files").map(String::as_str).unwrap_or_default();
        for file in lock_files.split_whitespace() {
            let path = self.workspace_path("lock-files", file)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => descriptors.push((format!("lock:{}", file), bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Lock file {} not found, hashing its absence", file);
                    descriptors.push((format!("missing:{}", file), Vec::new()));
                }
                Err(e) => return Err(CacheError::from(e).into()),
            }
        }

        let descriptors: Vec<(&str, &[u8])> = descriptors
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
            .collect();
        Ok(cache_key(prefix, &descriptors))
    }

    /// Restore `path` from the cache, or save it when the key is missing
    async fn run_cache(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError> {
        let key = self.entry_key(invocation).await?;
        let key = key.as_str();
        let path = self.workspace_path("path", required_input(invocation, "path")?)?;

        if let Some(bytes) = self.cache.get(key).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(CacheError::from)?;
            }
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(CacheError::from)?;
            info!("Cache hit for {}", key);
            return Ok(ActionOutcome::success()
                .with_output("cache-hit", "true")
                .with_output("key", key));
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.cache.put(key, &bytes).await?;
                info!("Cache miss for {}, saved {} bytes", key, bytes.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Cache miss for {}, nothing to save", key);
            }
            Err(e) => return Err(CacheError::from(e).into()),
        }

        Ok(ActionOutcome::success()
            .with_output("cache-hit", "false")
            .with_output("key", key))
    }
}

fn read_error(e: std::io::Error) -> ActionError {
    ActionError::Internal(format!("failed to read action output: {}", e))
}

fn required_input<'a>(invocation: &'a ActionInvocation, name: &str) -> Result<&'a str, ActionError> {
    invocation
        .inputs
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ActionError::MissingInput(name.to_string()))
}

#[async_trait]
impl ActionExecutor for LocalActionExecutor {
    async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError> {
        self.invoke_streaming(invocation, &|_: &str| {}).await
    }

    async fn invoke_streaming(
        &self,
        invocation: &ActionInvocation,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<ActionOutcome, ActionError> {
        match &invocation.command {
            ActionCommand::Shell(script) => self.run_script(invocation, script, on_line).await,
            ActionCommand::Builtin(BuiltinAction::Cache) => self.run_cache(invocation).await,
        }
    }
}
