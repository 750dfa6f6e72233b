//! Invocation of runtime CLIs.

use crate::error::{classify, DriverError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// One CLI invocation against a runtime.
pub(crate) struct Invocation<'a> {
    program: &'a str,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    subject: String,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new<I, S>(program: &'a str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: None,
            subject: String::new(),
        }
    }

    /// Name of the entity or image the command concerns, used in errors.
    pub(crate) fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub(crate) fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Run to completion and return stdout.
    pub(crate) async fn output(self) -> Result<Vec<u8>, DriverError> {
        let shown = self.display();
        debug!(command = %shown, "Invoking runtime");

        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let (Some(data), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            pipe.write_all(&data).await?;
            pipe.shutdown().await?;
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| DriverError::Timeout(shown.clone(), limit))??,
            None => child.wait_with_output().await?,
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(
                &self.subject,
                shown,
                output.status.to_string(),
                &stderr,
            ))
        }
    }

    /// Run to completion, discarding stdout.
    pub(crate) async fn run(self) -> Result<(), DriverError> {
        self.output().await.map(|_| ())
    }

    /// Run to completion and return stdout as trimmed text.
    pub(crate) async fn text(self) -> Result<String, DriverError> {
        let stdout = self.output().await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}
