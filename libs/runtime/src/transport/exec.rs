use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::ExecConfig;
use crate::error::{Error, Result};

use super::HandlerTransport;

/// Invokes the configured command as a subprocess, feeding `request` on
/// stdin and reading stdout to EOF. Mirrors the teacher's subprocess-free
/// style generalized to an actual subprocess boundary: one responsibility
/// (move bytes in, move bytes out, surface exit/timeout failures), no
/// parsing of the payload.
pub struct ExecTransport {
    config: ExecConfig,
}

impl ExecTransport {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    async fn run(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // On timeout, `tokio::time::timeout` drops the in-flight future;
            // `kill_on_drop` is what actually reclaims the child process.
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(Error::HandlerIo)?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let write_fut = async {
            stdin.write_all(&request).await?;
            stdin.shutdown().await
        };
        let mut stdout_buf = Vec::new();
        let read_fut = stdout.read_to_end(&mut stdout_buf);

        let debug = self.config.debug;
        let stderr_fut = async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = String::new();
            let mut line = String::new();
            use tokio::io::AsyncBufReadExt;
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if debug {
                    tracing::debug!(stderr = %line.trim_end(), "handler stderr");
                }
                buf.push_str(&line);
            }
            buf
        };

        let (write_res, read_res, stderr_buf) = tokio::join!(write_fut, read_fut, stderr_fut);
        write_res.map_err(Error::HandlerIo)?;
        read_res.map_err(Error::HandlerIo)?;

        let status = child.wait().await.map_err(Error::HandlerIo)?;
        if !status.success() {
            return Err(Error::HandlerExit {
                status,
                stderr: stderr_buf,
            });
        }
        Ok(stdout_buf)
    }
}

#[async_trait]
impl HandlerTransport for ExecTransport {
    async fn invoke(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        match self.config.timeout {
            None => self.run(request).await,
            Some(timeout) => match tokio::time::timeout(timeout, self.run(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::HandlerTimeout(timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(command: &str, args: &[&str]) -> ExecConfig {
        ExecConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: vec![],
            timeout: None,
            debug: false,
        }
    }

    #[tokio::test]
    async fn cat_echoes_stdin_to_stdout() {
        let transport = ExecTransport::new(cfg("cat", &[]));
        let out = transport.invoke(b"hello".to_vec()).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_handler_exit_error() {
        let transport = ExecTransport::new(cfg("sh", &["-c", "exit 3"]));
        let err = transport.invoke(b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::HandlerExit { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_and_errors() {
        let mut config = cfg("sleep", &["5"]);
        config.timeout = Some(Duration::from_millis(50));
        let transport = ExecTransport::new(config);
        let err = transport.invoke(b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::HandlerTimeout(_)));
    }
}
