//! Helper subprocess services.
//!
//! A [`Service`] wraps a long-running child process that speaks the
//! dictionary line protocol on its standard streams: the node writes
//! request frames to the child's stdin, and a reader task parses frames
//! from its stdout and hands each one to the registered handler.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ethermesh_core::Dictionary;

use crate::error::OverlayError;

/// Callback invoked with each message frame the helper emits.
pub type ServiceHandler = Arc<dyn Fn(Dictionary) + Send + Sync>;

/// A helper subprocess speaking the dictionary line protocol.
pub struct Service {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// Spawn `path` and start reading message frames from it.
    pub fn start(
        name: &str,
        path: &Path,
        handler: ServiceHandler,
    ) -> Result<Self, OverlayError> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OverlayError::ServiceSpawn(name.to_string(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OverlayError::ServiceStopped(name.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OverlayError::ServiceStopped(name.to_string()))?;

        info!("service {name} started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Self::read_loop(
            name.to_string(),
            stdout,
            handler,
            stop_rx,
        ));

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn read_loop(
        name: String,
        stdout: tokio::process::ChildStdout,
        handler: ServiceHandler,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut block = String::new();
        loop {
            let line = tokio::select! {
                result = lines.next_line() => match result {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("service {name}: stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!("service {name}: read error: {e}");
                        break;
                    }
                },
                _ = stop_rx.changed() => break,
            };

            if line.is_empty() {
                if !block.is_empty() {
                    match Dictionary::parse_frame(&block) {
                        Ok(message) => handler(message),
                        Err(e) => warn!("service {name}: malformed message: {e}"),
                    }
                    block.clear();
                }
            } else {
                block.push_str(&line);
                block.push('\n');
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one message frame to the helper's stdin.
    pub async fn send(&self, message: &Dictionary) -> Result<(), OverlayError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| OverlayError::ServiceStopped(self.name.clone()))?;
        stdin.write_all(message.to_frame().as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Kill the child and stop the reader task.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        *self.stdin.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex as StdMutex;

    /// Write a small executable helper script for tests.
    fn write_script(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("helper.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn frames_from_child_reach_the_handler() {
        let dir = tempfile::tempdir().unwrap();
        // Emit one frame, then linger so the frame is not lost to a race
        // between emission and child exit.
        let script = write_script(
            &dir,
            "printf 'type=netconf-response\\nrequestId=abc\\n\\n'; sleep 5",
        );

        let received: Arc<StdMutex<Vec<Dictionary>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let service = Service::start(
            "test",
            &script,
            Arc::new(move |d| sink.lock().unwrap().push(d)),
        )
        .unwrap();

        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let messages = received.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].get("type"), Some("netconf-response"));
        assert_eq!(messages[0].get("requestId"), Some("abc"));

        service.stop().await;
    }

    #[tokio::test]
    async fn send_reaches_child_stdin() {
        let dir = tempfile::tempdir().unwrap();
        // Echo stdin back verbatim.
        let script = write_script(&dir, "cat");

        let received: Arc<StdMutex<Vec<Dictionary>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let service = Service::start(
            "echo",
            &script,
            Arc::new(move |d| sink.lock().unwrap().push(d)),
        )
        .unwrap();

        let mut request = Dictionary::new();
        request.insert("type", "netconf-request");
        request.insert("nwid", "10");
        service.send(&request).await.unwrap();

        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(received.lock().unwrap().first(), Some(&request));

        service.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let result = Service::start(
            "missing",
            Path::new("/nonexistent/helper"),
            Arc::new(|_| {}),
        );
        assert!(matches!(result, Err(OverlayError::ServiceSpawn(_, _))));
    }

    #[tokio::test]
    async fn send_after_stop_fails() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "sleep 5");
        let service = Service::start("stopped", &script, Arc::new(|_| {})).unwrap();
        service.stop().await;
        assert!(matches!(
            service.send(&Dictionary::new()).await,
            Err(OverlayError::ServiceStopped(_))
        ));
    }
}
