// pgphase/src/utils/process.rs
use std::process::ExitStatus;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;

/// Only the end of an engine's stderr is kept for error reports.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Drains `stderr` in the background so the child never blocks on a full pipe.
pub fn collect_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut captured = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut captured).await {
            tracing::debug!("reading engine stderr failed: {}", e);
        }
        tail(&captured)
    })
}

pub async fn stderr_text(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

pub fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => format!("terminated: {}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_the_end() {
        let mut bytes = vec![b'a'; STDERR_TAIL_BYTES];
        bytes.extend_from_slice(b"pg_restore: error: relation already exists\n");
        let kept = tail(&bytes);
        assert!(kept.ends_with("relation already exists"));
        assert_eq!(kept.len(), STDERR_TAIL_BYTES - 1);
    }
}
