//! ShellExecutor - `sh -c` でコマンドを実行する CommandExecutor
//!
//! - stdout / stderr を同時に読み、stdout → stderr の順に連結して返す
//! - 出力は 64 KiB で切り詰め、UTF-8 として lossy にデコード
//! - unix では子を新しいプロセスグループで起動し、タイムアウト時と
//!   future が drop されたときにグループごと SIGKILL する
//! - タイムアウトしても、それまでに出た出力は返す

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::ports::{CommandExecutor, ExecutionFailed, FailureCause};

/// Maximum output size kept per execution (64KB).
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const TRUNCATED_MARKER: &str = "\n... [output truncated]";

/// kill 後に pipe の残りを読み切るまで待つ時間
const DRAIN_GRACE: Duration = Duration::from_secs(1);

type Reader = JoinHandle<io::Result<Vec<u8>>>;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// `-c` を受け付ける別の shell を使う（bash など）
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<String, ExecutionFailed> {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ExecutionFailed {
            output: String::new(),
            cause: FailureCause::Spawn(e.to_string()),
        })?;
        let mut group = ProcessGroup::of(&child);

        let mut stdout = tokio::spawn(read_capped(child.stdout.take()));
        let mut stderr = tokio::spawn(read_capped(child.stderr.take()));

        let run = async {
            let out = join_reader(&mut stdout).await?;
            let err = join_reader(&mut stderr).await?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, out, err))
        };
        let finished = tokio::time::timeout(timeout, run).await;

        match finished {
            Ok(Ok((status, mut out, err))) => {
                group.disarm();
                out.extend_from_slice(&err);
                let output = render_output(&out);
                if status.success() {
                    Ok(output)
                } else {
                    Err(ExecutionFailed {
                        output,
                        cause: failure_cause(status),
                    })
                }
            }
            Ok(Err(e)) => {
                group.kill();
                let _ = child.kill().await;
                Err(ExecutionFailed {
                    output: String::new(),
                    cause: FailureCause::Spawn(e.to_string()),
                })
            }
            Err(_) => {
                group.kill();
                let _ = child.kill().await;
                let mut out = drain(stdout).await;
                out.extend_from_slice(&drain(stderr).await);
                Err(ExecutionFailed {
                    output: render_output(&out),
                    cause: FailureCause::TimedOut(timeout),
                })
            }
        }
    }
}

/// 子プロセスのグループ。drop されたときにまだ生きていればまとめて殺す
///
/// `sh -c` が fork した孫プロセスは `Child::kill` では止まらないため。
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        // Safety: pgid is our child's group and the child has not been reaped yet.
        #[cfg(unix)]
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }

    /// 正常終了後は pgid が再利用されうるので触らない
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn join_reader(reader: &mut Reader) -> io::Result<Vec<u8>> {
    reader.await.map_err(io::Error::other)?
}

/// kill 後の残りを回収する。pipe が閉じなければ諦めて空にする
async fn drain(mut reader: Reader) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_GRACE, join_reader(&mut reader)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            reader.abort();
            Vec::new()
        }
    }
}

/// 上限まで溜め、それ以降は読み捨てる（pipe が詰まって子が止まらないように）
async fn read_capped<R>(reader: Option<R>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };

    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        // +1 して「切り詰めが必要か」を後で判定できるようにする
        let room = (MAX_OUTPUT_SIZE + 1).saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}

fn render_output(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_OUTPUT_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut output = String::from_utf8_lossy(&bytes[..MAX_OUTPUT_SIZE]).into_owned();
    output.push_str(TRUNCATED_MARKER);
    output
}

fn failure_cause(status: ExitStatus) -> FailureCause {
    if let Some(code) = status.code() {
        return FailureCause::ExitCode(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return FailureCause::Signal(signal);
        }
    }

    FailureCause::ExitCode(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = ShellExecutor::new().execute("echo hi", TIMEOUT).await.unwrap();
        assert_eq!(output, "hi\n");
    }

    #[rstest]
    #[case("exit 1", 1)]
    #[case("exit 3", 3)]
    #[case("false", 1)]
    #[tokio::test]
    async fn non_zero_exit_is_a_failure(#[case] command: &str, #[case] code: i32) {
        let err = ShellExecutor::new().execute(command, TIMEOUT).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::ExitCode(code));
    }

    #[tokio::test]
    async fn stderr_is_part_of_the_output() {
        let err = ShellExecutor::new()
            .execute("echo out; echo oops >&2; exit 2", TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.output.contains("out"));
        assert!(err.output.contains("oops"));
        assert_eq!(err.cause, FailureCause::ExitCode(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_by_signal() {
        let err = ShellExecutor::new()
            .execute("kill -9 $$", TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.cause, FailureCause::Signal(9));
    }

    #[tokio::test]
    async fn times_out_and_kills_the_child() {
        let started = std::time::Instant::now();
        let err = ShellExecutor::new()
            .execute("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FailureCause::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_keeps_what_was_printed() {
        let err = ShellExecutor::new()
            .execute("echo started; sleep 5", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FailureCause::TimedOut(_)));
        assert_eq!(err.output, "started\n");
    }

    fn marker() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("shuttle-marker-{}", ulid::Ulid::new()))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_forked_children() {
        let marker = marker();
        let command = format!("(sleep 1; touch {})", marker.display());

        let err = ShellExecutor::new()
            .execute(&command, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FailureCause::TimedOut(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_the_execution_kills_forked_children() {
        let marker = marker();
        let command = format!("(sleep 1; touch {})", marker.display());

        let handle = tokio::spawn(async move {
            ShellExecutor::new()
                .execute(&command, Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_failure() {
        let err = ShellExecutor::new()
            .with_shell("/nonexistent/shell")
            .execute("true", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FailureCause::Spawn(_)));
    }

    #[tokio::test]
    async fn large_output_is_truncated() {
        let output = ShellExecutor::new()
            .execute("head -c 100000 /dev/zero | tr '\\0' a", TIMEOUT)
            .await
            .unwrap();
        assert!(output.ends_with(TRUNCATED_MARKER));
        assert_eq!(output.len(), MAX_OUTPUT_SIZE + TRUNCATED_MARKER.len());
    }
}
