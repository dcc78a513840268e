//! Supervised recorder process

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::sdp::create_sdp_text;
use super::{CompletionHandle, RecordingDescription, RecordingOutcome};
use crate::error::Result;

/// Time a recorder gets to finalise its output after being asked to stop
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Exit status of a recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderExit {
    pub success: bool,
    pub code: Option<i32>,
}

/// A running recorder
#[async_trait]
pub trait RecorderChild: Send {
    fn pid(&self) -> Option<u32>;

    async fn wait(&mut self) -> Result<RecorderExit>;

    /// Ask the recorder to finish writing and exit
    fn terminate(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;
}

/// Starts recorders
pub trait RecorderLauncher: Send + Sync {
    /// Where the recording for `description` ends up
    fn output_path(&self, description: &RecordingDescription) -> PathBuf;

    fn launch(&self, description: &RecordingDescription, sdp: String) -> Result<Box<dyn RecorderChild>>;
}

/// Handle to one recorder; the child itself is owned by a supervisor task
#[derive(Debug)]
pub struct RecordingProcess {
    output_path: PathBuf,
    pid: Option<u32>,
    stop: CancellationToken,
}

impl RecordingProcess {
    /// Launch a recorder for `description`.
    ///
    /// `on_exit` fires once the recorder exits, or before returning if it
    /// could not be launched at all. The supervisor runs on `tasks`.
    pub fn start(
        launcher: &dyn RecorderLauncher,
        description: &RecordingDescription,
        on_exit: CompletionHandle,
        tasks: &TaskTracker,
    ) -> Result<Self> {
        let output_path = launcher.output_path(description);

        let launched = create_sdp_text(description).and_then(|sdp| launcher.launch(description, sdp));
        let mut child = match launched {
            Ok(child) => child,
            Err(e) => {
                error!(file_name = %description.file_name, error = %e, "Failed to start recorder");
                on_exit.fire(RecordingOutcome::Failed { reason: e.to_string() });
                return Err(e);
            }
        };

        let pid = child.pid();
        let stop = CancellationToken::new();
        let token = stop.clone();
        let path = output_path.clone();
        let file_name = description.file_name.clone();

        tasks.spawn(async move {
            let exited = tokio::select! {
                result = child.wait() => Some(result),
                () = token.cancelled() => None,
            };

            let (requested, result) = match exited {
                Some(result) => (false, result),
                None => {
                    if let Err(e) = child.terminate() {
                        warn!(file_name = %file_name, error = %e, "Failed to stop recorder gracefully");
                    }
                    let result = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(file_name = %file_name, "Recorder ignored stop request, killing");
                            if let Err(e) = child.kill() {
                                warn!(file_name = %file_name, error = %e, "Failed to kill recorder");
                            }
                            child.wait().await
                        }
                    };
                    (true, result)
                }
            };

            // ffmpeg reports a non-zero status when interrupted even though the file is complete
            let outcome = match result {
                Ok(exit) if exit.success || requested => RecordingOutcome::Completed { file_path: path },
                Ok(exit) => RecordingOutcome::Failed {
                    reason: format!("recorder exited with status {:?}", exit.code),
                },
                Err(e) => RecordingOutcome::Failed { reason: e.to_string() },
            };

            match &outcome {
                RecordingOutcome::Completed { file_path } => {
                    info!(file_name = %file_name, path = %file_path.display(), "Recorder finished");
                }
                other => warn!(file_name = %file_name, outcome = ?other, "Recorder ended without output"),
            }
            on_exit.fire(outcome);
        });

        Ok(Self { output_path, pid, stop })
    }

    /// Ask the recorder to finish. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            debug!(pid = ?self.pid, "Stopping recorder");
            self.stop.cancel();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}
