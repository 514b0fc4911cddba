use shepherd_core::fsio::{read_json, write_json_atomic};
use shepherd_core::{Heartbeat, ShepherdResult, TeamPaths};

/// Reads and writes `workers/<name>/heartbeat.json`.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    paths: TeamPaths,
}

impl HeartbeatStore {
    /// Heartbeats under the team's `workers/` directory.
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    /// Overwrite the worker's heartbeat.
    pub async fn write(&self, heartbeat: &Heartbeat) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.heartbeat_file(&heartbeat.worker_name), heartbeat).await
    }

    /// Last heartbeat `worker` wrote, if any.
    pub async fn read(&self, worker: &str) -> ShepherdResult<Option<Heartbeat>> {
        read_json(&self.paths.heartbeat_file(worker)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use shepherd_core::WorkerStatus;

    #[tokio::test]
    async fn test_heartbeat_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeartbeatStore::new(TeamPaths::new(dir.path(), "t"));
        assert!(store.read("worker-1").await.unwrap().is_none());
        let mut hb = Heartbeat::new("worker-1", "t", "claude");
        store.write(&hb).await.unwrap();
        hb.status = WorkerStatus::Executing;
        hb.consecutive_errors = 2;
        store.write(&hb).await.unwrap();
        let read = store.read("worker-1").await.unwrap().unwrap();
        assert_eq!(read.status, WorkerStatus::Executing);
        assert_eq!(read.consecutive_errors, 2);
    }
}
