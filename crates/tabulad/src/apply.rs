//! The `apply` command: feed snapshot files to an executor and report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use tabula_core::{
    AckState, BranchId, ContractId, ExecutionBcard, ExecutorConfig, RegionMap, ServerId,
    TableQueryBcard, TableRaftState,
};
use tabula_executor::{ContractExecutor, ContractRelay, ExecutorStatus, ShardStatus};
use tabula_metrics::render_prometheus;
use tabula_store::Multistore;

/// How long one snapshot may take to apply before giving up.
const APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Log index of the empty state the executor starts from.
const SEED_INDEX: u64 = 0;

pub struct ApplyReport {
    pub json: Report,
    pub prometheus: String,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub server_id: ServerId,
    #[serde(flatten)]
    pub status: ExecutorStatus,
    pub shard_status: RegionMap<ShardStatus>,
    pub acks: Vec<AckEntry>,
    pub execution_bcards: Vec<ExecutionBcard>,
    pub query_bcards: Vec<QueryCardEntry>,
}

#[derive(Debug, Serialize)]
pub struct AckEntry {
    pub server: ServerId,
    pub contract: ContractId,
    pub state: AckState,
    pub version: Option<u64>,
    pub branch: Option<BranchId>,
}

#[derive(Debug, Serialize)]
pub struct QueryCardEntry {
    pub id: Uuid,
    #[serde(flatten)]
    pub card: TableQueryBcard,
}

pub fn load_snapshot(path: &Path) -> anyhow::Result<TableRaftState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing snapshot {}", path.display()))
}

fn open_store(config: &ExecutorConfig, in_memory: bool) -> anyhow::Result<Multistore> {
    if in_memory {
        return Ok(Multistore::open_in_memory()?);
    }
    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.data_dir.join("table.redb");
    Ok(Multistore::open(&path)?)
}

/// Apply every snapshot in order, waiting for each, then shut down.
pub async fn run(
    config: ExecutorConfig,
    snapshots: &[PathBuf],
    in_memory: bool,
) -> anyhow::Result<ApplyReport> {
    let snapshots = snapshots
        .iter()
        .map(|p| load_snapshot(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    // The executor starts from an empty state at this index, so it would
    // report a snapshot at or below it as applied immediately.
    if let Some(first) = snapshots.first()
        && first.log_index <= SEED_INDEX
    {
        bail!(
            "snapshot log indexes must start above {SEED_INDEX} (got {})",
            first.log_index
        );
    }
    for pair in snapshots.windows(2) {
        if pair[1].log_index <= pair[0].log_index {
            bail!(
                "snapshot log indexes must increase ({} then {})",
                pair[0].log_index,
                pair[1].log_index
            );
        }
    }

    let store = open_store(&config, in_memory)?;
    let server_id = config.server_id;
    let (raft_state, raft_rx) = watch::channel(Arc::new(TableRaftState::empty(SEED_INDEX)));
    let executor = ContractExecutor::builder(config, raft_rx, store).start();

    for snapshot in snapshots {
        let index = snapshot.log_index;
        let contracts = snapshot.contracts.len();
        raft_state.send_replace(Arc::new(snapshot));
        let status = tokio::time::timeout(APPLY_TIMEOUT, executor.wait_for_applied(index))
            .await
            .with_context(|| format!("snapshot {index} not applied within {APPLY_TIMEOUT:?}"))??;
        info!(
            log_index = index,
            contracts,
            executions = status.executions.len(),
            "snapshot applied"
        );
    }

    let report = ApplyReport {
        json: Report {
            server_id,
            status: executor.status(),
            shard_status: executor.shard_status(),
            acks: ack_entries(executor.relay()),
            execution_bcards: executor.relay().execution_bcards().snapshot().into_values().collect(),
            query_bcards: executor
                .relay()
                .query_bcards()
                .snapshot()
                .into_iter()
                .map(|(id, card)| QueryCardEntry { id, card })
                .collect(),
        },
        prometheus: render_prometheus(executor.metrics()),
    };
    executor.shutdown().await;
    Ok(report)
}

fn ack_entries(relay: &ContractRelay) -> Vec<AckEntry> {
    relay
        .acks()
        .snapshot()
        .into_iter()
        .map(|((server, contract), ack)| AckEntry {
            server,
            contract,
            state: ack.state,
            version: ack.version,
            branch: ack.branch,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "log_index": 3,
        "contracts": {
            "00000000-0000-0000-0000-000000000011": [
                {"left": "a", "right": "m"},
                {
                    "replicas": ["00000000-0000-0000-0000-000000000001"],
                    "voters": ["00000000-0000-0000-0000-000000000001"],
                    "primary": {"server": "00000000-0000-0000-0000-000000000001"},
                    "branch": "00000000-0000-0000-0000-000000000021"
                }
            ]
        },
        "current_branches": [
            [{"left": "a", "right": "m"}, "00000000-0000-0000-0000-000000000021"]
        ]
    }"#;

    fn config() -> ExecutorConfig {
        ExecutorConfig::new(ServerId(Uuid::from_u128(1)))
    }

    #[tokio::test]
    async fn applies_snapshot_file_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let report = run(config(), &[path], true).await.unwrap();
        assert_eq!(report.json.status.applied_index, Some(3));
        assert_eq!(report.json.status.executions.len(), 1);
        assert_eq!(report.json.execution_bcards.len(), 1);
        assert_eq!(report.json.query_bcards.len(), 1);
        assert_eq!(report.json.acks.len(), 1);
        assert_eq!(report.json.acks[0].state, AckState::PrimaryReady);
        assert!(report.prometheus.contains("tabula_created{collection=\"table\"} 1\n"));

        let json = serde_json::to_value(&report.json).unwrap();
        assert_eq!(json["applied_index"], 3);
        assert_eq!(json["acks"][0]["state"], "primary_ready");
    }

    #[tokio::test]
    async fn persistent_store_lives_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, SNAPSHOT).unwrap();
        let mut config = config();
        config.data_dir = dir.path().join("data");

        run(config, &[path], false).await.unwrap();
        assert!(dir.path().join("data").join("table.redb").exists());
    }

    #[tokio::test]
    async fn rejects_out_of_order_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let err = run(config(), &[path.clone(), path], true)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("must increase"));
    }

    #[tokio::test]
    async fn rejects_snapshot_at_seed_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s0.json");
        std::fs::write(&path, SNAPSHOT.replace(r#""log_index": 3"#, r#""log_index": 0"#)).unwrap();

        let err = run(config(), &[path], true).await.err().unwrap();
        assert!(err.to_string().contains("must start above 0"));
    }

    #[test]
    fn missing_snapshot_names_the_file() {
        let err = load_snapshot(Path::new("/nonexistent/s9.json")).unwrap_err();
        assert!(format!("{err:#}").contains("s9.json"));
    }
}
