//! Contracts, acks, cards, and the committed table Raft state.
//!
//! These mirror what the table's consensus log publishes and what the
//! executor sends back. The executor treats all of them as read-only
//! snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, ContractId, ServerId};
use crate::region::{Region, RegionMap};

// ── Contracts ───────────────────────────────────────────────────────

/// The server designated as primary for a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryAssignment {
    pub server: ServerId,
    /// Server the primary is handing over to, if a handover is underway.
    #[serde(default)]
    pub hand_over: Option<ServerId>,
}

/// Cluster-agreed replication instructions for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Every server that should hold a copy of the region.
    pub replicas: BTreeSet<ServerId>,
    /// Replicas whose acks count towards write quorum.
    #[serde(default)]
    pub voters: BTreeSet<ServerId>,
    /// Replacement voter set during a reconfiguration.
    #[serde(default)]
    pub temp_voters: Option<BTreeSet<ServerId>>,
    #[serde(default)]
    pub primary: Option<PrimaryAssignment>,
    /// The branch the contract expects the region's history to be on.
    pub branch: BranchId,
}

impl Contract {
    /// A contract with no replicas and no primary.
    pub fn new(branch: BranchId) -> Self {
        Self {
            replicas: BTreeSet::new(),
            voters: BTreeSet::new(),
            temp_voters: None,
            primary: None,
            branch,
        }
    }

    pub fn with_primary(mut self, server: ServerId) -> Self {
        self.replicas.insert(server);
        self.voters.insert(server);
        self.primary = Some(PrimaryAssignment {
            server,
            hand_over: None,
        });
        self
    }

    /// Add voting replicas.
    pub fn with_replicas(mut self, servers: impl IntoIterator<Item = ServerId>) -> Self {
        for server in servers {
            self.replicas.insert(server);
            self.voters.insert(server);
        }
        self
    }

    /// Add replicas that do not vote.
    pub fn with_non_voting_replicas(mut self, servers: impl IntoIterator<Item = ServerId>) -> Self {
        self.replicas.extend(servers);
        self
    }

    pub fn primary_server(&self) -> Option<ServerId> {
        self.primary.as_ref().map(|p| p.server)
    }

    pub fn is_voter(&self, server: &ServerId) -> bool {
        self.voters.contains(server)
            || self
                .temp_voters
                .as_ref()
                .is_some_and(|temp| temp.contains(server))
    }
}

// ── Raft state ──────────────────────────────────────────────────────

/// One committed snapshot of a table's contract state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableRaftState {
    /// Raft log index this snapshot was committed at.
    pub log_index: u64,
    /// Active contracts and the region each one governs.
    pub contracts: BTreeMap<ContractId, (Region, Contract)>,
    /// Authoritative branch per region.
    pub current_branches: RegionMap<BranchId>,
}

impl TableRaftState {
    /// A snapshot with no contracts.
    pub fn empty(log_index: u64) -> Self {
        Self {
            log_index,
            ..Self::default()
        }
    }

    pub fn new(
        log_index: u64,
        contracts: impl IntoIterator<Item = (ContractId, Region, Contract)>,
        branches: Vec<(Region, BranchId)>,
    ) -> Self {
        Self {
            log_index,
            contracts: contracts
                .into_iter()
                .map(|(cid, region, contract)| (cid, (region, contract)))
                .collect(),
            current_branches: RegionMap::from_entries(branches),
        }
    }
}

// ── Acks ────────────────────────────────────────────────────────────

/// Progress reported by an execution for its contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// Primary wants the coordinator to register a new branch.
    PrimaryNeedBranch,
    /// Primary is running but not yet accepting writes.
    PrimaryInProgress,
    /// Primary is accepting writes on the contract's branch.
    PrimaryReady,
    /// Secondary cannot reach its primary.
    SecondaryNeedPrimary,
    SecondaryBackfilling,
    SecondaryStreaming,
    /// Nothing to report (erase finished, or no role).
    Nothing,
}

/// An ack sent to the contract coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAck {
    pub state: AckState,
    /// Replication timestamp reached, where meaningful.
    #[serde(default)]
    pub version: Option<u64>,
    /// Branch proposed or followed by the execution.
    #[serde(default)]
    pub branch: Option<BranchId>,
}

impl ContractAck {
    pub fn new(state: AckState) -> Self {
        Self {
            state,
            version: None,
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

// ── Cards ───────────────────────────────────────────────────────────

/// Lets peers open backfill and streaming connections to a primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBcard {
    pub server: ServerId,
    pub branch: BranchId,
    pub region: Region,
    pub address: String,
}

/// Lets any server in the cluster route queries to a primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQueryBcard {
    pub server: ServerId,
    pub region: Region,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn server(n: u128) -> ServerId {
        ServerId(Uuid::from_u128(n))
    }

    #[test]
    fn primary_is_a_voting_replica() {
        let c = Contract::new(BranchId::nil()).with_primary(server(1));
        assert_eq!(c.primary_server(), Some(server(1)));
        assert!(c.replicas.contains(&server(1)));
        assert!(c.is_voter(&server(1)));
    }

    #[test]
    fn temp_voters_count_as_voters() {
        let mut c = Contract::new(BranchId::nil()).with_non_voting_replicas([server(2)]);
        assert!(!c.is_voter(&server(2)));
        c.temp_voters = Some([server(2)].into());
        assert!(c.is_voter(&server(2)));
    }

    #[test]
    fn raft_state_parses_from_json() {
        let json = r#"{
            "log_index": 4,
            "contracts": {
                "00000000-0000-0000-0000-000000000011": [
                    {"left": "a", "right": "m"},
                    {
                        "replicas": ["00000000-0000-0000-0000-000000000001"],
                        "primary": {"server": "00000000-0000-0000-0000-000000000001"},
                        "branch": "00000000-0000-0000-0000-000000000021"
                    }
                ]
            },
            "current_branches": [
                [{"left": "a", "right": "m"}, "00000000-0000-0000-0000-000000000021"]
            ]
        }"#;
        let state: TableRaftState = serde_json::from_str(json).unwrap();
        assert_eq!(state.log_index, 4);
        let (region, contract) = state.contracts.values().next().unwrap();
        assert_eq!(region, &Region::bounded("a", "m"));
        assert_eq!(contract.primary_server(), Some(server(1)));
        assert_eq!(
            state.current_branches.iter().next(),
            Some((region, &BranchId(Uuid::from_u128(0x21))))
        );
    }
}
