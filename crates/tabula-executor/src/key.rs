//! Execution keys: the identity of a running execution.
//!
//! A contract can be replaced without the server's job changing, so the
//! executor does not key executions by contract id. It derives an
//! [`ExecutionKey`] instead: same key means the existing execution is
//! updated in place, a different key means the old one is destroyed and a
//! new one created. The key changes when:
//!
//! - the region changes
//! - this server's role (primary, secondary, erase) changes
//! - the acting primary or the authoritative branch changes

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tabula_core::{BranchId, Contract, Region, RegionMap, ReplicaPolicyKind, ServerId};

/// What this server does for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
    /// Hold no data for the region; erase whatever is there.
    Erase,
}

impl Role {
    /// Used for metrics namespace names.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Erase => "erase",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of an execution. Ordered field by field so it can key a map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub region: Region,
    pub role: Role,
    /// The contract's acting primary, if it names one.
    pub primary: Option<ServerId>,
    /// The authoritative branch for `region` when the key was derived.
    pub branch: Option<BranchId>,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.region)?;
        if let Some(primary) = &self.primary {
            write!(f, " primary={primary}")?;
        }
        if let Some(branch) = &self.branch {
            write!(f, " branch={branch}")?;
        }
        Ok(())
    }
}

/// Decides whether a non-primary server is still wanted as a secondary.
///
/// Servers that are not wanted get an erase execution instead.
pub trait ReplicaPolicy: Send + Sync {
    fn wants_secondary(&self, contract: &Contract, server: &ServerId) -> bool;
}

/// Every listed replica is a secondary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaMembership;

impl ReplicaPolicy for ReplicaMembership {
    fn wants_secondary(&self, contract: &Contract, server: &ServerId) -> bool {
        contract.replicas.contains(server)
    }
}

/// Only replicas that vote (permanently or temporarily) are secondaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct VotingReplicas;

impl ReplicaPolicy for VotingReplicas {
    fn wants_secondary(&self, contract: &Contract, server: &ServerId) -> bool {
        contract.replicas.contains(server) && contract.is_voter(server)
    }
}

/// Derives execution keys for one server.
#[derive(Clone)]
pub struct KeyDeriver {
    server_id: ServerId,
    policy: Arc<dyn ReplicaPolicy>,
}

impl KeyDeriver {
    pub fn new(server_id: ServerId, policy: Arc<dyn ReplicaPolicy>) -> Self {
        Self { server_id, policy }
    }

    /// Build a deriver using the configured policy.
    pub fn with_policy_kind(server_id: ServerId, kind: ReplicaPolicyKind) -> Self {
        let policy: Arc<dyn ReplicaPolicy> = match kind {
            ReplicaPolicyKind::Replicas => Arc::new(ReplicaMembership),
            ReplicaPolicyKind::Voters => Arc::new(VotingReplicas),
        };
        Self::new(server_id, policy)
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// The role this server plays under `contract`.
    pub fn role_for(&self, contract: &Contract) -> Role {
        if contract.primary_server() == Some(self.server_id) {
            Role::Primary
        } else if self.policy.wants_secondary(contract, &self.server_id) {
            Role::Secondary
        } else {
            Role::Erase
        }
    }

    /// The execution key for `contract` over `region`, given the branch
    /// that is authoritative there.
    pub fn derive(
        &self,
        region: &Region,
        contract: &Contract,
        branch: Option<BranchId>,
    ) -> ExecutionKey {
        ExecutionKey {
            region: region.clone(),
            role: self.role_for(contract),
            primary: contract.primary_server(),
            branch,
        }
    }

    /// Keys for one `(region, contract)` pair of a snapshot: one per piece
    /// of `region` with a distinct authoritative branch in `branches`.
    /// Pieces with no branch get a key with `branch: None`.
    pub fn derive_all(
        &self,
        region: &Region,
        contract: &Contract,
        branches: &RegionMap<BranchId>,
    ) -> Vec<ExecutionKey> {
        let mut keys = Vec::new();
        branches.visit(region, |piece, branch| {
            keys.push(self.derive(piece, contract, branch.copied()));
        });
        keys
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn server(n: u128) -> ServerId {
        ServerId(Uuid::from_u128(n))
    }

    fn branch(n: u128) -> BranchId {
        BranchId(Uuid::from_u128(n))
    }

    fn branches(region: &Region, b: BranchId) -> RegionMap<BranchId> {
        RegionMap::from_entries(vec![(region.clone(), b)])
    }

    #[test]
    fn primary_role_when_named_primary() {
        let deriver = KeyDeriver::new(server(1), Arc::new(ReplicaMembership));
        let region = Region::bounded("a", "m");
        let contract = Contract::new(branch(5)).with_primary(server(1));

        let keys = deriver.derive_all(&region, &contract, &branches(&region, branch(5)));
        assert_eq!(keys.len(), 1);
        let key = &keys[0];
        assert_eq!(key.role, Role::Primary);
        assert_eq!(key.primary, Some(server(1)));
        assert_eq!(key.branch, Some(branch(5)));
    }

    #[test]
    fn secondary_role_when_replica() {
        let deriver = KeyDeriver::new(server(2), Arc::new(ReplicaMembership));
        let contract = Contract::new(branch(5))
            .with_primary(server(1))
            .with_replicas([server(2)]);
        assert_eq!(deriver.role_for(&contract), Role::Secondary);
    }

    #[test]
    fn erase_role_when_absent() {
        let deriver = KeyDeriver::new(server(3), Arc::new(ReplicaMembership));
        let contract = Contract::new(branch(5))
            .with_primary(server(1))
            .with_replicas([server(2)]);
        assert_eq!(deriver.role_for(&contract), Role::Erase);
    }

    #[test]
    fn voting_policy_erases_non_voters() {
        let contract = Contract::new(branch(5))
            .with_primary(server(1))
            .with_non_voting_replicas([server(2)]);

        let by_membership = KeyDeriver::with_policy_kind(server(2), ReplicaPolicyKind::Replicas);
        let by_vote = KeyDeriver::with_policy_kind(server(2), ReplicaPolicyKind::Voters);
        assert_eq!(by_membership.role_for(&contract), Role::Secondary);
        assert_eq!(by_vote.role_for(&contract), Role::Erase);
    }

    #[test]
    fn key_ignores_contract_identity_but_tracks_branch() {
        let deriver = KeyDeriver::new(server(1), Arc::new(ReplicaMembership));
        let region = Region::bounded("a", "m");
        let contract = Contract::new(branch(5)).with_primary(server(1));

        let k1 = deriver.derive_all(&region, &contract, &branches(&region, branch(5)));
        let k2 = deriver.derive_all(&region, &contract.clone(), &branches(&region, branch(5)));
        let k3 = deriver.derive_all(&region, &contract, &branches(&region, branch(6)));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn role_change_changes_key() {
        let region = Region::bounded("a", "m");
        let map = branches(&region, branch(5));
        let deriver = KeyDeriver::new(server(1), Arc::new(ReplicaMembership));

        let as_primary = Contract::new(branch(5)).with_primary(server(1));
        let as_secondary = Contract::new(branch(5))
            .with_primary(server(2))
            .with_replicas([server(1)]);
        assert_ne!(
            deriver.derive_all(&region, &as_primary, &map),
            deriver.derive_all(&region, &as_secondary, &map)
        );
    }

    #[test]
    fn one_key_per_branch_piece() {
        let deriver = KeyDeriver::new(server(1), Arc::new(ReplicaMembership));
        let contract = Contract::new(branch(5)).with_primary(server(1));
        let map = RegionMap::from_entries(vec![
            (Region::bounded("a", "m"), branch(5)),
            (Region::bounded("m", "t"), branch(6)),
        ]);

        let keys = deriver.derive_all(&Region::bounded("a", "z"), &contract, &map);
        let pieces: Vec<_> = keys.iter().map(|k| (k.region.clone(), k.branch)).collect();
        assert_eq!(
            pieces,
            vec![
                (Region::bounded("a", "m"), Some(branch(5))),
                (Region::bounded("m", "t"), Some(branch(6))),
                (Region::bounded("t", "z"), None),
            ]
        );
        assert!(keys.iter().all(|k| k.role == Role::Primary));
    }

    #[test]
    fn key_serializes_with_snake_case_role() {
        let key = ExecutionKey {
            region: Region::from_key("q"),
            role: Role::Secondary,
            primary: Some(server(2)),
            branch: None,
        };
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["role"], "secondary");
        assert_eq!(json["region"]["right"], serde_json::Value::Null);
        assert_eq!(json["primary"], "00000000-0000-0000-0000-000000000002");
        assert_eq!(
            key.to_string(),
            "secondary [\"q\", +inf) primary=00000000-0000-0000-0000-000000000002"
        );
    }

    #[test]
    fn keys_order_by_region_first() {
        let a = ExecutionKey {
            region: Region::bounded("a", "m"),
            role: Role::Erase,
            primary: None,
            branch: None,
        };
        let b = ExecutionKey {
            region: Region::bounded("m", "z"),
            role: Role::Primary,
            primary: None,
            branch: None,
        };
        assert!(a < b);
    }
}
