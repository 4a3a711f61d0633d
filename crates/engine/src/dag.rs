//! DAG validation. Run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs (operators and artifacts together) must be unique.
//! 2. Every edge must reference valid node IDs and connect an operator to an
//!    artifact or an artifact to an operator.
//! 3. Every artifact has exactly one producing operator.
//! 4. The operator graph must be acyclic (topological sort must succeed).
//!
//! Returns a [`DagPlan`] with operators in topological execution order.

use std::collections::{HashMap, HashSet, VecDeque};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{EngineError, models::WorkflowDag};

/// The validated shape of a DAG, indexed for execution.
#[derive(Debug, Clone, Default)]
pub struct DagPlan {
    /// Operator IDs in topological order. Ties keep declaration order.
    pub order: Vec<Uuid>,
    /// Artifact -> its producing operator.
    pub producer: HashMap<Uuid, Uuid>,
    /// Operator -> input artifacts, sorted by edge `idx`.
    pub inputs: HashMap<Uuid, Vec<Uuid>>,
    /// Operator -> output artifacts, sorted by edge `idx`.
    pub outputs: HashMap<Uuid, Vec<Uuid>>,
}

impl DagPlan {
    pub fn inputs_of(&self, operator: Uuid) -> &[Uuid] {
        self.inputs.get(&operator).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn outputs_of(&self, operator: Uuid) -> &[Uuid] {
        self.outputs.get(&operator).map(Vec::as_slice).unwrap_or_default()
    }

    /// Operators producing any input of `operator`, without duplicates.
    pub fn upstream_of(&self, operator: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.inputs_of(operator)
            .iter()
            .filter_map(|a| self.producer.get(a).copied())
            .filter(|op| seen.insert(*op))
            .collect()
    }
}

/// Validate the DAG and index it for execution.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::InvalidEdge`] if an edge joins two nodes of the same kind.
/// - [`EngineError::ArtifactProducers`] if an artifact has zero or several producers.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(dag: &WorkflowDag) -> Result<DagPlan, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<Uuid> = HashSet::new();
    let all_ids = dag.operators.iter().map(|o| o.id).chain(dag.artifacts.iter().map(|a| a.id));
    for id in all_ids {
        if !seen_ids.insert(id) {
            return Err(EngineError::DuplicateNodeId(id));
        }
    }

    let operator_set: HashSet<Uuid> = dag.operators.iter().map(|o| o.id).collect();
    let artifact_set: HashSet<Uuid> = dag.artifacts.iter().map(|a| a.id).collect();

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints and index them
    // -----------------------------------------------------------------------
    let mut inputs: HashMap<Uuid, Vec<(u32, Uuid)>> = HashMap::new();
    let mut outputs: HashMap<Uuid, Vec<(u32, Uuid)>> = HashMap::new();
    let mut producers: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for edge in &dag.edges {
        if !seen_ids.contains(&edge.from) {
            return Err(EngineError::UnknownNodeReference { node_id: edge.from, side: "from" });
        }
        if !seen_ids.contains(&edge.to) {
            return Err(EngineError::UnknownNodeReference { node_id: edge.to, side: "to" });
        }

        if operator_set.contains(&edge.from) && artifact_set.contains(&edge.to) {
            outputs.entry(edge.from).or_default().push((edge.idx, edge.to));
            producers.entry(edge.to).or_default().push(edge.from);
        } else if artifact_set.contains(&edge.from) && operator_set.contains(&edge.to) {
            inputs.entry(edge.to).or_default().push((edge.idx, edge.from));
        } else {
            return Err(EngineError::InvalidEdge { from: edge.from, to: edge.to });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Exactly one producer per artifact
    // -----------------------------------------------------------------------
    let mut producer: HashMap<Uuid, Uuid> = HashMap::new();
    for artifact in &dag.artifacts {
        match producers.get(&artifact.id).map(Vec::as_slice) {
            Some([op]) => {
                producer.insert(artifact.id, *op);
            }
            other => {
                return Err(EngineError::ArtifactProducers {
                    artifact_id: artifact.id,
                    producers: other.map_or(0, <[Uuid]>::len),
                });
            }
        }
    }

    let sorted_by_idx = |map: HashMap<Uuid, Vec<(u32, Uuid)>>| -> HashMap<Uuid, Vec<Uuid>> {
        map.into_iter()
            .map(|(op, mut edges)| {
                edges.sort_by_key(|(idx, _)| *idx);
                (op, edges.into_iter().map(|(_, a)| a).collect())
            })
            .collect()
    };
    let inputs = sorted_by_idx(inputs);
    let outputs = sorted_by_idx(outputs);

    // -----------------------------------------------------------------------
    // 4. Topological sort over operators (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // Operator -> operators consuming one of its outputs.
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut in_degree: HashMap<Uuid, usize> =
        dag.operators.iter().map(|o| (o.id, 0)).collect();

    for (&consumer, artifacts) in &inputs {
        for artifact in artifacts {
            let upstream = producer[artifact];
            adjacency.entry(upstream).or_default().push(consumer);
            *in_degree.entry(consumer).or_insert(0) += 1;
        }
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<Uuid> = dag
        .operators
        .iter()
        .map(|o| o.id)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order: Vec<Uuid> = Vec::with_capacity(dag.operators.len());

    while let Some(op) = queue.pop_front() {
        order.push(op);

        if let Some(neighbours) = adjacency.get(&op) {
            for neighbour in neighbours {
                let deg = in_degree.entry(*neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*neighbour);
                }
            }
        }
    }

    // If we didn't visit every operator the graph contains a cycle.
    if order.len() != dag.operators.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(DagPlan { order, producer, inputs, outputs })
}

/// Compute the preview-cache signature of every artifact.
///
/// A signature hashes the artifact's logical id, its output position, the
/// producing operator's spec and the signatures of that operator's inputs,
/// so it changes whenever anything upstream changes.
pub fn compute_signatures(
    dag: &WorkflowDag,
    plan: &DagPlan,
) -> Result<HashMap<Uuid, Uuid>, EngineError> {
    let mut signatures: HashMap<Uuid, Uuid> = HashMap::new();

    for &op_id in &plan.order {
        let op = dag.operator(op_id).ok_or(EngineError::UnknownNodeReference {
            node_id: op_id,
            side: "operator",
        })?;

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&op.spec)?);
        for input in plan.inputs_of(op_id) {
            let upstream = signatures.get(input).copied().unwrap_or_default();
            hasher.update(upstream.as_bytes());
        }

        for (position, output) in plan.outputs_of(op_id).iter().enumerate() {
            let mut h = hasher.clone();
            h.update(output.as_bytes());
            h.update((position as u64).to_le_bytes());
            let digest = h.finalize();

            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            signatures.insert(*output, Uuid::from_bytes(bytes));
        }
    }

    Ok(signatures)
}
