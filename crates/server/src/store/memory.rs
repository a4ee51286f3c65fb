use std::collections::{HashMap, HashSet};

use cdm_common::approval::ApprovalPipeline;
use cdm_common::types::{
    Deliverable, Edge, Graph, GraphWithRelations, Node, NodeType, TaskProps, TaskStatus,
};
use chrono::Utc;

use super::{DocumentNodeRow, NodeApproval, StoreError};

#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graphs: HashMap<String, Graph>,
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    failing_writes: HashSet<String>,
}

impl MemoryGraphStore {
    /// Makes every subsequent write that touches `node_id` fail.
    pub fn fail_writes_for(&mut self, node_id: impl Into<String>) {
        self.failing_writes.insert(node_id.into());
    }

    fn check_writable(&self, node_id: &str) -> Result<(), StoreError> {
        if self.failing_writes.contains(node_id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "injected write failure for node {node_id}"
            ))));
        }
        Ok(())
    }

    pub(super) fn insert_graph(&mut self, graph: Graph) {
        self.graphs.insert(graph.id.clone(), graph);
    }

    pub(super) fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub(super) fn insert_edge(&mut self, edge: Edge) {
        match self.edges.iter_mut().find(|existing| existing.id == edge.id) {
            Some(existing) => *existing = edge,
            None => self.edges.push(edge),
        }
    }

    pub(super) fn find_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).cloned()
    }

    pub(super) fn update_approval(
        &mut self,
        node_id: &str,
        expected_version: i64,
        pipeline: &ApprovalPipeline,
    ) -> Result<bool, StoreError> {
        self.check_writable(node_id)?;
        let Some(node) = self.nodes.get_mut(node_id) else {
            return Ok(false);
        };
        if node.approval_version != expected_version {
            return Ok(false);
        }
        node.approval = Some(pipeline.clone());
        node.approval_version += 1;
        node.updated_at = Utc::now();
        Ok(true)
    }

    pub(super) fn update_task_status(
        &mut self,
        node_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        self.check_writable(node_id)?;
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_owned()))?;
        node.task_props.get_or_insert_with(TaskProps::default).status = Some(status);
        node.updated_at = Utc::now();
        Ok(())
    }

    pub(super) fn update_deliverables(
        &mut self,
        node_id: &str,
        deliverables: &[Deliverable],
    ) -> Result<(), StoreError> {
        self.check_writable(node_id)?;
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_owned()))?;
        node.task_props.get_or_insert_with(TaskProps::default).deliverables = deliverables.to_vec();
        node.updated_at = Utc::now();
        Ok(())
    }

    pub(super) fn find_edges(&self, predicate: impl Fn(&Edge) -> bool) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.iter().filter(|edge| predicate(edge)).cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub(super) fn find_nodes_by_ids(&self, ids: &[String]) -> Vec<NodeApproval> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| NodeApproval { id: node.id.clone(), approval: node.approval.clone() })
            .collect()
    }

    pub(super) fn update_yjs_state(&mut self, graph_id: &str, state: &[u8]) -> Result<(), StoreError> {
        let graph = self
            .graphs
            .get_mut(graph_id)
            .ok_or_else(|| StoreError::GraphNotFound(graph_id.to_owned()))?;
        graph.yjs_state = Some(state.to_vec());
        graph.updated_at = Utc::now();
        Ok(())
    }

    pub(super) fn find_graph_with_relations(&self, graph_id: &str) -> Option<GraphWithRelations> {
        let graph = self.graphs.get(graph_id)?.clone();

        let mut nodes: Vec<Node> =
            self.nodes.values().filter(|node| node.graph_id == graph_id).cloned().collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let edges = self.find_edges(|edge| edge.graph_id == graph_id);

        Some(GraphWithRelations { graph, nodes, edges })
    }

    pub(super) fn upsert_nodes_from_document(&mut self, graph_id: &str, rows: &[DocumentNodeRow]) {
        let now = Utc::now();
        for row in rows {
            let node = self
                .nodes
                .entry(row.id.clone())
                .or_insert_with(|| Node::new(row.id.clone(), graph_id, row.label.clone()));
            if node.graph_id != graph_id {
                continue;
            }
            node.label = row.label.clone();
            node.node_type = row.node_type;
            node.x = row.x;
            node.y = row.y;
            node.width = row.width;
            node.height = row.height;
            node.parent_id = row.parent_id.clone();
            node.description = row.description.clone();
            node.tags = row.tags.clone();
            if row.is_archived && !node.is_archived {
                node.archived_at = Some(now);
            } else if !row.is_archived {
                node.archived_at = None;
            }
            node.is_archived = row.is_archived;
            if node.node_type == NodeType::Task && node.task_props.is_none() {
                node.task_props = Some(TaskProps::default());
            }
            node.updated_at = now;
        }
    }
}
