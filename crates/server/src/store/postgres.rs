use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use tracing::{info_span, Instrument};

use cdm_common::approval::ApprovalPipeline;
use cdm_common::types::{
    Deliverable, Edge, EdgeKind, Graph, GraphWithRelations, Node, NodeType, TaskProps, TaskStatus,
};

use super::{DocumentNodeRow, NodeApproval, StoreError};

const NODE_COLUMNS: &str = r#"
    n.id,
    n.graph_id,
    n.label,
    n.type AS node_type,
    n.x,
    n.y,
    n.width,
    n.height,
    n.parent_id,
    n.description,
    n.tags,
    n.is_archived,
    n.archived_at,
    n.metadata,
    n.approval,
    n.approval_version,
    n.created_at,
    n.updated_at,
    t.node_id IS NOT NULL AS has_task,
    t.status AS task_status,
    t.assignee_id AS task_assignee_id,
    t.priority AS task_priority,
    t.due_date AS task_due_date,
    t.deliverables AS task_deliverables,
    p.props AS extension_props
FROM nodes AS n
LEFT JOIN node_tasks AS t ON t.node_id = n.id
LEFT JOIN node_props AS p ON p.node_id = n.id
"#;

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    graph_id: String,
    label: String,
    node_type: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    parent_id: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    is_archived: bool,
    archived_at: Option<DateTime<Utc>>,
    metadata: Value,
    approval: Option<Value>,
    approval_version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    has_task: bool,
    task_status: Option<String>,
    task_assignee_id: Option<String>,
    task_priority: Option<String>,
    task_due_date: Option<DateTime<Utc>>,
    task_deliverables: Option<Value>,
    extension_props: Option<Value>,
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id.clone(), reason };

        let node_type = NodeType::parse(&row.node_type)
            .ok_or_else(|| corrupt(format!("unknown node type '{}'", row.node_type)))?;
        let approval = row
            .approval
            .clone()
            .map(serde_json::from_value::<ApprovalPipeline>)
            .transpose()
            .map_err(|error| corrupt(format!("approval: {error}")))?;

        let task_props = if row.has_task {
            let status = row
                .task_status
                .as_deref()
                .map(|value| {
                    TaskStatus::parse(value)
                        .ok_or_else(|| corrupt(format!("unknown task status '{value}'")))
                })
                .transpose()?;
            let deliverables = row
                .task_deliverables
                .clone()
                .map(serde_json::from_value::<Vec<Deliverable>>)
                .transpose()
                .map_err(|error| corrupt(format!("deliverables: {error}")))?
                .unwrap_or_default();
            Some(TaskProps {
                status,
                assignee_id: row.task_assignee_id.clone(),
                priority: row.task_priority.clone(),
                due_date: row.task_due_date,
                deliverables,
            })
        } else {
            None
        };

        Ok(Node {
            id: row.id,
            graph_id: row.graph_id,
            label: row.label,
            node_type,
            x: row.x,
            y: row.y,
            width: row.width,
            height: row.height,
            parent_id: row.parent_id,
            description: row.description,
            tags: row.tags,
            is_archived: row.is_archived,
            archived_at: row.archived_at,
            metadata: row.metadata,
            approval,
            approval_version: row.approval_version,
            task_props,
            extension_props: row.extension_props,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: String,
    graph_id: String,
    source_id: String,
    target_id: String,
    kind: String,
    metadata: Value,
}

impl TryFrom<EdgeRow> for Edge {
    type Error = StoreError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        let kind = EdgeKind::parse(&row.kind).ok_or_else(|| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown edge kind '{}'", row.kind),
        })?;
        Ok(Edge {
            id: row.id,
            graph_id: row.graph_id,
            source_id: row.source_id,
            target_id: row.target_id,
            kind,
            metadata: row.metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GraphRow {
    id: String,
    name: String,
    data: Value,
    yjs_state: Option<Vec<u8>>,
    updated_at: DateTime<Utc>,
}

impl From<GraphRow> for Graph {
    fn from(row: GraphRow) -> Self {
        Graph {
            id: row.id,
            name: row.name,
            data: row.data,
            yjs_state: row.yjs_state,
            updated_at: row.updated_at,
        }
    }
}

pub(super) async fn find_node(pool: &PgPool, node_id: &str) -> Result<Option<Node>, StoreError> {
    let query = format!("SELECT {NODE_COLUMNS} WHERE n.id = $1");
    sqlx::query_as::<_, NodeRow>(&query)
        .bind(node_id)
        .fetch_optional(pool)
        .instrument(info_span!("cdm.db.query", query = "find_node"))
        .await?
        .map(Node::try_from)
        .transpose()
}

pub(super) async fn update_approval(
    pool: &PgPool,
    node_id: &str,
    expected_version: i64,
    pipeline: &ApprovalPipeline,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET approval = $2,
            approval_version = approval_version + 1,
            updated_at = now()
        WHERE id = $1
          AND approval_version = $3
        "#,
    )
    .bind(node_id)
    .bind(Json(pipeline))
    .bind(expected_version)
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "update_approval"))
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(super) async fn update_task_status(
    pool: &PgPool,
    node_id: &str,
    status: TaskStatus,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO node_tasks (node_id, status)
        VALUES ($1, $2)
        ON CONFLICT (node_id) DO UPDATE
        SET status = EXCLUDED.status
        "#,
    )
    .bind(node_id)
    .bind(status.as_str())
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "update_task_status"))
    .await?;

    Ok(())
}

pub(super) async fn update_deliverables(
    pool: &PgPool,
    node_id: &str,
    deliverables: &[Deliverable],
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO node_tasks (node_id, deliverables)
        VALUES ($1, $2)
        ON CONFLICT (node_id) DO UPDATE
        SET deliverables = EXCLUDED.deliverables
        "#,
    )
    .bind(node_id)
    .bind(Json(deliverables))
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "update_deliverables"))
    .await?;

    Ok(())
}

pub(super) async fn find_edges_by_source(
    pool: &PgPool,
    source_id: &str,
    kind: EdgeKind,
) -> Result<Vec<Edge>, StoreError> {
    sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT id, graph_id, source_id, target_id, kind, metadata
        FROM edges
        WHERE source_id = $1
          AND kind = $2
        ORDER BY id
        "#,
    )
    .bind(source_id)
    .bind(kind.as_str())
    .fetch_all(pool)
    .instrument(info_span!("cdm.db.query", query = "find_edges_by_source"))
    .await?
    .into_iter()
    .map(Edge::try_from)
    .collect()
}

pub(super) async fn find_edges_by_target(
    pool: &PgPool,
    target_id: &str,
    kind: EdgeKind,
) -> Result<Vec<Edge>, StoreError> {
    sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT id, graph_id, source_id, target_id, kind, metadata
        FROM edges
        WHERE target_id = $1
          AND kind = $2
        ORDER BY id
        "#,
    )
    .bind(target_id)
    .bind(kind.as_str())
    .fetch_all(pool)
    .instrument(info_span!("cdm.db.query", query = "find_edges_by_target"))
    .await?
    .into_iter()
    .map(Edge::try_from)
    .collect()
}

pub(super) async fn find_nodes_by_ids(
    pool: &PgPool,
    ids: &[String],
) -> Result<Vec<NodeApproval>, StoreError> {
    let rows: Vec<(String, Option<Value>)> =
        sqlx::query_as("SELECT id, approval FROM nodes WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(pool)
            .instrument(info_span!("cdm.db.query", query = "find_nodes_by_ids"))
            .await?;

    rows.into_iter()
        .map(|(id, approval)| {
            let approval = approval
                .map(serde_json::from_value::<ApprovalPipeline>)
                .transpose()
                .map_err(|error| StoreError::Corrupt {
                    id: id.clone(),
                    reason: format!("approval: {error}"),
                })?;
            Ok(NodeApproval { id, approval })
        })
        .collect()
}

pub(super) async fn update_yjs_state(
    pool: &PgPool,
    graph_id: &str,
    state: &[u8],
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE graphs
        SET yjs_state = $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(graph_id)
    .bind(state)
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "update_yjs_state"))
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::GraphNotFound(graph_id.to_owned()));
    }
    Ok(())
}

pub(super) async fn find_graph_with_relations(
    pool: &PgPool,
    graph_id: &str,
) -> Result<Option<GraphWithRelations>, StoreError> {
    let graph = sqlx::query_as::<_, GraphRow>(
        "SELECT id, name, data, yjs_state, updated_at FROM graphs WHERE id = $1",
    )
    .bind(graph_id)
    .fetch_optional(pool)
    .instrument(info_span!("cdm.db.query", query = "find_graph"))
    .await?;

    let Some(graph) = graph else {
        return Ok(None);
    };

    let query = format!("SELECT {NODE_COLUMNS} WHERE n.graph_id = $1 ORDER BY n.created_at, n.id");
    let nodes = sqlx::query_as::<_, NodeRow>(&query)
        .bind(graph_id)
        .fetch_all(pool)
        .instrument(info_span!("cdm.db.query", query = "find_graph_nodes"))
        .await?
        .into_iter()
        .map(Node::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let edges = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT id, graph_id, source_id, target_id, kind, metadata
        FROM edges
        WHERE graph_id = $1
        ORDER BY id
        "#,
    )
    .bind(graph_id)
    .fetch_all(pool)
    .instrument(info_span!("cdm.db.query", query = "find_graph_edges"))
    .await?
    .into_iter()
    .map(Edge::try_from)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(GraphWithRelations { graph: graph.into(), nodes, edges }))
}

pub(super) async fn upsert_nodes_from_document(
    pool: &PgPool,
    graph_id: &str,
    rows: &[DocumentNodeRow],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, graph_id, label, type, x, y, width, height,
                parent_id, description, tags, is_archived, archived_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    CASE WHEN $12 THEN now() ELSE NULL END)
            ON CONFLICT (id) DO UPDATE
            SET label = EXCLUDED.label,
                type = EXCLUDED.type,
                x = EXCLUDED.x,
                y = EXCLUDED.y,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                parent_id = EXCLUDED.parent_id,
                description = EXCLUDED.description,
                tags = EXCLUDED.tags,
                archived_at = CASE
                    WHEN NOT EXCLUDED.is_archived THEN NULL
                    WHEN nodes.is_archived THEN nodes.archived_at
                    ELSE now()
                END,
                is_archived = EXCLUDED.is_archived,
                updated_at = now()
            WHERE nodes.graph_id = EXCLUDED.graph_id
            "#,
        )
        .bind(&row.id)
        .bind(graph_id)
        .bind(&row.label)
        .bind(row.node_type.as_str())
        .bind(row.x)
        .bind(row.y)
        .bind(row.width)
        .bind(row.height)
        .bind(&row.parent_id)
        .bind(&row.description)
        .bind(&row.tags)
        .bind(row.is_archived)
        .execute(&mut *tx)
        .instrument(info_span!("cdm.db.query", query = "upsert_document_node"))
        .await?;

        if row.node_type == NodeType::Task {
            // A task first drawn in the document still needs its extension row.
            sqlx::query(
                r#"
                INSERT INTO node_tasks (node_id)
                SELECT id FROM nodes WHERE id = $1 AND graph_id = $2
                ON CONFLICT (node_id) DO NOTHING
                "#,
            )
            .bind(&row.id)
            .bind(graph_id)
            .execute(&mut *tx)
            .instrument(info_span!("cdm.db.query", query = "ensure_document_task_row"))
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

pub(super) async fn insert_graph(pool: &PgPool, graph: &Graph) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO graphs (id, name, data, yjs_state, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&graph.id)
    .bind(&graph.name)
    .bind(&graph.data)
    .bind(&graph.yjs_state)
    .bind(graph.updated_at)
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "insert_graph"))
    .await?;

    Ok(())
}

pub(super) async fn insert_node(pool: &PgPool, node: &Node) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO nodes (
            id, graph_id, label, type, x, y, width, height, parent_id, description,
            tags, is_archived, archived_at, metadata, approval, approval_version,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(&node.id)
    .bind(&node.graph_id)
    .bind(&node.label)
    .bind(node.node_type.as_str())
    .bind(node.x)
    .bind(node.y)
    .bind(node.width)
    .bind(node.height)
    .bind(&node.parent_id)
    .bind(&node.description)
    .bind(&node.tags)
    .bind(node.is_archived)
    .bind(node.archived_at)
    .bind(&node.metadata)
    .bind(node.approval.as_ref().map(Json))
    .bind(node.approval_version)
    .bind(node.created_at)
    .bind(node.updated_at)
    .execute(&mut *tx)
    .instrument(info_span!("cdm.db.query", query = "insert_node"))
    .await?;

    if let Some(task) = &node.task_props {
        sqlx::query(
            r#"
            INSERT INTO node_tasks (node_id, status, assignee_id, priority, due_date, deliverables)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&node.id)
        .bind(task.status.map(TaskStatus::as_str))
        .bind(&task.assignee_id)
        .bind(&task.priority)
        .bind(task.due_date)
        .bind(Json(&task.deliverables))
        .execute(&mut *tx)
        .instrument(info_span!("cdm.db.query", query = "insert_node_task"))
        .await?;
    } else if let Some(props) = &node.extension_props {
        sqlx::query("INSERT INTO node_props (node_id, kind, props) VALUES ($1, $2, $3)")
            .bind(&node.id)
            .bind(node.node_type.as_str())
            .bind(props)
            .execute(&mut *tx)
            .instrument(info_span!("cdm.db.query", query = "insert_node_props"))
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub(super) async fn insert_edge(pool: &PgPool, edge: &Edge) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO edges (id, graph_id, source_id, target_id, kind, metadata)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
        SET source_id = EXCLUDED.source_id,
            target_id = EXCLUDED.target_id,
            kind = EXCLUDED.kind,
            metadata = EXCLUDED.metadata
        "#,
    )
    .bind(&edge.id)
    .bind(&edge.graph_id)
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(edge.kind.as_str())
    .bind(&edge.metadata)
    .execute(pool)
    .instrument(info_span!("cdm.db.query", query = "insert_edge"))
    .await?;

    Ok(())
}
