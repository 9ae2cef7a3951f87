//! Dependency graph tracker: typed nodes/edges per application, with
//! observer fan-out and export formats.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub mod observer;

pub use observer::{GraphEvent, ObserverHandle, ObserverHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Spec,
    Workflow,
    Step,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Waiting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Provisioned,
}

impl NodeState {
    /// Legal transitions per the distilled spec; illegal ones are logged
    /// and dropped rather than raised.
    fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Pending)
                | (Waiting, Running)
                | (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Provisioned)
                // a node may legitimately re-enter `waiting` across re-runs
                | (Succeeded, Waiting)
                | (Failed, Waiting)
                | (Provisioned, Waiting)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Contains,
    DependsOn,
    Provisions,
    Configures,
    BindsTo,
    Creates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub name: String,
    pub state: NodeState,
    pub properties: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub edge_type: EdgeType,
    pub properties: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node '{0}' already exists with different content")]
    NodeConflict(String),
    #[error("edge references unknown node: {0}")]
    UnknownEndpoint(String),
    #[error("edge would introduce a cycle")]
    WouldCycle,
    #[error("application '{0}' not found")]
    UnknownApplication(String),
    #[error("export format not supported by this adapter: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Default)]
struct AppGraph {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    /// adjacency over {dependsOn, provisions} edges, for cycle detection
    adjacency: HashMap<String, HashSet<String>>,
}

impl AppGraph {
    fn would_cycle(&self, from: &str, to: &str) -> bool {
        // Adding from->to; check whether `to` can already reach `from`.
        let mut stack = vec![to.to_string()];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(next) = self.adjacency.get(&current) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }
}

/// Persists graph mutations; a failed write degrades to in-memory-only.
pub trait GraphPersistence: Send + Sync {
    fn persist_node(&self, app: &str, node: &Node) -> Result<(), String>;
    fn persist_edge(&self, app: &str, edge: &Edge) -> Result<(), String>;
}

/// A persistence backend that always succeeds; used when no durable
/// backend is configured.
pub struct NullPersistence;

impl GraphPersistence for NullPersistence {
    fn persist_node(&self, _app: &str, _node: &Node) -> Result<(), String> {
        Ok(())
    }
    fn persist_edge(&self, _app: &str, _edge: &Edge) -> Result<(), String> {
        Ok(())
    }
}

/// Per-application dependency graph tracker with observer fan-out.
pub struct GraphTracker {
    apps: RwLock<HashMap<String, AppGraph>>,
    persistence: Arc<dyn GraphPersistence>,
    observers: ObserverHub,
}

impl GraphTracker {
    pub fn new(persistence: Arc<dyn GraphPersistence>) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            persistence,
            observers: ObserverHub::new(1024),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NullPersistence))
    }

    pub fn ensure_application(&self, app: &str) {
        self.apps.write().entry(app.to_string()).or_default();
    }

    pub fn add_node(&self, app: &str, node: Node) -> Result<(), GraphError> {
        self.ensure_application(app);
        {
            let mut apps = self.apps.write();
            let graph = apps.get_mut(app).expect("ensured above");
            if let Some(existing) = graph.nodes.get(&node.id) {
                if existing.name != node.name || existing.node_type != node.node_type {
                    return Err(GraphError::NodeConflict(node.id.clone()));
                }
                return Ok(());
            }
            if let Err(e) = self.persistence.persist_node(app, &node) {
                warn!(app, node_id = %node.id, error = %e, "graph persistence failed, degrading to in-memory-only");
            }
            graph.nodes.insert(node.id.clone(), node.clone());
        }
        self.observers
            .notify(GraphEvent::NodeAdded { app: app.to_string(), node_id: node.id.clone(), state: node.state });
        Ok(())
    }

    pub fn add_edge(&self, app: &str, edge: Edge) -> Result<(), GraphError> {
        {
            let mut apps = self.apps.write();
            let graph = apps
                .get_mut(app)
                .ok_or_else(|| GraphError::UnknownApplication(app.to_string()))?;

            if !graph.nodes.contains_key(&edge.from_node_id) {
                return Err(GraphError::UnknownEndpoint(edge.from_node_id.clone()));
            }
            if !graph.nodes.contains_key(&edge.to_node_id) {
                return Err(GraphError::UnknownEndpoint(edge.to_node_id.clone()));
            }

            if matches!(edge.edge_type, EdgeType::DependsOn | EdgeType::Provisions)
                && graph.would_cycle(&edge.from_node_id, &edge.to_node_id)
            {
                return Err(GraphError::WouldCycle);
            }

            if let Err(e) = self.persistence.persist_edge(app, &edge) {
                warn!(app, edge_id = %edge.id, error = %e, "graph persistence failed, degrading to in-memory-only");
            }

            if matches!(edge.edge_type, EdgeType::DependsOn | EdgeType::Provisions) {
                graph
                    .adjacency
                    .entry(edge.from_node_id.clone())
                    .or_default()
                    .insert(edge.to_node_id.clone());
            }
            graph.edges.insert(edge.id.clone(), edge.clone());
        }
        self.observers.notify(GraphEvent::EdgeAdded {
            app: app.to_string(),
            edge_id: edge.id.clone(),
            from_node_id: edge.from_node_id.clone(),
            to_node_id: edge.to_node_id.clone(),
            edge_type: edge.edge_type,
        });
        Ok(())
    }

    pub fn update_node_state(&self, app: &str, node_id: &str, new_state: NodeState) {
        let notify = {
            let mut apps = self.apps.write();
            let Some(graph) = apps.get_mut(app) else {
                warn!(app, node_id, "update_node_state on unknown application");
                return;
            };
            let Some(node) = graph.nodes.get_mut(node_id) else {
                warn!(app, node_id, "update_node_state on unknown node");
                return;
            };
            if !node.state.can_transition_to(new_state) {
                warn!(app, node_id, from = ?node.state, to = ?new_state, "illegal node transition dropped");
                return;
            }
            node.state = new_state;
            node.updated_at = Utc::now();
            if let Err(e) = self.persistence.persist_node(app, node) {
                warn!(app, node_id, error = %e, "graph persistence failed, degrading to in-memory-only");
            }
            true
        };
        if notify {
            self.observers.notify(GraphEvent::NodeStateChanged {
                app: app.to_string(),
                node_id: node_id.to_string(),
                state: new_state,
            });
        }
    }

    pub fn get_graph(&self, app: &str) -> Option<GraphSnapshot> {
        let apps = self.apps.read();
        let graph = apps.get(app)?;
        Some(GraphSnapshot {
            nodes: graph.nodes.values().cloned().collect(),
            edges: graph.edges.values().cloned().collect(),
        })
    }

    pub fn add_observer(&self) -> (ObserverHandle, tokio::sync::mpsc::Receiver<GraphEvent>) {
        self.observers.subscribe()
    }

    pub fn remove_observer(&self, handle: &ObserverHandle) {
        self.observers.remove_observer(handle);
    }

    pub fn graph_stats(&self, app: &str) -> Option<GraphStats> {
        let snapshot = self.get_graph(app)?;
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_state: BTreeMap<String, u64> = BTreeMap::new();
        for node in &snapshot.nodes {
            *by_type.entry(format!("{:?}", node.node_type)).or_default() += 1;
            *by_state.entry(format!("{:?}", node.state)).or_default() += 1;
        }
        Some(GraphStats {
            node_counts_by_type: by_type,
            node_counts_by_state: by_state,
            edge_count: snapshot.edges.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_counts_by_type: BTreeMap<String, u64>,
    pub node_counts_by_state: BTreeMap<String, u64>,
    pub edge_count: u64,
}

/// Export formats. JSON and Mermaid are core; DOT is a thin adapter;
/// SVG/PNG are optional adapters this crate does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    MermaidFlowchart,
    MermaidState,
    MermaidGantt,
    Dot,
    Svg,
    Png,
}

pub fn export(snapshot: &GraphSnapshot, format: ExportFormat) -> Result<String, GraphError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string(snapshot).expect("snapshot always serializable")),
        ExportFormat::MermaidFlowchart => Ok(export_mermaid_flowchart(snapshot)),
        ExportFormat::MermaidState => Ok(export_mermaid_state(snapshot)),
        ExportFormat::MermaidGantt => Ok(export_mermaid_gantt(snapshot)),
        ExportFormat::Dot => Ok(export_dot(snapshot)),
        ExportFormat::Svg => Err(GraphError::UnsupportedFormat("svg".to_string())),
        ExportFormat::Png => Err(GraphError::UnsupportedFormat("png".to_string())),
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn export_mermaid_flowchart(snapshot: &GraphSnapshot) -> String {
    let mut out = String::from("flowchart TD\n");
    for node in &snapshot.nodes {
        out.push_str(&format!(
            "    {}[\"{} ({:?})\"]\n",
            sanitize_id(&node.id),
            node.name,
            node.state
        ));
    }
    for edge in &snapshot.edges {
        out.push_str(&format!(
            "    {} -->|{:?}| {}\n",
            sanitize_id(&edge.from_node_id),
            edge.edge_type,
            sanitize_id(&edge.to_node_id)
        ));
    }
    out
}

fn export_mermaid_state(snapshot: &GraphSnapshot) -> String {
    let mut out = String::from("stateDiagram-v2\n");
    for node in &snapshot.nodes {
        out.push_str(&format!("    state \"{}\" as {}\n", node.name, sanitize_id(&node.id)));
    }
    for edge in &snapshot.edges {
        out.push_str(&format!(
            "    {} --> {}\n",
            sanitize_id(&edge.from_node_id),
            sanitize_id(&edge.to_node_id)
        ));
    }
    out
}

fn export_mermaid_gantt(snapshot: &GraphSnapshot) -> String {
    let mut out = String::from("gantt\n    dateFormat  YYYY-MM-DDTHH:mm:ss\n    section steps\n");
    for node in &snapshot.nodes {
        out.push_str(&format!(
            "    {} : {}, {}\n",
            node.name,
            node.created_at.to_rfc3339(),
            node.updated_at.to_rfc3339()
        ));
    }
    out
}

fn export_dot(snapshot: &GraphSnapshot) -> String {
    let mut out = String::from("digraph graph_snapshot {\n");
    for node in &snapshot.nodes {
        out.push_str(&format!(
            "  \"{}\" [label=\"{} ({:?})\"];\n",
            node.id, node.name, node.state
        ));
    }
    for edge in &snapshot.edges {
        out.push_str(&format!(
            "  \"{}\" -> \"{}\" [label=\"{:?}\"];\n",
            edge.from_node_id, edge.to_node_id, edge.edge_type
        ));
    }
    out.push_str("}\n");
    out
}

pub fn new_node_id() -> String {
    Uuid::now_v7().to_string()
}

pub fn new_edge_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, node_type: NodeType) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            node_type,
            name: name.to_string(),
            state: NodeState::Waiting,
            properties: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn edge(id: &str, from: &str, to: &str, edge_type: EdgeType) -> Edge {
        Edge {
            id: id.to_string(),
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            edge_type,
            properties: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scenario_s1_nodes_and_edges() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("workflow", "deploy-app", NodeType::Workflow)).unwrap();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        tracker.add_node("app", node("B", "B", NodeType::Step)).unwrap();
        tracker.add_edge("app", edge("e1", "workflow", "A", EdgeType::Contains)).unwrap();
        tracker.add_edge("app", edge("e2", "workflow", "B", EdgeType::Contains)).unwrap();
        tracker.add_edge("app", edge("e3", "B", "A", EdgeType::DependsOn)).unwrap();

        let snapshot = tracker.get_graph("app").unwrap();
        assert_eq!(snapshot.nodes.len(), 3);
        assert_eq!(snapshot.edges.len(), 3);
    }

    #[test]
    fn rejects_cycles_on_depends_on() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        tracker.add_node("app", node("B", "B", NodeType::Step)).unwrap();
        tracker.add_edge("app", edge("e1", "A", "B", EdgeType::DependsOn)).unwrap();
        let result = tracker.add_edge("app", edge("e2", "B", "A", EdgeType::DependsOn));
        assert!(matches!(result, Err(GraphError::WouldCycle)));
    }

    #[test]
    fn rejects_edge_with_unknown_endpoint() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        let result = tracker.add_edge("app", edge("e1", "A", "ghost", EdgeType::Contains));
        assert!(matches!(result, Err(GraphError::UnknownEndpoint(_))));
    }

    #[test]
    fn rejects_node_conflict_with_different_content() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        let result = tracker.add_node("app", node("A", "different-name", NodeType::Step));
        assert!(matches!(result, Err(GraphError::NodeConflict(_))));
    }

    #[test]
    fn illegal_transition_is_dropped_not_raised() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        tracker.update_node_state("app", "A", NodeState::Succeeded); // Waiting -> Succeeded is illegal
        let snapshot = tracker.get_graph("app").unwrap();
        assert_eq!(snapshot.nodes[0].state, NodeState::Waiting);
    }

    #[test]
    fn legal_transition_applies() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        tracker.update_node_state("app", "A", NodeState::Running);
        tracker.update_node_state("app", "A", NodeState::Succeeded);
        let snapshot = tracker.get_graph("app").unwrap();
        assert_eq!(snapshot.nodes[0].state, NodeState::Succeeded);
    }

    #[test]
    fn json_export_round_trips() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "A", NodeType::Step)).unwrap();
        let snapshot = tracker.get_graph("app").unwrap();
        let rendered = export(&snapshot, ExportFormat::Json).unwrap();
        let parsed: GraphSnapshot = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.nodes.len(), snapshot.nodes.len());
    }

    #[test]
    fn mermaid_export_contains_node_names() {
        let tracker = GraphTracker::in_memory();
        tracker.add_node("app", node("A", "step-a", NodeType::Step)).unwrap();
        let snapshot = tracker.get_graph("app").unwrap();
        let rendered = export(&snapshot, ExportFormat::MermaidFlowchart).unwrap();
        assert!(rendered.contains("step-a"));
    }

    #[test]
    fn svg_export_is_unsupported() {
        let snapshot = GraphSnapshot::default();
        assert!(matches!(
            export(&snapshot, ExportFormat::Svg),
            Err(GraphError::UnsupportedFormat(_))
        ));
    }
}
