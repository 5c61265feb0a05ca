//! Declarative processing graphs.
//!
//! A [`Workflow`] is a DAG of named [`Node`]s. Every edge carries one
//! [`Connection`] from an output slot of its source node to an input slot of
//! its destination node. The graph invariants are checked while the graph is
//! assembled:
//!
//! * node names are unique within a workflow,
//! * both ends of a connection name slots their interfaces declare,
//! * an input slot is fed by at most one connection,
//! * no node depends on its own output, directly or transitively.
//!
//! Embedding one workflow into another with [`Workflow::add_workflow`] copies
//! its nodes under a `<subgraph>.<node>` name, so wiring across the boundary
//! is plain node-to-node wiring.

mod diagnostics;
mod lookup;
mod node;
mod runner;
mod value;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::error::{GraphError, LookupError};

pub use diagnostics::{NodeExecution, Report};
pub use lookup::{
    DATASINK, INPUT_NODE, extend_list_setting, find_node, format_pair_list, get_datasink,
    get_input_node, input_file_name,
};
pub use node::{Interface, Node, NodeContext, SlotSpec};
pub use value::{Value, Values};

/// Handle to a node inside one [`Workflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    pub fn index(self) -> usize {
        self.0.index()
    }
}

/// One output slot feeding one input slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub source: String,
    pub dest: String,
}

/// A named processing graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    pub(crate) graph: Graph<Node, Connection>,
}

/// The nodes of a subgraph after [`Workflow::add_workflow`], by local name.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub name: String,
    ids: BTreeMap<String, NodeId>,
}

impl Embedded {
    /// Looks up a node by its name inside the embedded subgraph.
    pub fn get(&self, local: &str) -> Result<NodeId, LookupError> {
        self.ids
            .get(local)
            .copied()
            .ok_or_else(|| LookupError::NotFound(format!("{}.{}", self.name, local)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.ids.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        check_name(&node.name)?;
        if self.node_named(&node.name).is_some() {
            return Err(GraphError::DuplicateNode(node.name, self.name.clone()));
        }

        tracing::trace!(workflow = %self.name, node = %node.name, "adding node");
        Ok(NodeId(self.graph.add_node(node)))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.graph
            .node_weight(id.0)
            .ok_or_else(|| GraphError::UnknownNode(id.index(), self.name.clone()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        let name = &self.name;
        self.graph
            .node_weight_mut(id.0)
            .ok_or_else(|| GraphError::UnknownNode(id.index(), name.clone()))
    }

    /// Exact-name lookup, see [`find_node`] for the forgiving variant.
    pub fn node_named(&self, name: &str) -> Option<NodeId> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].name == name)
            .map(NodeId)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(NodeId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.graph
            .node_indices()
            .map(|index| (NodeId(index), &self.graph[index]))
    }

    pub fn connections(&self) -> impl Iterator<Item = (NodeId, NodeId, &Connection)> {
        self.graph
            .edge_references()
            .map(|edge| (NodeId(edge.source()), NodeId(edge.target()), edge.weight()))
    }

    /// Connections arriving at `id`, as `(source, connection)`.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &Connection)> {
        self.graph
            .edges_directed(id.0, Direction::Incoming)
            .map(|edge| (NodeId(edge.source()), edge.weight()))
    }

    /// Distinct nodes whose outputs feed `id`.
    pub fn upstream(&self, id: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(id.0, Direction::Incoming)
            .map(NodeId)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Distinct nodes fed by `id`.
    pub fn downstream(&self, id: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(id.0, Direction::Outgoing)
            .map(NodeId)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Wires `source.source_slot` into `dest.dest_slot`.
    pub fn connect(
        &mut self,
        source: NodeId,
        source_slot: &str,
        dest: NodeId,
        dest_slot: &str,
    ) -> Result<(), GraphError> {
        let src = self.node(source)?;
        let dst = self.node(dest)?;

        if !src.interface.output_slots().accepts(source_slot) {
            return Err(GraphError::UnknownSlot {
                node: src.name.clone(),
                slot: source_slot.to_string(),
                direction: "output",
            });
        }

        if !dst.interface.input_slots().accepts(dest_slot) {
            return Err(GraphError::UnknownSlot {
                node: dst.name.clone(),
                slot: dest_slot.to_string(),
                direction: "input",
            });
        }

        if self.incoming(dest).any(|(_, c)| c.dest == dest_slot) {
            return Err(GraphError::AlreadyConnected {
                node: dst.name.clone(),
                slot: dest_slot.to_string(),
            });
        }

        if source == dest || has_path_connecting(&self.graph, dest.0, source.0, None) {
            return Err(GraphError::Cycle {
                from: src.name.clone(),
                to: dst.name.clone(),
            });
        }

        self.graph.add_edge(
            source.0,
            dest.0,
            Connection {
                source: source_slot.to_string(),
                dest: dest_slot.to_string(),
            },
        );

        Ok(())
    }

    /// Wires several `(source_slot, dest_slot)` pairs between two nodes.
    pub fn connect_many(
        &mut self,
        source: NodeId,
        dest: NodeId,
        pairs: &[(&str, &str)],
    ) -> Result<(), GraphError> {
        for (source_slot, dest_slot) in pairs {
            self.connect(source, source_slot, dest, dest_slot)?;
        }
        Ok(())
    }

    /// Copies every node and connection of `sub` into this workflow.
    ///
    /// Nodes are renamed to `<sub name>.<node name>`.
    pub fn add_workflow(&mut self, sub: Workflow) -> Result<Embedded, GraphError> {
        let prefix = sub.name.clone();
        check_name(&prefix)?;
        let (nodes, edges) = sub.graph.into_nodes_edges();

        for node in &nodes {
            let name = format!("{}.{}", prefix, node.weight.name);
            if self.node_named(&name).is_some() {
                return Err(GraphError::DuplicateNode(name, self.name.clone()));
            }
        }

        let mut ids = BTreeMap::new();
        let mut mapping = Vec::with_capacity(nodes.len());

        for node in nodes {
            let mut node = node.weight;
            let local = std::mem::take(&mut node.name);
            node.name = format!("{prefix}.{local}");

            let id = NodeId(self.graph.add_node(node));
            mapping.push(id);
            ids.insert(local, id);
        }

        for edge in edges {
            let source = mapping[edge.source().index()];
            let target = mapping[edge.target().index()];
            self.graph.add_edge(source.0, target.0, edge.weight);
        }

        Ok(Embedded { name: prefix, ids })
    }

    /// Nodes in dependency order.
    pub fn toposort(&self) -> Result<Vec<NodeId>, GraphError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(NodeId).collect())
            .map_err(|cycle| {
                let name = self.graph[cycle.node_id()].name.clone();
                GraphError::Cycle {
                    from: name.clone(),
                    to: name,
                }
            })
    }
}

/// Node names become directories below the run's base directory, one per
/// dot-separated part, so every part must be a plain file name.
fn check_name(name: &str) -> Result<(), GraphError> {
    let usable = name.split('.').all(|part| {
        !part.is_empty() && !part.contains(['/', '\\']) && part.trim() == part
    });

    if usable {
        Ok(())
    } else {
        Err(GraphError::InvalidName(name.to_string()))
    }
}

impl Display for Workflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.name.replace('"', "\\\""); // Simple escape
            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, node.kind())?;
        }

        for edge in self.graph.edge_references() {
            let Connection { source, dest } = edge.weight();
            writeln!(
                f,
                "    {:?} -- \"{} → {}\" --> {:?}",
                edge.source().index(),
                source.replace('@', "#64;"),
                dest.replace('@', "#64;"),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
