// Compute graph IR
//
// Read-only view of an ONNX graph used by the capability pipeline: a petgraph
// StableGraph of operator nodes with tensor-level data edges, plus the graph's
// boundary value infos, initializers and opset imports.

use crate::error::{CompilerError, Result};
use crate::graph::types::{Dim, ElementType};
use crate::proto::tensor_proto::DataLocation;
use crate::proto::tensor_shape_proto::{dimension, Dimension};
use crate::proto::type_proto;
use crate::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use prost::Message;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::Path;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Dependency edge between nodes
#[derive(Debug, Clone)]
pub enum Dependency {
    /// Data dependency: tensor flows from source to destination
    Data {
        /// Tensor carried by the edge
        tensor: String,
        /// Which output slot on the source node
        output_slot: u8,
        /// Which input slot on the destination node
        input_slot: u8,
    },
}

/// A node in the computation graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Original ONNX node name (may be empty)
    pub name: String,
    /// Operation type (e.g., "Add", "ReduceSum", "Slice")
    pub op_type: String,
    /// Domain ("" for the default ONNX domain)
    pub domain: String,
    /// Operation attributes from ONNX
    pub attributes: Vec<AttributeProto>,
    /// Input tensor names; empty strings mark omitted optional inputs
    pub input_names: Vec<String>,
    /// Output tensor names
    pub output_names: Vec<String>,
}

impl GraphNode {
    /// Create from ONNX NodeProto
    pub fn from_onnx_node(node: &NodeProto) -> Self {
        Self {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            attributes: node.attribute.clone(),
            input_names: node.input.clone(),
            output_names: node.output.clone(),
        }
    }

    /// Get attribute by name
    pub fn get_attribute(&self, name: &str) -> Option<&AttributeProto> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    /// Get integer attribute value
    pub fn get_int_attr(&self, name: &str) -> Option<i64> {
        use crate::proto::attribute_proto::AttributeType;
        self.get_attribute(name)
            .filter(|attr| attr.r#type == AttributeType::Int as i32)
            .map(|attr| attr.i)
    }

    /// Get integer array attribute value
    pub fn get_ints_attr(&self, name: &str) -> Option<Vec<i64>> {
        use crate::proto::attribute_proto::AttributeType;
        self.get_attribute(name)
            .filter(|attr| attr.r#type == AttributeType::Ints as i32)
            .map(|attr| attr.ints.clone())
    }

    /// Input tensor at `slot`, skipping omitted optional inputs
    pub fn input(&self, slot: usize) -> Option<&str> {
        self.input_names
            .get(slot)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Every named input and output tensor, inputs first
    pub fn defs(&self) -> impl Iterator<Item = &str> {
        self.input_names
            .iter()
            .chain(self.output_names.iter())
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// ONNX computation graph using petgraph
#[derive(Debug)]
pub struct ComputeGraph {
    /// The underlying petgraph structure
    graph: StableGraph<GraphNode, Dependency>,

    /// Tensor name to producer mapping: name → (node_id, output_slot)
    tensor_producers: FxHashMap<String, (NodeId, u8)>,

    /// Node name to node ID mapping
    name_to_id: FxHashMap<String, NodeId>,

    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
    value_info: Vec<ValueInfoProto>,

    /// Initializers (constant weights from ONNX)
    initializers: FxHashMap<String, TensorProto>,

    /// Opset imports, domain → version ("" is the default domain)
    opset_imports: BTreeMap<String, i64>,
}

/// "ai.onnx" and "" name the same domain
pub fn canonical_domain(domain: &str) -> &str {
    if domain == "ai.onnx" {
        ""
    } else {
        domain
    }
}

impl ComputeGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            tensor_producers: FxHashMap::default(),
            name_to_id: FxHashMap::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            value_info: Vec::new(),
            initializers: FxHashMap::default(),
            opset_imports: BTreeMap::new(),
        }
    }

    /// Decode an `.onnx` file and build the graph, resolving external data
    /// relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let model = ModelProto::decode(bytes.as_slice())?;
        Self::from_model(&model, path.parent())
    }

    /// Build from a decoded model, including its opset imports
    pub fn from_model(model: &ModelProto, model_dir: Option<&Path>) -> Result<Self> {
        let onnx_graph = model
            .graph
            .as_ref()
            .ok_or_else(|| CompilerError::InvalidModel("model has no graph".to_string()))?;
        let mut graph = Self::from_onnx_with_path(onnx_graph, model_dir)?;
        for opset in &model.opset_import {
            graph.set_opset(&opset.domain, opset.version);
        }
        Ok(graph)
    }

    /// Convert from ONNX GraphProto
    ///
    /// If `model_dir` is provided, external data files (e.g., `.onnx.data`) will be loaded.
    pub fn from_onnx_with_path(onnx_graph: &GraphProto, model_dir: Option<&Path>) -> Result<Self> {
        let mut ir = Self::new();

        ir.inputs = onnx_graph.input.clone();
        ir.outputs = onnx_graph.output.clone();
        ir.value_info = onnx_graph.value_info.clone();

        for init in &onnx_graph.initializer {
            let mut tensor = init.clone();
            if let Some(dir) = model_dir {
                Self::load_external_data(&mut tensor, dir)?;
            }
            ir.initializers.insert(init.name.clone(), tensor);
        }

        for onnx_node in &onnx_graph.node {
            let node_data = GraphNode::from_onnx_node(onnx_node);
            ir.insert_node(node_data);
        }

        // Edges are resolved after every producer is registered so that
        // out-of-order node lists still connect.
        let edge_info: Vec<_> = ir
            .graph
            .node_indices()
            .flat_map(|node_id| ir.incoming_edges_for(node_id, &ir.graph[node_id].input_names))
            .collect();

        for (source_id, target_id, dep) in edge_info {
            ir.graph.add_edge(source_id, target_id, dep);
        }

        Ok(ir)
    }

    /// Load external data into a TensorProto if present
    ///
    /// The external file path is resolved relative to `base_dir`.
    fn load_external_data(tensor: &mut TensorProto, base_dir: &Path) -> Result<()> {
        let data_location = DataLocation::try_from(tensor.data_location).unwrap_or(DataLocation::Default);

        if data_location != DataLocation::External || tensor.external_data.is_empty() {
            return Ok(());
        }

        let mut location = None;
        let mut offset: Option<u64> = None;
        let mut length: Option<u64> = None;

        for entry in &tensor.external_data {
            match entry.key.as_str() {
                "location" => location = Some(entry.value.clone()),
                "offset" => offset = entry.value.parse().ok(),
                "length" => length = entry.value.parse().ok(),
                _ => {}
            }
        }

        let location =
            location.ok_or_else(|| CompilerError::corruption(&tensor.name, "external data has no 'location' entry"))?;

        let external_path = base_dir.join(&location);
        let file_data = std::fs::read(&external_path)?;

        let start = offset.unwrap_or(0) as usize;
        let end = match length {
            Some(len) => start.saturating_add(len as usize),
            None => file_data.len(),
        };
        let data_slice = file_data.get(start..end).ok_or_else(|| {
            CompilerError::corruption(
                &tensor.name,
                format!(
                    "external range {}..{} exceeds {} ({} bytes)",
                    start,
                    end,
                    external_path.display(),
                    file_data.len()
                ),
            )
        })?;

        tensor.raw_data = data_slice.to_vec();
        tensor.data_location = DataLocation::Default as i32;
        tensor.external_data.clear();

        Ok(())
    }

    fn insert_node(&mut self, node_data: GraphNode) -> NodeId {
        let output_names = node_data.output_names.clone();
        let name = node_data.name.clone();
        let node_id = self.graph.add_node(node_data);

        for (output_slot, output_name) in output_names.into_iter().enumerate() {
            if !output_name.is_empty() {
                self.tensor_producers.insert(output_name, (node_id, output_slot as u8));
            }
        }
        if !name.is_empty() {
            self.name_to_id.insert(name, node_id);
        }
        node_id
    }

    fn incoming_edges_for(&self, node_id: NodeId, input_names: &[String]) -> Vec<(NodeId, NodeId, Dependency)> {
        input_names
            .iter()
            .enumerate()
            .filter_map(|(input_slot, input_name)| {
                if input_name.is_empty() || self.initializers.contains_key(input_name) {
                    return None;
                }
                self.tensor_producers.get(input_name).map(|&(source_id, output_slot)| {
                    (
                        source_id,
                        node_id,
                        Dependency::Data {
                            tensor: input_name.clone(),
                            output_slot,
                            input_slot: input_slot as u8,
                        },
                    )
                })
            })
            .collect()
    }

    /// Start building a new operation
    pub fn add_op(&mut self, op_type: impl Into<String>) -> NewOp<'_> {
        NewOp::new(self, op_type.into())
    }

    pub fn add_input(&mut self, info: ValueInfoProto) {
        self.inputs.push(info);
    }

    pub fn add_output(&mut self, info: ValueInfoProto) {
        self.outputs.push(info);
    }

    pub fn add_value_info(&mut self, info: ValueInfoProto) {
        self.value_info.push(info);
    }

    pub fn add_initializer(&mut self, tensor: TensorProto) {
        self.initializers.insert(tensor.name.clone(), tensor);
    }

    /// Record an opset import for `domain`
    pub fn set_opset(&mut self, domain: &str, version: i64) {
        self.opset_imports.insert(canonical_domain(domain).to_string(), version);
    }

    /// Opset version imported for `domain`
    pub fn opset_version(&self, domain: &str) -> Option<i64> {
        self.opset_imports.get(canonical_domain(domain)).copied()
    }

    pub fn opset_imports(&self) -> &BTreeMap<String, i64> {
        &self.opset_imports
    }

    /// Get node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&GraphNode> {
        self.graph.node_weight(node_id)
    }

    /// Get node by name
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Node ids in insertion order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Human-readable label for logs and errors: the node name, or `op_type#index`
    pub fn display_name(&self, node_id: NodeId) -> String {
        match self.node(node_id) {
            Some(node) if !node.name.is_empty() => node.name.clone(),
            Some(node) => format!("{}#{}", node.op_type, node_id.index()),
            None => format!("#{}", node_id.index()),
        }
    }

    /// Node producing `tensor`, if any
    pub fn producer_of(&self, tensor: &str) -> Option<NodeId> {
        self.tensor_producers.get(tensor).map(|&(id, _)| id)
    }

    /// Distinct producer nodes of `node_id`'s inputs, ascending by index
    pub fn producers(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Distinct consumer nodes of `node_id`'s outputs, ascending by index
    pub fn consumers(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    fn neighbors(&self, node_id: NodeId, direction: Direction) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .edges_directed(node_id, direction)
            .map(|edge| match direction {
                Direction::Incoming => edge.source(),
                Direction::Outgoing => edge.target(),
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Stable topological order
    ///
    /// Kahn's algorithm with ties broken by insertion index, so the same
    /// graph always yields the same order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: FxHashMap<NodeId, usize> = self
            .graph
            .node_indices()
            .map(|id| (id, self.graph.edges_directed(id, Direction::Incoming).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node_id)) = ready.pop() {
            order.push(node_id);
            for edge in self.graph.edges_directed(node_id, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&edge.target()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(edge.target()));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let stuck = self
                .graph
                .node_indices()
                .filter(|id| in_degree.get(id).copied().unwrap_or(0) > 0)
                .min()
                .map(|id| self.display_name(id))
                .unwrap_or_default();
            return Err(CompilerError::GraphCycle { node: stuck });
        }

        Ok(order)
    }

    pub fn graph_inputs(&self) -> &[ValueInfoProto] {
        &self.inputs
    }

    pub fn graph_outputs(&self) -> &[ValueInfoProto] {
        &self.outputs
    }

    pub fn value_infos(&self) -> &[ValueInfoProto] {
        &self.value_info
    }

    pub fn is_graph_output(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|out| out.name == tensor)
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorProto> {
        self.initializers.get(name)
    }

    pub fn initializers_map(&self) -> &FxHashMap<String, TensorProto> {
        &self.initializers
    }

    /// An initializer is constant unless a graph input of the same name can override it
    pub fn is_constant_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name) && !self.inputs.iter().any(|input| input.name == name)
    }

    /// Constant initializer by name
    pub fn constant_initializer(&self, name: &str) -> Option<&TensorProto> {
        if self.is_constant_initializer(name) {
            self.initializers.get(name)
        } else {
            None
        }
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        let mut op_type_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.graph.node_weights() {
            *op_type_counts.entry(node.op_type.clone()).or_insert(0) += 1;
        }

        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            num_inputs: self.inputs.len(),
            num_outputs: self.outputs.len(),
            num_initializers: self.initializers.len(),
            op_type_counts,
        }
    }
}

impl Default for ComputeGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for adding operations to the graph
///
/// Inputs are named tensors; edges are connected to whichever node already
/// produces each tensor, so nodes must be added in dependency order.
pub struct NewOp<'a> {
    graph: &'a mut ComputeGraph,
    node_data: GraphNode,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut ComputeGraph, op_type: String) -> Self {
        Self {
            graph,
            node_data: GraphNode {
                name: String::new(),
                op_type,
                domain: String::new(),
                attributes: Vec::new(),
                input_names: Vec::new(),
                output_names: Vec::new(),
            },
        }
    }

    /// Set node name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node_data.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.node_data.domain = domain.into();
        self
    }

    /// Append one input tensor; `""` marks an omitted optional input
    pub fn input(mut self, tensor: impl Into<String>) -> Self {
        self.node_data.input_names.push(tensor.into());
        self
    }

    pub fn inputs<I, S>(mut self, tensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_data.input_names.extend(tensors.into_iter().map(Into::into));
        self
    }

    /// Add an attribute
    pub fn attribute(mut self, attr: AttributeProto) -> Self {
        self.node_data.attributes.push(attr);
        self
    }

    /// Set output names
    pub fn outputs<I, S>(mut self, tensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_data.output_names = tensors.into_iter().map(Into::into).collect();
        self
    }

    /// Finish building and add to graph
    pub fn finish(self) -> NodeId {
        let input_names = self.node_data.input_names.clone();
        let node_id = self.graph.insert_node(self.node_data);
        for (source_id, target_id, dep) in self.graph.incoming_edges_for(node_id, &input_names) {
            self.graph.graph.add_edge(source_id, target_id, dep);
        }
        node_id
    }
}

/// Integer attribute
pub fn int_attr(name: &str, value: i64) -> AttributeProto {
    use crate::proto::attribute_proto::AttributeType;
    AttributeProto {
        name: name.to_string(),
        i: value,
        r#type: AttributeType::Int as i32,
        ..Default::default()
    }
}

/// Integer list attribute
pub fn ints_attr(name: &str, values: &[i64]) -> AttributeProto {
    use crate::proto::attribute_proto::AttributeType;
    AttributeProto {
        name: name.to_string(),
        ints: values.to_vec(),
        r#type: AttributeType::Ints as i32,
        ..Default::default()
    }
}

/// Tensor value info with an explicit shape
pub fn tensor_value_info(name: &str, elem_type: ElementType, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| Dimension {
            value: match d {
                Dim::Value(v) => Some(dimension::Value::DimValue(*v)),
                Dim::Param(p) => Some(dimension::Value::DimParam(p.clone())),
                Dim::Unknown => None,
            },
            ..Default::default()
        })
        .collect();

    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type.to_onnx(),
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Graph statistics
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_initializers: usize,
    pub op_type_counts: BTreeMap<String, usize>,
}

impl std::fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph Statistics:")?;
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total edges: {}", self.total_edges)?;
        writeln!(f, "  Graph inputs: {}", self.num_inputs)?;
        writeln!(f, "  Graph outputs: {}", self.num_outputs)?;
        writeln!(f, "  Initializers: {}", self.num_initializers)?;
        writeln!(f, "  Operation types:")?;

        let mut sorted_ops: Vec<_> = self.op_type_counts.iter().collect();
        sorted_ops.sort_by(|a, b| b.1.cmp(a.1));

        for (op_type, count) in sorted_ops {
            writeln!(f, "    {}: {}", op_type, count)?;
        }

        Ok(())
    }
}
