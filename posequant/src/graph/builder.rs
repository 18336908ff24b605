use std::collections::{BTreeMap, BTreeSet};

use super::{Dim, Graph, Node, TensorInfo, TensorRole};
use crate::{
    error::{PipelineError, PipelineResult, Stage},
    layers::OpKind,
    tensor::{DataType, TensorData},
};

/// Default opset of graphs built in memory; QDQ per-channel axes need at least 13.
pub const DEFAULT_OPSET: i64 = 13;

/// Assembles a [`Graph`] from its parts and validates it. Used by the ONNX loader, the
/// rewriter and tests.
#[derive(Clone, Debug)]
pub struct GraphBuilder {
    name: String,
    /// Stage reported by validation errors.
    stage: Stage,
    opset: i64,
    inputs: Vec<TensorInfo>,
    /// Declared outputs; `None` leaves shape and type to inference.
    outputs: Vec<(String, Option<TensorInfo>)>,
    initializers: Vec<(String, TensorData)>,
    value_info: Vec<TensorInfo>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: Stage::Load,
            opset: DEFAULT_OPSET,
            inputs: vec![],
            outputs: vec![],
            initializers: vec![],
            value_info: vec![],
            nodes: vec![],
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn opset(mut self, opset: i64) -> Self {
        self.opset = opset;
        self
    }

    /// f32 graph input.
    pub fn input(self, name: impl Into<String>, shape: Vec<Dim>) -> Self {
        self.typed_input(name, Some(shape), DataType::F32)
    }

    pub fn typed_input(mut self, name: impl Into<String>, shape: Option<Vec<Dim>>, dtype: DataType) -> Self {
        self.inputs.push(TensorInfo::new(name, shape, dtype, TensorRole::Input));
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push((name.into(), None));
        self
    }

    pub fn typed_output(mut self, name: impl Into<String>, shape: Option<Vec<Dim>>, dtype: DataType) -> Self {
        let info = TensorInfo::new(name, shape, dtype, TensorRole::Output);
        self.outputs.push((info.name.clone(), Some(info)));
        self
    }

    pub fn initializer(mut self, name: impl Into<String>, value: TensorData) -> Self {
        self.initializers.push((name.into(), value));
        self
    }

    /// Declared descriptor of an intermediate tensor.
    pub fn value_info(mut self, info: TensorInfo) -> Self {
        self.value_info.push(info);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn build(self) -> PipelineResult<Graph> {
        let name = self.name;
        let stage = self.stage;
        let malformed = |reason: String| PipelineError::malformed(stage, &name, reason);

        let mut tensors = BTreeMap::new();
        let mut initializers = BTreeMap::new();
        for (init_name, value) in self.initializers {
            let info = TensorInfo::new(
                &init_name,
                Some(value.get_shape().into_iter().map(Dim::Fixed).collect()),
                value.data_type(),
                TensorRole::Parameter,
            );
            if initializers.insert(init_name.clone(), value).is_some() {
                return Err(malformed(format!("initializer '{init_name}' is defined twice")));
            }
            tensors.insert(init_name, info);
        }

        let mut inputs = vec![];
        let mut seen_inputs = BTreeSet::new();
        for info in self.inputs {
            if !seen_inputs.insert(info.name.clone()) {
                return Err(malformed(format!("graph input '{}' is declared twice", info.name)));
            }
            // Older IR versions list every initializer as a graph input as well.
            if let Some(param) = tensors.get(&info.name) {
                if let (Some(declared), Some(actual)) = (info.static_shape(), param.static_shape()) {
                    if declared != actual {
                        return Err(malformed(format!(
                            "initializer '{}' has shape {:?} but is declared as {:?}",
                            info.name, actual, declared
                        )));
                    }
                }
                continue;
            }
            inputs.push(info.name.clone());
            tensors.insert(info.name.clone(), info);
        }

        let declared: BTreeMap<String, TensorInfo> = self
            .value_info
            .into_iter()
            .chain(self.outputs.iter().filter_map(|(_, info)| info.clone()))
            .map(|i| (i.name.clone(), i))
            .collect();

        for node in &self.nodes {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                if tensors.contains_key(out) {
                    return Err(malformed(format!(
                        "tensor '{out}' produced by node '{}' is already defined",
                        node.name
                    )));
                }
                let dtype = declared
                    .get(out)
                    .map(|d| d.dtype)
                    .unwrap_or_else(|| infer_output_type(node, &initializers));
                let shape = declared.get(out).and_then(|d| d.shape.clone());
                tensors.insert(out.clone(), TensorInfo::new(out, shape, dtype, TensorRole::Intermediate));
            }
        }

        let mut outputs = vec![];
        for (out, _) in self.outputs {
            let Some(info) = tensors.get_mut(&out) else {
                return Err(malformed(format!("graph output '{out}' is never produced")));
            };
            if info.role == TensorRole::Intermediate {
                info.role = TensorRole::Output;
            }
            outputs.push(out);
        }

        let mut graph = Graph {
            name,
            opset: self.opset,
            nodes: self.nodes,
            tensors,
            initializers,
            inputs,
            outputs,
        };
        graph.validate(stage)?;
        Ok(graph)
    }
}

/// Element type of an undeclared node output.
fn infer_output_type(node: &Node, initializers: &BTreeMap<String, TensorData>) -> DataType {
    match node.kind {
        Some(OpKind::QuantizeLinear) => node
            .input(2)
            .and_then(|zp| initializers.get(zp))
            .map_or(DataType::I8, TensorData::data_type),
        Some(OpKind::Constant) => node
            .attr_tensor("value")
            .map(TensorData::data_type)
            .or_else(|| node.attributes.contains_key("value_ints").then_some(DataType::I64))
            .or_else(|| node.attributes.contains_key("value_int").then_some(DataType::I64))
            .unwrap_or(DataType::F32),
        _ => DataType::F32,
    }
}
