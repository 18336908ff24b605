//! In-memory computation graph: tensor descriptors, operator nodes, initializers.
mod builder;
mod exec;
pub(crate) mod onnx;
mod validate;

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    path::Path,
};

use anyhow::{Result, bail};
use derive_more::Display;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, PipelineResult, Stage},
    layers::OpKind,
    tensor::{DataType, TensorData},
};
pub use builder::GraphBuilder;
pub use exec::{ExecError, Executor};

/// Parse and validate an ONNX model.
pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Graph> {
    onnx::load(path.as_ref())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    Dynamic(String),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(d) => Some(*d),
            Dim::Dynamic(_) => None,
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Fixed(d) => write!(f, "{d}"),
            Dim::Dynamic(s) if s.is_empty() => write!(f, "?"),
            Dim::Dynamic(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorRole {
    #[display("input")]
    Input,
    #[display("output")]
    Output,
    #[display("parameter")]
    Parameter,
    #[display("intermediate")]
    Intermediate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    /// `None` when the rank is unknown.
    pub shape: Option<Vec<Dim>>,
    pub dtype: DataType,
    pub role: TensorRole,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, shape: Option<Vec<Dim>>, dtype: DataType, role: TensorRole) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            role,
        }
    }

    /// Shape with every dimension known.
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape.as_ref()?.iter().map(Dim::fixed).collect()
    }

    fn describe_shape(&self) -> String {
        match &self.shape {
            Some(dims) => format!("[{}]", dims.iter().join(", ")),
            None => "[?]".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Tensor(TensorData),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    /// `None` when the op type is outside the supported vocabulary.
    pub kind: Option<OpKind>,
    /// An empty name marks an omitted optional input.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: impl IntoIterator<Item = S>,
        outputs: impl IntoIterator<Item = S>,
    ) -> Self {
        let op_type = op_type.into();
        Self {
            name: name.into(),
            kind: OpKind::from_op_type(&op_type),
            op_type,
            domain: String::new(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set the operator domain. Kinds are only resolved for the default ONNX domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        if !(self.domain.is_empty() || self.domain == "ai.onnx") {
            self.kind = None;
        }
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Resolved kind, or the error to report at `stage` for an unknown operator.
    pub fn kind(&self, stage: Stage) -> PipelineResult<OpKind> {
        self.kind.ok_or_else(|| PipelineError::UnsupportedOperator {
            stage,
            op_type: self.op_type.clone(),
            node: self.name.clone(),
        })
    }

    /// Input name at `i`, skipping omitted optional inputs.
    pub fn input(&self, i: usize) -> Option<&str> {
        self.inputs.get(i).map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn attr_int(&self, name: &str, default: i64) -> Result<i64> {
        match self.attributes.get(name) {
            None => Ok(default),
            Some(Attribute::Int(i)) => Ok(*i),
            Some(other) => bail!("attribute '{}' of '{}' is not an int: {:?}", name, self.name, other),
        }
    }

    pub fn attr_float(&self, name: &str, default: f32) -> Result<f32> {
        match self.attributes.get(name) {
            None => Ok(default),
            Some(Attribute::Float(f)) => Ok(*f),
            Some(Attribute::Int(i)) => Ok(*i as f32),
            Some(other) => bail!("attribute '{}' of '{}' is not a float: {:?}", name, self.name, other),
        }
    }

    pub fn attr_ints(&self, name: &str) -> Result<Option<Vec<i64>>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(Attribute::Ints(v)) => Ok(Some(v.clone())),
            Some(Attribute::Int(i)) => Ok(Some(vec![*i])),
            Some(other) => bail!("attribute '{}' of '{}' is not an int list: {:?}", name, self.name, other),
        }
    }

    pub fn attr_floats(&self, name: &str) -> Result<Option<Vec<f32>>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(Attribute::Floats(v)) => Ok(Some(v.clone())),
            Some(Attribute::Float(f)) => Ok(Some(vec![*f])),
            Some(other) => bail!("attribute '{}' of '{}' is not a float list: {:?}", name, self.name, other),
        }
    }

    pub fn attr_string(&self, name: &str, default: &str) -> Result<String> {
        match self.attributes.get(name) {
            None => Ok(default.to_string()),
            Some(Attribute::String(s)) => Ok(s.clone()),
            Some(other) => bail!("attribute '{}' of '{}' is not a string: {:?}", name, self.name, other),
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Option<&TensorData> {
        match self.attributes.get(name) {
            Some(Attribute::Tensor(t)) => Some(t),
            _ => None,
        }
    }
}

/// A validated, acyclic graph whose nodes are stored in topological order.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    pub name: String,
    pub opset: i64,
    pub(crate) nodes: Vec<Node>,
    pub(crate) tensors: BTreeMap<String, TensorInfo>,
    pub(crate) initializers: BTreeMap<String, TensorData>,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &TensorInfo> {
        self.tensors.values()
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorData> {
        self.initializers.get(name)
    }

    pub fn initializers(&self) -> &BTreeMap<String, TensorData> {
        &self.initializers
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn input_infos(&self) -> Vec<&TensorInfo> {
        self.inputs.iter().filter_map(|n| self.tensors.get(n)).collect()
    }

    pub fn output_infos(&self) -> Vec<&TensorInfo> {
        self.outputs.iter().filter_map(|n| self.tensors.get(n)).collect()
    }

    /// Index of the node producing each tensor.
    pub fn producers(&self) -> HashMap<&str, usize> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().filter(|o| !o.is_empty()).map(move |o| (o.as_str(), i)))
            .collect()
    }

    /// Indices of the nodes reading each tensor, in node order.
    pub fn consumers(&self) -> HashMap<&str, Vec<usize>> {
        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, n) in self.nodes.iter().enumerate() {
            for input in n.inputs.iter().filter(|s| !s.is_empty()) {
                let entry = consumers.entry(input.as_str()).or_default();
                if entry.last() != Some(&i) {
                    entry.push(i);
                }
            }
        }
        consumers
    }

    /// Pin the single graph input to a concrete `[N, C, H, W]` shape. Fixed dimensions
    /// already present in the model must agree.
    pub fn resolve_input_shape(&mut self, shape: &[usize]) -> PipelineResult<()> {
        let [input] = self.inputs.as_slice() else {
            return Err(PipelineError::malformed(
                Stage::Config,
                &self.name,
                format!("expected exactly one graph input, found {}", self.inputs.len()),
            ));
        };
        let input = input.clone();
        let Some(info) = self.tensors.get_mut(&input) else {
            return Err(PipelineError::malformed(Stage::Config, &self.name, format!("input '{input}' has no descriptor")));
        };
        if let Some(dims) = &info.shape {
            let compatible = dims.len() == shape.len()
                && dims
                    .iter()
                    .zip(shape.iter())
                    .all(|(d, s)| d.fixed().map_or(true, |d| d == *s));
            if !compatible {
                return Err(PipelineError::invalid_config(
                    Stage::Config,
                    "input_shape",
                    format!(
                        "{:?} is incompatible with model input '{}' {}",
                        shape,
                        input,
                        info.describe_shape()
                    ),
                ));
            }
        }
        info.shape = Some(shape.iter().map(|d| Dim::Fixed(*d)).collect());
        Ok(())
    }

    /// Human readable description used by `inspect`.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "graph '{}' (opset {})", self.name, self.opset);
        for info in self.input_infos() {
            let _ = writeln!(out, "  input  {} {} {}", info.name, info.dtype, info.describe_shape());
        }
        for info in self.output_infos() {
            let _ = writeln!(out, "  output {} {} {}", info.name, info.dtype, info.describe_shape());
        }
        let parameters: usize = self.initializers.values().map(TensorData::len).sum();
        let _ = writeln!(
            out,
            "  {} nodes, {} initializers ({} parameters)",
            self.nodes.len(),
            self.initializers.len(),
            parameters
        );
        let histogram = self.nodes.iter().counts_by(|n| n.op_type.as_str());
        for (op, count) in histogram.into_iter().sorted() {
            let marker = if OpKind::from_op_type(op).is_none() {
                " (unsupported)"
            } else {
                ""
            };
            let _ = writeln!(out, "    {op:<20} {count}{marker}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn relu_graph() -> Graph {
        GraphBuilder::new("relu")
            .input("x", vec![Dim::Dynamic("N".into()), Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(4)])
            .node(Node::new("r", "Relu", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_input_shape() {
        let mut g = relu_graph();
        g.resolve_input_shape(&[1, 3, 4, 4]).unwrap();
        assert_eq!(g.tensor("x").unwrap().static_shape(), Some(vec![1, 3, 4, 4]));
        let err = g.resolve_input_shape(&[1, 1, 4, 4]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig { .. }));
    }

    #[test]
    fn test_unknown_kind_reported_with_stage() {
        let node = Node::new("n3", "Foo", ["a"], ["b"]);
        let err = node.kind(Stage::Calibrate).unwrap_err();
        assert_eq!(err.to_string(), "[calibrate] unsupported operator 'Foo' at node 'n3'");
        let custom = Node::new("n4", "Relu", ["a"], ["b"]).with_domain("com.vendor");
        assert!(custom.kind.is_none());
    }

    #[test]
    fn test_summary_lists_ops() {
        let g = GraphBuilder::new("s")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(2)])
            .initializer("w", Tensor::new(vec![2, 2], vec![1.0f32, 0.0, 0.0, 1.0]).into())
            .node(Node::new("mm", "MatMul", ["x", "w"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let summary = g.summary();
        assert!(summary.contains("MatMul"));
        assert!(summary.contains("4 parameters"));
    }
}
