//! Float reference interpreter used by calibration, accuracy checks and tests.
use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use thiserror::Error;
use tracing::trace;

use super::Graph;
use crate::{
    error::{PipelineError, PipelineResult, Stage},
    layers::{Evaluate, Layer},
    tensor::TensorData,
};

/// Failure while evaluating one node. `node` is the input name for feed errors.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("node '{node}': {reason}")]
pub struct ExecError {
    pub node: String,
    pub reason: String,
}

impl ExecError {
    fn new(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            node: node.into(),
            reason: reason.to_string(),
        }
    }
}

pub struct Executor<'a> {
    graph: &'a Graph,
    layers: Vec<Layer>,
    /// Remaining reads of each tensor, so values can be dropped after their last use.
    uses: HashMap<&'a str, usize>,
}

impl<'a> Executor<'a> {
    /// Parse every node once. Unknown operators are reported at `stage`.
    pub fn new(graph: &'a Graph, stage: Stage) -> PipelineResult<Self> {
        let layers = graph
            .nodes()
            .iter()
            .map(|node| {
                let kind = node.kind(stage)?;
                Layer::from_node(node, kind).map_err(|e| {
                    PipelineError::malformed(stage, &graph.name, format!("node '{}': {e:#}", node.name))
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        let mut uses: HashMap<&str, usize> = HashMap::new();
        for node in graph.nodes() {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                *uses.entry(input.as_str()).or_default() += 1;
            }
        }
        for out in graph.outputs() {
            *uses.entry(out.as_str()).or_default() += 1;
        }
        Ok(Self { graph, layers, uses })
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn run(&self, inputs: Vec<(String, TensorData)>) -> Result<BTreeMap<String, TensorData>, ExecError> {
        self.run_observed(inputs, |_, _| {})
    }

    /// Evaluate the graph, handing every graph input and every node output to `observe`
    /// as soon as it is computed. Returns the graph outputs by name.
    pub fn run_observed<F>(
        &self,
        inputs: Vec<(String, TensorData)>,
        mut observe: F,
    ) -> Result<BTreeMap<String, TensorData>, ExecError>
    where
        F: FnMut(&str, &TensorData),
    {
        let mut values: HashMap<String, TensorData> = HashMap::new();
        for (name, value) in inputs {
            let Some(info) = self.graph.tensor(&name).filter(|_| self.graph.inputs().contains(&name)) else {
                return Err(ExecError::new(&name, "not a graph input"));
            };
            if value.data_type() != info.dtype {
                return Err(ExecError::new(
                    &name,
                    format!("expected {} input, got {}", info.dtype, value.data_type()),
                ));
            }
            if let Some(dims) = &info.shape {
                let shape = value.get_shape();
                let matches = dims.len() == shape.len()
                    && dims.iter().zip(shape.iter()).all(|(d, s)| d.fixed().map_or(true, |d| d == *s));
                if !matches {
                    return Err(ExecError::new(
                        &name,
                        format!(
                            "input shape {:?} does not match [{}]",
                            shape,
                            dims.iter().join(", ")
                        ),
                    ));
                }
            }
            observe(&name, &value);
            values.insert(name, value);
        }
        if let Some(missing) = self.graph.inputs().iter().find(|i| !values.contains_key(*i)) {
            return Err(ExecError::new(missing, "graph input not provided"));
        }

        let mut remaining = self.uses.clone();
        for (node, layer) in self.graph.nodes().iter().zip(self.layers.iter()) {
            let outputs = {
                let args = node
                    .inputs
                    .iter()
                    .map(|name| {
                        if name.is_empty() {
                            return Ok(None);
                        }
                        values
                            .get(name)
                            .or_else(|| self.graph.initializer(name))
                            .map(Some)
                            .ok_or_else(|| ExecError::new(&node.name, format!("missing value for '{name}'")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                layer
                    .evaluate(&args)
                    .map_err(|e| ExecError::new(&node.name, format!("{e:#}")))?
            };
            trace!(node = %node.name, layer = %layer, "evaluated");

            let wanted = node.outputs.iter().rposition(|o| !o.is_empty()).map_or(0, |i| i + 1);
            if outputs.len() < wanted {
                return Err(ExecError::new(
                    &node.name,
                    format!("produced {} outputs, {} expected", outputs.len(), wanted),
                ));
            }
            for (name, value) in node.outputs.iter().zip(outputs) {
                if name.is_empty() {
                    continue;
                }
                observe(name, &value);
                if remaining.get(name.as_str()).copied().unwrap_or(0) > 0 {
                    values.insert(name.clone(), value);
                }
            }

            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if let Some(count) = remaining.get_mut(input.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        values.remove(input);
                    }
                }
            }
        }

        self.graph
            .outputs()
            .iter()
            .map(|name| {
                values
                    .get(name)
                    .or_else(|| self.graph.initializer(name))
                    .cloned()
                    .map(|v| (name.clone(), v))
                    .ok_or_else(|| ExecError::new(name, "graph output was not computed"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{Attribute, Dim, GraphBuilder, Node},
        tensor::Tensor,
    };

    fn small_graph() -> Graph {
        GraphBuilder::new("small")
            .input("x", vec![Dim::Dynamic("N".into()), Dim::Fixed(2)])
            .initializer("w", Tensor::new(vec![2, 2], vec![1.0f32, -1.0, 2.0, 0.5]).into())
            .initializer("b", Tensor::new(vec![2], vec![0.5f32, -4.0]).into())
            .node(Node::new("gemm", "Gemm", ["x", "w", "b"], ["h"]))
            .node(Node::new("relu", "Relu", ["h"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    #[test]
    fn test_run_small_graph() {
        let g = small_graph();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let x = Tensor::new(vec![1, 2], vec![1.0f32, 2.0]);
        let out = exec.run(vec![("x".into(), x.into())]).unwrap();
        // h = [1 + 4 + 0.5, -1 + 1 - 4]
        assert_eq!(out["y"].as_f32().unwrap().get_data(), &[5.5, 0.0]);
    }

    #[test]
    fn test_observer_sees_inputs_and_intermediates() {
        let g = small_graph();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let mut seen = vec![];
        let x = Tensor::new(vec![3, 2], vec![0.0f32; 6]);
        exec.run_observed(vec![("x".into(), x.into())], |name, _| seen.push(name.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["x", "h", "y"]);
    }

    #[test]
    fn test_input_shape_mismatch() {
        let g = small_graph();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let x = Tensor::new(vec![1, 3], vec![0.0f32; 3]);
        let err = exec.run(vec![("x".into(), x.into())]).unwrap_err();
        assert_eq!(err.node, "x");
    }

    #[test]
    fn test_missing_input() {
        let g = small_graph();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let err = exec.run(vec![]).unwrap_err();
        assert!(err.reason.contains("not provided"));
    }

    #[test]
    fn test_unknown_operator_reported_at_stage() {
        let g = GraphBuilder::new("custom")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("n3", "Foo", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let err = Executor::new(&g, Stage::Calibrate).err().unwrap();
        assert_eq!(err.to_string(), "[calibrate] unsupported operator 'Foo' at node 'n3'");
    }

    #[test]
    fn test_layer_error_reports_caller_stage() {
        let g = GraphBuilder::new("upsample")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(2)])
            .node(Node::new("up", "Resize", ["x"], ["y"]).with_attr("mode", Attribute::String("cubic".into())))
            .output("y")
            .build()
            .unwrap();
        for stage in [Stage::Calibrate, Stage::Quantize] {
            let err = Executor::new(&g, stage).err().unwrap();
            assert!(matches!(err, PipelineError::MalformedGraph { .. }), "{err}");
            assert_eq!(err.stage(), stage);
            assert!(err.to_string().starts_with(&format!("[{stage}] malformed graph 'upsample'")), "{err}");
        }
    }

    #[test]
    fn test_node_failure_names_node() {
        let g = GraphBuilder::new("bad")
            .input("x", vec![Dim::Fixed(2)])
            .initializer("y0", Tensor::new(vec![3], vec![1.0f32; 3]).into())
            .node(Node::new("add", "Add", ["x", "y0"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let err = exec
            .run(vec![("x".into(), Tensor::new(vec![2], vec![1.0f32, 2.0]).into())])
            .unwrap_err();
        assert_eq!(err.node, "add");
    }
}
