use std::collections::{BTreeSet, HashMap, HashSet};

use itertools::Itertools;

use super::{Dim, Graph, TensorRole};
use crate::{
    error::{PipelineError, PipelineResult, Stage},
    layers::OpKind,
};

impl Graph {
    /// Structural checks run once at load time. Re-orders nodes topologically.
    pub fn validate(&mut self, stage: Stage) -> PipelineResult<()> {
        let malformed = |reason: String| PipelineError::malformed(stage, &self.name, reason);

        for info in self.input_infos() {
            if let Some(dims) = &info.shape {
                if dims.iter().any(|d| *d == Dim::Fixed(0)) {
                    return Err(malformed(format!("input '{}' has a zero dimension", info.name)));
                }
            }
        }

        let mut produced = HashSet::new();
        for node in &self.nodes {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                if !produced.insert(out.as_str()) {
                    return Err(malformed(format!("tensor '{out}' is produced twice")));
                }
            }
        }

        for node in &self.nodes {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                let known = produced.contains(input.as_str())
                    || self.initializers.contains_key(input)
                    || self.inputs.contains(input);
                if !known {
                    return Err(malformed(format!(
                        "input '{input}' of node '{}' has no producer",
                        node.name
                    )));
                }
            }
            if let Some(kind) = node.kind {
                let spec = kind.spec();
                let arity = node.inputs.len();
                let too_many = spec.max_inputs.is_some_and(|max| arity > max);
                let required_missing = (0..spec.min_inputs).any(|i| node.input(i).is_none());
                if too_many || required_missing {
                    return Err(malformed(format!(
                        "node '{}' ({}) has {} inputs, expected {}..{}",
                        node.name,
                        node.op_type,
                        arity,
                        spec.min_inputs,
                        spec.max_inputs.map_or("*".to_string(), |m| m.to_string())
                    )));
                }
            }
        }

        for out in &self.outputs {
            let known = produced.contains(out.as_str()) || self.inputs.contains(out) || self.initializers.contains_key(out);
            if !known {
                return Err(malformed(format!("graph output '{out}' is never produced")));
            }
        }

        self.check_parameter_shapes(stage)?;
        self.sort_topologically(stage)
    }

    fn check_parameter_shapes(&self, stage: Stage) -> PipelineResult<()> {
        let malformed = |reason: String| PipelineError::malformed(stage, &self.name, reason);
        for (name, value) in &self.initializers {
            if let Some(info) = self.tensors.get(name) {
                if let Some(declared) = info.static_shape() {
                    if info.role == TensorRole::Parameter && declared != value.get_shape() {
                        return Err(malformed(format!(
                            "initializer '{name}' holds {:?} but is declared {:?}",
                            value.get_shape(),
                            declared
                        )));
                    }
                }
            }
        }
        for node in &self.nodes {
            let param_shape = |i: usize| node.input(i).and_then(|n| self.initializers.get(n)).map(|t| t.get_shape());
            match node.kind {
                Some(OpKind::Conv) => {
                    if let Some(w) = param_shape(1) {
                        if w.len() != 4 {
                            return Err(malformed(format!("conv '{}' weight has shape {:?}", node.name, w)));
                        }
                        if let Some(b) = param_shape(2) {
                            if b != [w[0]] {
                                return Err(malformed(format!(
                                    "conv '{}' bias {:?} does not match {} output channels",
                                    node.name, b, w[0]
                                )));
                            }
                        }
                    }
                }
                Some(OpKind::Gemm) => {
                    if let Some(w) = param_shape(1) {
                        if w.len() != 2 {
                            return Err(malformed(format!("gemm '{}' weight has shape {:?}", node.name, w)));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Kahn's algorithm, preferring the original order among ready nodes.
    fn sort_topologically(&mut self, stage: Stage) -> PipelineResult<()> {
        let producers: HashMap<&str, usize> = self.producers();
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let deps = node
                .inputs
                .iter()
                .filter_map(|input| producers.get(input.as_str()).copied())
                .unique()
                .collect_vec();
            indegree[i] = deps.len();
            for d in deps {
                dependents[d].push(i);
            }
        }
        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|i| indegree[*i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .join(", ");
            return Err(PipelineError::malformed(stage, &self.name, format!("graph has a cycle through {stuck}")));
        }
        if order.iter().enumerate().any(|(pos, i)| pos != *i) {
            let mut nodes = std::mem::take(&mut self.nodes).into_iter().map(Some).collect_vec();
            self.nodes = order.into_iter().filter_map(|i| nodes[i].take()).collect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::PipelineError,
        graph::{Dim, GraphBuilder, Node},
        tensor::Tensor,
    };

    #[test]
    fn test_reorders_nodes() {
        let g = GraphBuilder::new("order")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("b", "Sigmoid", ["h"], ["y"]))
            .node(Node::new("a", "Relu", ["x"], ["h"]))
            .output("y")
            .build()
            .unwrap();
        let names: Vec<_> = g.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphBuilder::new("cycle")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("a", "Add", ["x", "c"], ["b"]))
            .node(Node::new("b", "Relu", ["b"], ["c"]))
            .output("c")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn test_dangling_input_rejected() {
        let err = GraphBuilder::new("dangling")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("a", "Add", ["x", "ghost"], ["y"]))
            .output("y")
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedGraph { .. }));
    }

    #[test]
    fn test_arity_checked_for_known_kinds_only() {
        let bad = GraphBuilder::new("arity")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("r", "Relu", ["x", "x"], ["y"]))
            .output("y")
            .build();
        assert!(bad.is_err());
        let unknown = GraphBuilder::new("custom")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("f", "Foo", ["x", "x", "x"], ["y"]))
            .output("y")
            .build();
        assert!(unknown.is_ok());
    }

    #[test]
    fn test_conv_bias_length_checked() {
        let err = GraphBuilder::new("conv")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(4)])
            .initializer("w", Tensor::new(vec![2, 3, 1, 1], vec![0.0f32; 6]).into())
            .initializer("b", Tensor::new(vec![3], vec![0.0f32; 3]).into())
            .node(Node::new("c", "Conv", ["x", "w", "b"], ["y"]))
            .output("y")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("bias"), "{err}");
    }

    #[test]
    fn test_zero_input_dimension_rejected() {
        let err = GraphBuilder::new("zero")
            .input("x", vec![Dim::Fixed(0)])
            .node(Node::new("r", "Relu", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedGraph { .. }));
    }
}
