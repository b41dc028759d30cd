//! Property tests for plan validation and topological ordering.

use proptest::prelude::*;

use mentat_orchestrator::plan::{CompiledPlan, EdgeSpec, NodeSpec, Plan};

fn node(id: String) -> NodeSpec {
    NodeSpec {
        id,
        agent_ref: None,
        params: serde_json::Map::new(),
    }
}

/// Random forward-only DAGs: edges always point from a lower declaration
/// index to a higher one, so the plan is acyclic by construction.
fn forward_dag() -> impl Strategy<Value = Plan> {
    (2usize..12).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2));
        edges.prop_map(move |pairs| Plan {
            nodes: (0..n).map(|i| node(format!("n{i}"))).collect(),
            edges: pairs
                .into_iter()
                .filter(|(a, b)| a < b)
                .map(|(a, b)| EdgeSpec {
                    from: format!("n{a}"),
                    to: format!("n{b}"),
                })
                .collect(),
        })
    })
}

proptest! {
    #[test]
    fn forward_dags_always_compile(plan in forward_dag()) {
        let compiled = CompiledPlan::compile(&plan).expect("forward DAG is valid");
        prop_assert_eq!(compiled.len(), plan.nodes.len());
    }

    #[test]
    fn topo_order_respects_every_edge(plan in forward_dag()) {
        let compiled = CompiledPlan::compile(&plan).expect("forward DAG is valid");
        let order: Vec<&str> = compiled.topo_order().collect();
        let position = |id: &str| order.iter().position(|o| *o == id).unwrap();
        for edge in &plan.edges {
            prop_assert!(position(&edge.from) < position(&edge.to));
        }
    }

    #[test]
    fn closing_the_loop_is_always_rejected(n in 2usize..8) {
        // A ring: n0 -> n1 -> ... -> n(k-1) -> n0.
        let plan = Plan {
            nodes: (0..n).map(|i| node(format!("n{i}"))).collect(),
            edges: (0..n)
                .map(|i| EdgeSpec {
                    from: format!("n{i}"),
                    to: format!("n{}", (i + 1) % n),
                })
                .collect(),
        };
        prop_assert!(CompiledPlan::compile(&plan).is_err());
    }
}
