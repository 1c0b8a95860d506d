//! Graphviz export of the resource graph
//!
//! Used by `provisioner graph`. Edges point from producer to consumer.

use std::fmt::Write as _;

use super::{EdgeReason, ResourceGraph};

/// Render the graph as a Graphviz DOT diagram. Data edges are solid,
/// ordering-only edges dashed.
pub fn render_dot(graph: &ResourceGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph resources {{");
    let _ = writeln!(out, "  rankdir=LR;");
    let _ = writeln!(out, "  node [shape=box, fontname=\"Helvetica\"];");

    for node in graph.nodes() {
        let _ = writeln!(
            out,
            "  \"{node}\" [label=\"{}\\n{}\"];",
            node.kind(),
            node.name()
        );
    }

    for (producer, consumer, info) in graph.edges() {
        let style = if info.has(EdgeReason::Data) {
            "solid"
        } else {
            "dashed"
        };
        let label = info
            .reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("+");
        let _ = writeln!(
            out,
            "  \"{producer}\" -> \"{consumer}\" [style={style}, label=\"{label}\"];"
        );
    }

    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::addr;

    #[test]
    fn test_render_dot() {
        let mut graph = ResourceGraph::new();
        graph.add_edge(&addr("subnet.a"), &addr("key_vault.b"), EdgeReason::Data, "p");
        graph.add_edge(&addr("key_vault.b"), &addr("key_vault_secret.c"), EdgeReason::Ordering, "p");

        let dot = render_dot(&graph);
        assert!(dot.starts_with("digraph resources {"));
        assert!(dot.contains("\"subnet.a\" -> \"key_vault.b\" [style=solid, label=\"data\"];"));
        assert!(dot.contains(
            "\"key_vault.b\" -> \"key_vault_secret.c\" [style=dashed, label=\"ordering\"];"
        ));
        assert!(dot.contains("\"subnet.a\" [label=\"subnet\\na\"];"));
    }
}
