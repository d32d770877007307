//! Implementation for generating a graphviz file for the Control Flow Graph.

use std::collections::BTreeSet as Set;

use super::*;

pub fn dump_cfg(f: &Function, graph_type_and_name: &str) -> String {
    let mut edge_str = String::new();
    let mut node_str = String::new();

    let f_id = f.id.name();

    let mut gen_node = |bb: &BbId| {
        let block = &f.body[bb];
        let mut label = format!("{bb}:\\l");
        for inst in &block.insts {
            label.push_str(&format!("  {inst}\\l"));
        }
        label.push_str(&format!("  {}\\l", block.term));
        node_str.push_str(&format!(
            r#"
"{f_id}__{bb}" [label = "{label}"];
"#
        ));
    };

    let mut gen_edge = |from: &BbId, to: &BbId| {
        edge_str.push_str(&format!(
            r#"
"{f_id}__{from}" -> "{f_id}__{to}";
"#
        ));
    };

    let mut worklist = vec![f.entry_id()];
    let mut visited = Set::<BbId>::new();
    while let Some(bb) = worklist.pop() {
        if !visited.insert(bb.clone()) {
            continue;
        }
        gen_node(&bb);

        for next in f.body[&bb].term.succs() {
            gen_edge(&bb, next);
            worklist.push(next.clone());
        }
    }

    format!(
        r#"{graph_type_and_name} {{
label = "{f_id}";
node [shape=box nojustify=true];
{node_str}
{edge_str}
}}
"#
    )
}

pub fn dump_cfg_of_whole_program(program: &Program) -> String {
    let mut g = "digraph G {\n".to_string();

    for (id, f) in &program.functions {
        g.push_str(&dump_cfg(f, &format!("subgraph \"cluster_{}\"", id.name())));
    }

    g.push_str("\n}");

    g
}
