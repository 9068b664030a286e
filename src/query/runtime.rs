//! Query execution against the graph core.

use regex::Regex;

use crate::error::{GraphError, Result};
use crate::graph::core::GraphCore;
use crate::graph::storage::main_db_list;
use crate::model::{AttrValue, Node};
use crate::query::ast::{CmpOp, Expr, Query, ShowItem};
use crate::query::result::{ResultHeader, SearchResult};
use crate::util::glob_to_regex;

fn runtime_error(detail: impl Into<String>) -> GraphError {
    GraphError::QueryRuntime {
        detail: detail.into(),
        line: 0,
        column: 0,
    }
}

/// Compiles nothing ahead of time: the query streams node keys from the
/// starting kind, applies predicates (key lookups are pushed down to the
/// index), expands the traversal chain and materialises rows with per-cell
/// source annotations.
pub(crate) fn run(core: &mut GraphCore, partition: &str, query: &Query) -> Result<SearchResult> {
    let keys = match query.where_clause.as_ref().and_then(key_literal) {
        Some(key) => vec![key],
        None => core.node_keys(partition, &query.kind)?,
    };

    // Starting set.
    let mut chains: Vec<Vec<Node>> = Vec::new();
    for key in keys {
        let Some(node) = core.fetch_node(partition, &key, &query.kind)? else {
            continue;
        };
        if let Some(expr) = &query.where_clause {
            if !eval_bool(expr, &node)? {
                continue;
            }
        }
        chains.push(vec![node]);
    }

    // Traversal expansion.
    for step in &query.traversals {
        let mut expanded = Vec::new();
        for chain in chains {
            let last = chain.last().expect("chain is never empty");
            let (_, edges) =
                core.traverse(partition, last.key(), last.kind(), &step.spec, true)?;
            let anchor = (last.key().to_string(), last.kind().to_string());
            for edge in edges {
                let Some(this_end) = edge.end_of(&anchor.0, &anchor.1) else {
                    continue;
                };
                let far = this_end.other();
                let Some(target) =
                    core.fetch_node(partition, edge.end_key(far), edge.end_kind(far))?
                else {
                    continue;
                };
                if let Some(expr) = &step.where_clause {
                    if !eval_bool(expr, &target)? {
                        continue;
                    }
                }
                let mut next = chain.clone();
                next.push(target);
                expanded.push(next);
            }
        }
        chains = expanded;
    }

    let primary_kind = query.primary.clone().unwrap_or_else(|| query.kind.clone());

    // Ordering happens before projection; the attribute may be qualified
    // with a chain position (`2:name`), otherwise the primary entity is
    // consulted.
    if let Some(ordering) = &query.ordering {
        let (pos, attr) = split_pos_attr(&ordering.attr);
        chains.sort_by(|a, b| {
            let left = chain_attr(a, pos, &primary_kind, attr);
            let right = chain_attr(b, pos, &primary_kind, attr);
            let cmp = left.cmp_order(&right);
            if ordering.ascending {
                cmp
            } else {
                cmp.reverse()
            }
        });
    }

    // Projection.
    let show = effective_show(core, query);
    let mut rows = Vec::with_capacity(chains.len());
    let mut sources = Vec::with_capacity(chains.len());
    for chain in &chains {
        let mut row = Vec::with_capacity(show.len());
        let mut row_sources = Vec::with_capacity(show.len());
        for item in &show {
            match chain.get(item.pos) {
                Some(node) => {
                    row.push(node.attr(&item.attr).cloned().unwrap_or(AttrValue::Null));
                    row_sources.push(format!("n:{}:{}", node.kind(), node.key()));
                }
                None => {
                    row.push(AttrValue::Null);
                    row_sources.push(String::new());
                }
            }
        }
        rows.push(row);
        sources.push(row_sources);
    }

    let header = ResultHeader {
        partition: partition.to_string(),
        primary_kind,
        labels: show.iter().map(|item| item.attr.clone()).collect(),
        format: vec!["auto".to_string(); show.len()],
    };
    Ok(SearchResult::new(header, rows, sources))
}

/// The columns to project: explicit `show` items, the kind's known
/// attributes, or a bare key/kind fallback.
fn effective_show(core: &mut GraphCore, query: &Query) -> Vec<ShowItem> {
    if !query.show.is_empty() {
        return query.show.clone();
    }
    let attrs = main_db_list(core.main_db(), &format!("nodeattrs.{}", query.kind));
    if attrs.is_empty() {
        return vec![
            ShowItem {
                pos: 0,
                attr: "key".into(),
            },
            ShowItem {
                pos: 0,
                attr: "kind".into(),
            },
        ];
    }
    attrs
        .into_iter()
        .map(|attr| ShowItem { pos: 0, attr })
        .collect()
}

fn split_pos_attr(attr: &str) -> (Option<usize>, &str) {
    if let Some((pos, rest)) = attr.split_once(':') {
        if let Ok(pos) = pos.parse::<usize>() {
            if pos >= 1 && !rest.is_empty() {
                return (Some(pos - 1), rest);
            }
        }
    }
    (None, attr)
}

fn chain_attr(chain: &[Node], pos: Option<usize>, primary_kind: &str, attr: &str) -> AttrValue {
    let node = match pos {
        Some(pos) => chain.get(pos),
        None => chain
            .iter()
            .find(|n| n.kind() == primary_kind)
            .or_else(|| chain.first()),
    };
    node.and_then(|n| n.attr(attr).cloned())
        .unwrap_or(AttrValue::Null)
}

/// Top-level `key = "literal"` conjunct, if present; pushed down to a direct
/// index lookup.
fn key_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Cmp(CmpOp::Eq, left, right) => match (left.as_ref(), right.as_ref()) {
            (Expr::Attr(attr), Expr::Lit(AttrValue::Str(value))) if attr == "key" => {
                Some(value.clone())
            }
            (Expr::Lit(AttrValue::Str(value)), Expr::Attr(attr)) if attr == "key" => {
                Some(value.clone())
            }
            _ => None,
        },
        Expr::And(left, right) => key_literal(left).or_else(|| key_literal(right)),
        _ => None,
    }
}

fn eval_bool(expr: &Expr, node: &Node) -> Result<bool> {
    match expr {
        Expr::And(left, right) => Ok(eval_bool(left, node)? && eval_bool(right, node)?),
        Expr::Or(left, right) => Ok(eval_bool(left, node)? || eval_bool(right, node)?),
        Expr::Not(inner) => Ok(!eval_bool(inner, node)?),
        Expr::Cmp(op, left, right) => {
            let lv = eval_value(left, node)?;
            let rv = eval_value(right, node)?;
            eval_cmp(*op, &lv, &rv)
        }
        other => Ok(truthy(&eval_value(other, node)?)),
    }
}

fn eval_value(expr: &Expr, node: &Node) -> Result<AttrValue> {
    match expr {
        Expr::Attr(name) => Ok(node.attr(name).cloned().unwrap_or(AttrValue::Null)),
        Expr::Lit(value) => Ok(value.clone()),
        other => eval_bool(other, node).map(AttrValue::Bool),
    }
}

fn truthy(value: &AttrValue) -> bool {
    match value {
        AttrValue::Null => false,
        AttrValue::Bool(b) => *b,
        _ => true,
    }
}

fn values_equal(left: &AttrValue, right: &AttrValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn eval_cmp(op: CmpOp, left: &AttrValue, right: &AttrValue) -> Result<bool> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        CmpOp::Gt => Ok(left.cmp_order(right) == Ordering::Greater),
        CmpOp::Ge => Ok(left.cmp_order(right) != Ordering::Less),
        CmpOp::Lt => Ok(left.cmp_order(right) == Ordering::Less),
        CmpOp::Le => Ok(left.cmp_order(right) != Ordering::Greater),
        CmpOp::Contains => Ok(left.to_string().contains(&right.to_string())),
        CmpOp::BeginsWith => Ok(left.to_string().starts_with(&right.to_string())),
        CmpOp::EndsWith => Ok(left.to_string().ends_with(&right.to_string())),
        CmpOp::Like => {
            let pattern = glob_to_regex(&right.to_string());
            let regex = Regex::new(&pattern)
                .map_err(|e| runtime_error(format!("invalid like pattern: {e}")))?;
            Ok(regex.is_match(&left.to_string()))
        }
    }
}
