//! Locating a [`Selector`] on the current screen: exact first, then fuzzy by text.

use crate::screen::{NodePath, ScreenNode, ScreenTree};
use crate::types::{MatchKind, Selector};

const MIN_TOKEN_LEN: usize = 3;
const STEM_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct Resolved<'a> {
    pub path: NodePath,
    pub node: &'a ScreenNode,
    pub mode: MatchMode,
}

/// Exact match among visible nodes, falling back to a breadth-first fuzzy search for text.
pub fn resolve<'a>(tree: &'a ScreenTree, selector: &Selector) -> Option<Resolved<'a>> {
    let target = selector.value.trim();
    if target.is_empty() {
        return None;
    }
    if let Some((path, node)) = exact(tree, selector.match_kind, target) {
        return Some(Resolved {
            path,
            node,
            mode: MatchMode::Exact,
        });
    }
    if selector.match_kind != MatchKind::Text {
        return None;
    }
    tree.visible_nodes_bfs()
        .into_iter()
        .find(|(_, node)| node_matches_fuzzy(node, target))
        .map(|(path, node)| Resolved {
            path,
            node,
            mode: MatchMode::Fuzzy,
        })
}

fn exact<'a>(
    tree: &'a ScreenTree,
    kind: MatchKind,
    target: &str,
) -> Option<(NodePath, &'a ScreenNode)> {
    let folded = target.to_lowercase();
    tree.visible_nodes()
        .into_iter()
        .find(|(_, _, node)| match kind {
            MatchKind::Text => node.label().is_some_and(|t| t.to_lowercase() == folded),
            MatchKind::Description => node.desc().is_some_and(|d| d.to_lowercase() == folded),
            MatchKind::Id => node.view_id.as_deref().is_some_and(|id| id_matches(id, target)),
        })
        .map(|(_, path, node)| (path, node))
}

/// Full resource ids look like `pkg:id/name`; a bare `name` matches too.
fn id_matches(view_id: &str, target: &str) -> bool {
    view_id == target || view_id.rsplit('/').next() == Some(target)
}

fn node_matches_fuzzy(node: &ScreenNode, target: &str) -> bool {
    node.label().is_some_and(|t| fuzzy_matches(t, target))
        || node.desc().is_some_and(|d| fuzzy_matches(d, target))
}

/// Substring either way, a shared significant token, or a shared 3-letter stem.
pub fn fuzzy_matches(candidate: &str, target: &str) -> bool {
    let candidate = candidate.trim().to_lowercase();
    let target = target.trim().to_lowercase();
    if candidate.is_empty() || target.is_empty() {
        return false;
    }
    if candidate.contains(&target) || target.contains(&candidate) {
        return true;
    }
    let candidate_tokens = tokens(&candidate);
    let target_tokens = tokens(&target);
    candidate_tokens.iter().any(|c| {
        target_tokens
            .iter()
            .any(|t| c == t || stem(c) == stem(t))
    })
}

/// Lower-cased alphanumeric runs longer than two characters.
fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
        .collect()
}

fn stem(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(STEM_LEN)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
