//! Owned copy of the host's UI tree, plus the flattened snapshot and hash derived from it.
//!
//! The host tree is transient and externally owned, so hosts copy out only the fields
//! matching needs into [`ScreenNode`] before any logic runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;

use crate::error::ExecError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenNode {
    pub text: Option<String>,
    pub description: Option<String>,
    pub view_id: Option<String>,
    pub class_name: String,
    pub bounds: Bounds,
    pub visible: bool,
    pub clickable: bool,
    pub scrollable: bool,
    pub editable: bool,
    pub focused: bool,
    pub children: Vec<ScreenNode>,
}

impl ScreenNode {
    /// Trimmed text, `None` when blank.
    pub fn label(&self) -> Option<&str> {
        non_blank(self.text.as_deref())
    }

    /// Trimmed accessible description, `None` when blank.
    pub fn desc(&self) -> Option<&str> {
        non_blank(self.description.as_deref())
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Child-index path from the root to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        let mut path = self.0.clone();
        path.pop();
        Some(Self(path))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

/// The visible UI tree of the foreground app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenTree {
    pub package: String,
    pub root: ScreenNode,
}

impl ScreenTree {
    pub fn node(&self, path: &NodePath) -> Option<&ScreenNode> {
        let mut node = &self.root;
        for &index in &path.0 {
            node = node.children.get(index)?;
        }
        Some(node)
    }

    /// Depth-first pre-order walk over nodes whose whole ancestor chain is visible.
    pub fn visible_nodes(&self) -> Vec<(usize, NodePath, &ScreenNode)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, NodePath::root(), &self.root)];
        while let Some((depth, path, node)) = stack.pop() {
            if !node.visible {
                continue;
            }
            for (i, child) in node.children.iter().enumerate().rev() {
                stack.push((depth + 1, path.child(i), child));
            }
            out.push((depth, path, node));
        }
        out
    }

    /// Breadth-first walk over visible nodes.
    pub fn visible_nodes_bfs(&self) -> Vec<(NodePath, &ScreenNode)> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(NodePath::root(), &self.root)]);
        while let Some((path, node)) = queue.pop_front() {
            if !node.visible {
                continue;
            }
            for (i, child) in node.children.iter().enumerate() {
                queue.push_back((path.child(i), child));
            }
            out.push((path, node));
        }
        out
    }

    /// The currently focused editable node, if any.
    pub fn focused_input(&self) -> Option<(NodePath, &ScreenNode)> {
        self.visible_nodes()
            .into_iter()
            .find(|(_, _, n)| n.focused && n.editable)
            .map(|(_, path, node)| (path, node))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub depth: usize,
    pub text: String,
    pub description: String,
}

/// Flattened textual view of the visible screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub package: String,
    pub lines: Vec<SnapshotLine>,
}

impl ScreenSnapshot {
    pub fn from_tree(tree: Option<&ScreenTree>) -> Self {
        let Some(tree) = tree else {
            return Self::default();
        };
        let lines = tree
            .visible_nodes()
            .into_iter()
            .filter_map(|(depth, _, node)| {
                let text = node.label().unwrap_or_default();
                let description = node.desc().unwrap_or_default();
                if text.is_empty() && description.is_empty() {
                    return None;
                }
                Some(SnapshotLine {
                    depth,
                    text: text.to_string(),
                    description: description.to_string(),
                })
            })
            .collect();
        Self {
            package: tree.package.clone(),
            lines,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// One line per node, indented by depth, description in brackets.
    pub fn to_text(&self) -> String {
        let mut out = format!("package: {}\n", self.package);
        for line in &self.lines {
            out.push_str(&"  ".repeat(line.depth));
            out.push_str(&line.text);
            if !line.description.is_empty() {
                if !line.text.is_empty() {
                    out.push(' ');
                }
                out.push('[');
                out.push_str(&line.description);
                out.push(']');
            }
            out.push('\n');
        }
        out
    }

    pub fn hash(&self, prefix_chars: usize) -> ScreenHash {
        ScreenHash::of(&self.to_text(), prefix_chars)
    }
}

/// Digest of a bounded prefix of snapshot text. Equality only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScreenHash([u8; 32]);

impl ScreenHash {
    pub fn of(text: &str, prefix_chars: usize) -> Self {
        let end = text
            .char_indices()
            .nth(prefix_chars)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        Self(Sha256::digest(&text.as_bytes()[..end]).into())
    }
}

impl fmt::Debug for ScreenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScreenHash({self})")
    }
}

impl fmt::Display for ScreenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalAction {
    Back,
    Home,
}

/// System settings pages reachable by a local shortcut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsPage {
    Main,
    Wifi,
    Bluetooth,
    Display,
    Sound,
}

/// An application the host can bring to the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchableApp {
    pub label: String,
    pub id: String,
}

/// The platform side: a live UI tree and the primitive operations on it.
///
/// Node paths are only valid against the tree returned by the latest `root()` call.
/// Calls arrive on the engine task; a host that blocks should wrap its work in
/// `tokio::task::block_in_place`.
pub trait ScreenHost: Send + Sync {
    /// Copy of the current visible tree; `None` when no window is active.
    fn root(&self) -> Option<ScreenTree>;

    fn click(&self, path: &NodePath) -> Result<(), ExecError>;

    fn scroll(&self, path: &NodePath, forward: bool) -> Result<(), ExecError>;

    /// Replace the text of an editable node.
    fn set_text(&self, path: &NodePath, text: &str) -> Result<(), ExecError>;

    fn global(&self, action: GlobalAction) -> Result<(), ExecError>;

    fn launchable_apps(&self) -> Vec<LaunchableApp>;

    fn launch(&self, app: &LaunchableApp) -> Result<(), ExecError>;

    fn open_settings(&self, page: SettingsPage) -> Result<(), ExecError>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn snapshot_skips_hidden_subtrees_and_blank_nodes() {
        let mut hidden = container("android.widget.LinearLayout", vec![node("Secret")]);
        hidden.visible = false;
        let t = tree(vec![node("Phone"), hidden, node("  "), node("Gallery")]);

        let snap = ScreenSnapshot::from_tree(Some(&t));
        let texts: Vec<_> = snap.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["Phone", "Gallery"]);
        assert!(snap.lines.iter().all(|l| l.depth == 1));
    }

    #[test]
    fn snapshot_text_shows_depth_and_description() {
        let mut icon = node("");
        icon.description = Some("Search".to_string());
        let t = tree(vec![container("x", vec![node("Inbox")]), icon]);
        let text = ScreenSnapshot::from_tree(Some(&t)).to_text();
        assert_eq!(text, "package: com.example.launcher\n    Inbox\n  [Search]\n");
    }

    #[test]
    fn missing_window_gives_empty_snapshot() {
        let snap = ScreenSnapshot::from_tree(None);
        assert!(snap.is_empty());
        assert_eq!(snap.hash(100), ScreenSnapshot::default().hash(100));
    }

    #[test]
    fn hash_only_sees_bounded_prefix() {
        let a = ScreenHash::of("abcdef-tail-one", 6);
        let b = ScreenHash::of("abcdef-tail-two", 6);
        let c = ScreenHash::of("abcdeX-tail-one", 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn paths_address_nodes() {
        let t = tree(vec![node("a"), container("x", vec![node("b")])]);
        let path = NodePath(vec![1, 0]);
        assert_eq!(t.node(&path).and_then(|n| n.label()), Some("b"));
        assert_eq!(path.to_string(), "/1/0");
        assert_eq!(path.parent(), Some(NodePath(vec![1])));
        assert!(t.node(&NodePath(vec![5])).is_none());
    }
}
