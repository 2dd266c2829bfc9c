use std::collections::BTreeMap;

use crate::util::join_tree_path;

/// One step of a mapping-tree traversal.
///
/// `branch_path` is what remains of the query path at this level, i.e.
/// the path to send to the branches mounted here. `children` carries
/// the child component names for pseudo-directory synthesis, so both
/// listing passes can share a single traversal.
#[derive(Debug, Clone)]
pub(crate) struct Visit {
    pub tree_path: String,
    pub branch_path: Vec<String>,
    pub branches: Vec<(String, bool)>,
    pub children: Vec<String>,
}

/// An item in the mapping tree. Edges are single path components;
/// every node carries the ordered `(branch, writable)` overlay list
/// for its position in the namespace.
#[derive(Debug, Default)]
pub(crate) struct TreeItem {
    /// Children keyed by path component. The map keeps traversal
    /// name-sorted, which makes recursive operations deterministic.
    children: BTreeMap<String, TreeItem>,
    /// Branches mounted at this level, in insertion order. The order
    /// decides read overlay priority; duplicates are allowed.
    branches: Vec<(String, bool)>,
}

impl TreeItem {
    /// Add a mapping for the given (already split) path, creating
    /// intermediate items as needed.
    pub fn add_mapping(&mut self, mapping_path: &[String], branch: &str, writable: bool) {
        match mapping_path.split_first() {
            Some((child, rest)) => {
                self.children
                    .entry(child.clone())
                    .or_default()
                    .add_mapping(rest, branch, writable);
            }
            None => {
                // Keep the order in which branches were added
                self.branches.push((branch.to_string(), writable));
            }
        }
    }

    /// Collect all relevant visits for a query path.
    ///
    /// The current item is always visited first with the full
    /// remaining path. If a child matches the next component, the walk
    /// descends with the shortened path; at the leaf a recursive walk
    /// fans out over every descendant. Callers start with a tree path
    /// of `"/"`.
    pub fn find_path_branches(
        &self,
        tree_path: &str,
        branch_path: &[String],
        recursive: bool,
        visits: &mut Vec<Visit>,
    ) {
        visits.push(Visit {
            tree_path: tree_path.to_string(),
            branch_path: branch_path.to_vec(),
            branches: self.branches.clone(),
            children: self.children.keys().cloned().collect(),
        });

        if let Some((first, rest)) = branch_path.split_first() {
            if let Some(child) = self.children.get(first) {
                child.find_path_branches(
                    &join_tree_path(tree_path, first),
                    rest,
                    recursive,
                    visits,
                );
            }
        } else if recursive {
            for (name, child) in &self.children {
                child.find_path_branches(
                    &join_tree_path(tree_path, name),
                    branch_path,
                    recursive,
                    visits,
                );
            }
        }
    }

    /// Render this item and its children, one level per line.
    pub fn render(&self, indent: usize, out: &mut String) {
        for (i, (branch, writable)) in self.branches.iter().enumerate() {
            out.push_str(branch);
            out.push_str(if *writable { "(w)" } else { "(r)" });
            if i < self.branches.len() - 1 {
                out.push_str(", ");
            }
        }
        out.push('\n');

        for (name, child) in &self.children {
            out.push_str(&" ".repeat(indent * 2));
            out.push_str(name);
            out.push_str("/: ");
            child.render(indent + 1, out);
        }
    }
}
