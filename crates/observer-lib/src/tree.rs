//! Bounded descendant discovery
//!
//! Level-order walk from a root pid, capped by depth and by the number of
//! descendants returned.

use crate::models::ChildProcessInfo;
use std::collections::{HashSet, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deepest level returned (direct children are level 1)
pub const MAX_DEPTH: usize = 5;

/// Most descendants returned for one root
pub const MAX_DESCENDANTS: usize = 50;

/// Helper processes spawned by the observer itself
pub const DEFAULT_EXCLUDED_NAMES: &[&str] = &["ps", "conhost", "elevated_proc_fd"];

/// Anything that can list the direct children of a pid
pub trait ChildProcessSource: Send + Sync {
    fn children_of(&self, pid: u32) -> std::io::Result<Vec<ChildProcessInfo>>;
}

pub struct ProcessTreeWalker<'a, S: ChildProcessSource + ?Sized> {
    source: &'a S,
    max_depth: usize,
    max_descendants: usize,
    excluded: Vec<String>,
}

impl<'a, S: ChildProcessSource + ?Sized> ProcessTreeWalker<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            max_depth: MAX_DEPTH,
            max_descendants: MAX_DESCENDANTS,
            excluded: DEFAULT_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the excluded process names
    pub fn with_excluded(mut self, names: &[String]) -> Self {
        self.excluded = names.to_vec();
        self
    }

    pub fn with_limits(mut self, max_depth: usize, max_descendants: usize) -> Self {
        self.max_depth = max_depth;
        self.max_descendants = max_descendants;
        self
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|e| e.eq_ignore_ascii_case(name))
    }

    /// Descendants of `root` in level order.
    ///
    /// An unknown root or a root without children gives an empty list. A
    /// failing lookup skips that branch only.
    pub fn descendants(&self, root: u32, cancel: &CancellationToken) -> Vec<ChildProcessInfo> {
        let mut found = Vec::new();
        if root == 0 || self.max_descendants == 0 {
            return found;
        }

        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((pid, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                break;
            }
            if depth >= self.max_depth {
                continue;
            }

            let children = match self.source.children_of(pid) {
                Ok(children) => children,
                Err(e) => {
                    debug!(pid, error = %e, "Skipping process subtree");
                    continue;
                }
            };

            for child in children {
                if self.is_excluded(&child.name) || !seen.insert(child.pid) {
                    continue;
                }
                queue.push_back((child.pid, depth + 1));
                found.push(child);

                if found.len() >= self.max_descendants {
                    return found;
                }
            }
        }

        found
    }
}
