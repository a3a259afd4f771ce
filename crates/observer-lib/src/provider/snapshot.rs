//! Point-in-time process table
//!
//! Built once per cycle before resolution fans out, then only read. Lets the
//! resolver and the tree walker look up names and children without touching
//! the OS once per entity.

use crate::models::ChildProcessInfo;
use crate::tree::ChildProcessSource;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One process in the snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct ProcessSnapshot {
    entries: HashMap<u32, ProcessEntry>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = ProcessEntry>) -> Self {
        let entries: HashMap<u32, ProcessEntry> =
            entries.into_iter().map(|e| (e.pid, e)).collect();

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in entries.values() {
            if entry.ppid != entry.pid {
                children.entry(entry.ppid).or_default().push(entry.pid);
            }
        }
        for pids in children.values_mut() {
            pids.sort_unstable();
        }

        Self { entries, children }
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessEntry> {
        self.entries.get(&pid)
    }

    pub fn name(&self, pid: u32) -> Option<&str> {
        self.entries.get(&pid).map(|e| e.name.as_str())
    }

    pub fn start_time(&self, pid: u32) -> Option<DateTime<Utc>> {
        self.entries.get(&pid).and_then(|e| e.start_time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChildProcessSource for ProcessSnapshot {
    fn children_of(&self, pid: u32) -> std::io::Result<Vec<ChildProcessInfo>> {
        let Some(pids) = self.children.get(&pid) else {
            return Ok(Vec::new());
        };
        Ok(pids
            .iter()
            .filter_map(|child| self.entries.get(child))
            .map(|e| ChildProcessInfo {
                name: e.name.clone(),
                pid: e.pid,
                start_time: e.start_time,
            })
            .collect())
    }
}
