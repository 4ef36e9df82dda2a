use crate::types::{Pid, ProcessSnapshot};
use std::collections::{HashMap, HashSet};

/// Descendants of `root` grouped by depth: `levels[0]` holds the direct
/// children, `levels[1]` the grandchildren and so on. Built from one
/// snapshot's parent-PID relation; cycles in a corrupt table are cut.
pub fn descendant_levels(table: &[ProcessSnapshot], root: Pid) -> Vec<Vec<Pid>> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for snap in table {
        if let Some(ppid) = snap.ppid
            && ppid != snap.pid
        {
            children.entry(ppid).or_default().push(snap.pid);
        }
    }
    for kids in children.values_mut() {
        kids.sort_unstable();
    }

    let mut visited = HashSet::from([root]);
    let mut levels = Vec::new();
    let mut frontier = vec![root];
    while !frontier.is_empty() {
        let next: Vec<Pid> = frontier
            .iter()
            .filter_map(|pid| children.get(pid))
            .flatten()
            .copied()
            .filter(|pid| visited.insert(*pid))
            .collect();
        if next.is_empty() {
            break;
        }
        levels.push(next.clone());
        frontier = next;
    }
    levels
}
