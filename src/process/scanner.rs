//! Process and thread discovery under a proc root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A numeric directory under the proc root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub proc_path: PathBuf,
}

fn numeric_name(path: &Path) -> Option<u32> {
    let name = path.file_name().and_then(|s| s.to_str())?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Lists every numeric PID directory under `root`.
///
/// Failing to read `root` itself is an error; entries that vanish while the
/// directory is walked are skipped.
pub fn collect_proc_entries(root: &Path) -> io::Result<Vec<ProcEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root)?.flatten() {
        let p = entry.path();
        let pid = match numeric_name(&p) {
            Some(v) => v,
            None => continue,
        };
        out.push(ProcEntry { pid, proc_path: p });
    }
    Ok(out)
}

/// Lists the thread ids in `<proc_path>/task`.
pub fn read_thread_ids(proc_path: &Path) -> io::Result<Vec<u32>> {
    let mut tids: Vec<u32> = fs::read_dir(proc_path.join("task"))?
        .flatten()
        .filter_map(|entry| numeric_name(&entry.path()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}
