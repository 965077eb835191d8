//! Per-pipeline stage counters and optional CSV export
//!
//! Every stage increments a shared [`PipelineMetrics`] as it emits. When an
//! export directory is configured, each pipeline opens one
//! `positional-<contig>-<direction>.csv` at start, appends a counter row per
//! emitted contig plus a final row, and closes the file on exhaustion or
//! failure. Export write failures are logged at debug level and disable
//! further export for the pipeline; they never fail assembly.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::evidence::BreakendDirection;
use crate::Pos;

/// Monotone per-stage counters for one pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub evidence_in: u64,
    pub evidence_filtered: u64,
    pub support_nodes: u64,
    pub aggregate_nodes: u64,
    pub path_nodes: u64,
    pub nodes_collapsed: u64,
    pub nodes_simplified: u64,
    pub contigs_emitted: u64,
    pub evidence_released: u64,
}

const HEADER: &str = "step,frontier,evidence_in,evidence_filtered,support_nodes,\
aggregate_nodes,path_nodes,nodes_collapsed,nodes_simplified,contigs_emitted,\
evidence_released";

/// CSV sink for one pipeline's counters. A failed open or write leaves the
/// tracker inert.
#[derive(Debug, Default)]
pub struct ExportTracker {
    file: Option<BufWriter<File>>,
    path: PathBuf,
}

impl ExportTracker {
    /// A tracker that writes nowhere (no export directory configured).
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the per-pipeline CSV inside `dir`.
    pub fn create(dir: &Path, contig_name: &str, direction: BreakendDirection) -> Self {
        let path = dir.join(format!("positional-{contig_name}-{direction}.csv"));
        let file = match File::create(&path) {
            Ok(f) => {
                let mut w = BufWriter::new(f);
                match writeln!(w, "{HEADER}") {
                    Ok(()) => Some(w),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "export header write failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "export open failed, continuing without export");
                None
            }
        };
        Self { file, path }
    }

    /// Append one counter row. `step` names the event (a contig emission or
    /// the final flush); `frontier` is the current input position.
    pub fn row(&mut self, step: &str, frontier: Pos, m: &PipelineMetrics) {
        let Some(w) = self.file.as_mut() else {
            return;
        };
        let res = writeln!(
            w,
            "{step},{frontier},{},{},{},{},{},{},{},{},{}",
            m.evidence_in,
            m.evidence_filtered,
            m.support_nodes,
            m.aggregate_nodes,
            m.path_nodes,
            m.nodes_collapsed,
            m.nodes_simplified,
            m.contigs_emitted,
            m.evidence_released,
        );
        if let Err(e) = res {
            debug!(path = %self.path.display(), error = %e, "export row write failed, disabling export");
            self.file = None;
        }
    }

    /// Write the final row and flush. Safe to call more than once.
    pub fn finish(&mut self, frontier: Pos, m: &PipelineMetrics) {
        self.row("final", frontier, m);
        if let Some(w) = self.file.as_mut() {
            if let Err(e) = w.flush() {
                debug!(path = %self.path.display(), error = %e, "export flush failed");
            }
            self.file = None;
        }
    }
}

impl Drop for ExportTracker {
    fn drop(&mut self) {
        // Scoped release on every exit path, success or failure.
        if let Some(w) = self.file.as_mut() {
            let _ = w.flush();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_is_inert() {
        let mut t = ExportTracker::disabled();
        t.row("contig", 10, &PipelineMetrics::default());
        t.finish(10, &PipelineMetrics::default());
    }

    #[test]
    fn rows_land_in_the_named_file() {
        let dir = std::env::temp_dir().join(format!("breva-export-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut t = ExportTracker::create(&dir, "chr2", BreakendDirection::Forward);
        let mut m = PipelineMetrics::default();
        m.support_nodes = 7;
        t.row("contig", 42, &m);
        t.finish(42, &m);

        let path = dir.join("positional-chr2-forward.csv");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,frontier"));
        assert!(lines[1].starts_with("contig,42,"));
        assert!(lines[2].starts_with("final,42,"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unwritable_directory_disables_export() {
        let dir = Path::new("/nonexistent-breva-export-dir");
        let mut t = ExportTracker::create(dir, "chr1", BreakendDirection::Backward);
        // no panic, no output
        t.row("contig", 1, &PipelineMetrics::default());
        t.finish(1, &PipelineMetrics::default());
    }
}
