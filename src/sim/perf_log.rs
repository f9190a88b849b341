use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, warn};
use serde::Serialize;

use crate::stats::cycle::CycleSnapshot;

#[derive(Debug, Serialize)]
struct WindowRecord<'a> {
    window: u64,
    first_cycle: u64,
    last_cycle: u64,
    snapshots: &'a [CycleSnapshot],
}

/// Streams closed snapshot windows to a JSONL file, one window per line.
pub struct CycleTrace {
    path: PathBuf,
    writer: BufWriter<File>,
    windows: u64,
}

impl CycleTrace {
    pub fn create(path: &Path) -> Result<Self, anyhow::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("cannot create cycle trace {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            windows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn windows_written(&self) -> u64 {
        self.windows
    }

    pub fn write_window(&mut self, snapshots: &[CycleSnapshot]) {
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return;
        };
        let record = WindowRecord {
            window: self.windows,
            first_cycle: first.cycle,
            last_cycle: last.cycle,
            snapshots,
        };
        match serde_json::to_string(&record) {
            Ok(payload) => {
                if let Err(err) = writeln!(self.writer, "{payload}") {
                    warn!("{}: {}", self.path.display(), err);
                    return;
                }
                self.windows += 1;
            }
            Err(err) => warn!("cannot serialize window {}: {}", self.windows, err),
        }
    }

    pub fn flush(&mut self) {
        match self.writer.flush() {
            Ok(()) => debug!("{} windows traced to {}", self.windows, self.path.display()),
            Err(err) => warn!("{}: {}", self.path.display(), err),
        }
    }
}

impl Drop for CycleTrace {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::types::StallCause;

    #[test]
    fn writes_one_line_per_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace/cycles.jsonl");
        let mut trace = CycleTrace::create(&path).expect("create");

        let window: Vec<CycleSnapshot> = (0..3)
            .map(|c| CycleSnapshot {
                stall_cause: if c == 1 { StallCause::RawHazard } else { StallCause::None },
                ..CycleSnapshot::new(c)
            })
            .collect();
        trace.write_window(&window);
        trace.write_window(&[]);
        trace.write_window(&window[2..]);
        trace.flush();
        assert_eq!(2, trace.windows_written());

        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(2, lines.len());
        assert_eq!(0, lines[0]["first_cycle"]);
        assert_eq!(2, lines[0]["last_cycle"]);
        assert_eq!("raw_hazard", lines[0]["snapshots"][1]["stall_cause"]);
        assert_eq!(1, lines[1]["window"]);
    }
}
