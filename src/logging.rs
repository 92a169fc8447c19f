// =============================================================================
// Logging — env-filtered structured logs, mirrored to a rotation-free file
// =============================================================================
//
// Every component logs through `tracing` rather than ad-hoc stdout writes.
// In addition to the usual stdout subscriber, operator-relevant lines are
// duplicated to a plain append-only file so `/v1/debug/logs` has something
// to tail without reaching back into the process's own stdout. No rotation
// is implemented — the corpus this was grounded on has no log-rotation
// crate in its dependency tree, and a fresh deployment restarts rarely
// enough that unbounded growth is an operational concern, not a design one.
// =============================================================================

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A `MakeWriter` that appends every formatted line to a single file handle
/// behind a mutex. `tracing-subscriber` calls `make_writer` per event batch,
/// so the handle is reopened lazily rather than held across the whole
/// process lifetime — simplest thing that can't go stale if the file is
/// rotated out from under us by an external tool.
#[derive(Clone)]
struct AppendFile {
    path: PathBuf,
}

struct AppendFileGuard(std::fs::File);

impl io::Write for AppendFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for AppendFile {
    type Writer = AppendFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .unwrap_or_else(|_| {
                // Fall back to /dev/null-equivalent: a file opened in the
                // current directory under a fixed name, so a missing log
                // directory never takes the whole process down.
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open("edge-gate-fallback.log")
                    .expect("failed to open even the fallback log file")
            });
        AppendFileGuard(file)
    }
}

/// Initialise the global tracing subscriber: stdout at the env-filtered
/// level, plus a plain-text mirror to `log_path` so `/v1/debug/logs` can
/// tail real content. Must be called exactly once, before any subsystem
/// starts logging.
pub fn init(log_path: impl AsRef<Path>) {
    let log_path = log_path.as_ref().to_path_buf();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(AppendFile { path: log_path })
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

/// Tail the last `lines` lines of the log file at `path`, capped at 500.
/// Returns `(exists, total_lines, tail)`. A missing file is not an error —
/// it just means nothing has been logged to disk yet (or the path is wrong),
/// which the caller reports rather than fails on.
pub fn tail(path: impl AsRef<Path>, lines: usize) -> (bool, usize, Vec<String>) {
    let path = path.as_ref();
    let capped = lines.min(500).max(1);

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return (false, 0, Vec::new()),
    };

    let all: Vec<&str> = content.lines().collect();
    let total = all.len();
    let start = total.saturating_sub(capped);
    let tail = all[start..].iter().map(|s| s.to_string()).collect();
    (true, total, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_missing_file_reports_absent() {
        let (exists, total, lines) = tail("/tmp/edge-gate-core-definitely-missing.log", 10);
        assert!(!exists);
        assert_eq!(total, 0);
        assert!(lines.is_empty());
    }

    #[test]
    fn tail_returns_last_n_lines_and_total_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.log");
        let body = (1..=20).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        std::fs::write(&path, body).unwrap();

        let (exists, total, tail_lines) = tail(&path, 5);
        assert!(exists);
        assert_eq!(total, 20);
        assert_eq!(tail_lines, vec!["line 16", "line 17", "line 18", "line 19", "line 20"]);
    }

    #[test]
    fn tail_caps_requested_lines_at_500() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.log");
        let body = (1..=600).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        std::fs::write(&path, body).unwrap();

        let (exists, total, tail_lines) = tail(&path, 10_000);
        assert!(exists);
        assert_eq!(total, 600);
        assert_eq!(tail_lines.len(), 500);
        assert_eq!(tail_lines[0], "line 101");
    }
}
