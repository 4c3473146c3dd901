use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn run_log_path(logs_dir: &Path, job_id: &str) -> PathBuf {
    logs_dir.join(format!("job-{job_id}.log"))
}

/// Appends one timestamped line to a job's local run log. The run log is a
/// best-effort local record; callers decide whether a write failure matters.
pub fn append_run_log_line(logs_dir: &Path, job_id: &str, line: &str) -> std::io::Result<()> {
    let path = run_log_path(logs_dir, job_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    writeln!(file, "{stamp} {line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_timestamped_lines_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        append_run_log_line(dir.path(), "j1", "first").expect("append");
        append_run_log_line(dir.path(), "j1", "second").expect("append");

        let raw = fs::read_to_string(run_log_path(dir.path(), "j1")).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }
}
