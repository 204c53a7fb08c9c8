//! Progress memory (design §4.7/§4.11.2): `progress.md` at the work-dir
//! root, holding a "Codebase Patterns" section the prompt builder reads
//! from, and a bounded, append-only iteration log pruned to keep the file
//! from growing without bound.
//!
//! Grounded in the teacher's `harness::progress::ProgressTracker`
//! (append-only log file, read-all/read-last, log-line parsing) adapted
//! from its flat line-per-event format to design §4.11.2's markdown
//! document with a distinct patterns section, and with a size-based prune
//! step (the teacher's tracker never prunes; design calls for one) that
//! archives the overflow to `.ralph/archive/` rather than discarding it.

use crate::error::RalphResult;
use chrono::Utc;

const PATTERNS_HEADER: &str = "## Codebase Patterns";
const LOG_HEADER: &str = "## Iteration Log";

pub struct ProgressMemory {
    path: std::path::PathBuf,
    archive_dir: std::path::PathBuf,
    /// Minimum number of most-recent log lines to always keep.
    min_recent_lines: usize,
    /// Prune when the log section exceeds this many lines.
    max_log_lines: usize,
}

impl ProgressMemory {
    pub fn new(
        path: impl Into<std::path::PathBuf>,
        archive_dir: impl Into<std::path::PathBuf>,
        min_recent_lines: usize,
        max_log_lines: usize,
    ) -> Self {
        Self {
            path: path.into(),
            archive_dir: archive_dir.into(),
            min_recent_lines,
            max_log_lines,
        }
    }

    fn read(&self) -> RalphResult<String> {
        if !self.path.exists() {
            return Ok(format!("{PATTERNS_HEADER}\n\n{LOG_HEADER}\n\n"));
        }
        Ok(std::fs::read_to_string(&self.path)?)
    }

    /// Extract the raw text of the "Codebase Patterns" section (between its
    /// header and the next `##` header or end of file).
    pub fn codebase_patterns(&self) -> RalphResult<String> {
        let content = self.read()?;
        Ok(extract_section(&content, PATTERNS_HEADER))
    }

    fn log_lines(&self, content: &str) -> Vec<String> {
        extract_section(content, LOG_HEADER)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Append one line to the iteration log, then prune if the log has
    /// grown past `max_log_lines`, archiving the pruned lines.
    pub fn append_iteration(&self, summary: &str) -> RalphResult<()> {
        let content = self.read()?;
        let patterns = extract_section(&content, PATTERNS_HEADER);
        let mut lines = self.log_lines(&content);

        let stamp = Utc::now().to_rfc3339();
        lines.push(format!("- [{stamp}] {summary}"));

        if self.max_log_lines > 0 && lines.len() > self.max_log_lines {
            let keep_from = lines.len().saturating_sub(self.min_recent_lines.max(1));
            let overflow = lines[..keep_from].join("\n");
            self.archive(&overflow)?;
            lines = lines[keep_from..].to_vec();
        }

        let rebuilt = format!(
            "{PATTERNS_HEADER}\n\n{}\n\n{LOG_HEADER}\n\n{}\n",
            patterns.trim(),
            lines.join("\n")
        );
        std::fs::write(&self.path, rebuilt)?;
        Ok(())
    }

    fn archive(&self, overflow: &str) -> RalphResult<()> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let archive_path = self.archive_dir.join(format!("progress-{stamp}.md"));
        std::fs::write(archive_path, overflow)?;
        Ok(())
    }
}

/// Return the text between `header` and the next `##` header (or EOF),
/// trimmed of its own leading/trailing blank lines.
fn extract_section(content: &str, header: &str) -> String {
    let Some(start) = content.find(header) else {
        return String::new();
    };
    let after_header = &content[start + header.len()..];
    let end = after_header
        .match_indices("\n##")
        .next()
        .map(|(idx, _)| idx)
        .unwrap_or(after_header.len());
    after_header[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_returns_empty_patterns_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let mem = ProgressMemory::new(dir.path().join("progress.md"), dir.path().join("archive"), 5, 20);
        assert_eq!(mem.codebase_patterns().unwrap(), "");
    }

    #[test]
    fn append_creates_file_with_both_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mem = ProgressMemory::new(dir.path().join("progress.md"), dir.path().join("archive"), 5, 20);
        mem.append_iteration("did a thing").unwrap();
        let content = std::fs::read_to_string(dir.path().join("progress.md")).unwrap();
        assert!(content.contains(PATTERNS_HEADER));
        assert!(content.contains(LOG_HEADER));
        assert!(content.contains("did a thing"));
    }

    #[test]
    fn patterns_section_survives_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.md");
        std::fs::write(&path, format!("{PATTERNS_HEADER}\n\nUse thiserror for errors.\n\n{LOG_HEADER}\n\n")).unwrap();

        let mem = ProgressMemory::new(&path, dir.path().join("archive"), 5, 20);
        mem.append_iteration("iteration one").unwrap();
        mem.append_iteration("iteration two").unwrap();

        assert_eq!(mem.codebase_patterns().unwrap(), "Use thiserror for errors.");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("iteration one"));
        assert!(content.contains("iteration two"));
    }

    #[test]
    fn log_is_pruned_and_archived_past_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.md");
        let archive_dir = dir.path().join("archive");
        let mem = ProgressMemory::new(&path, &archive_dir, 2, 5);

        for i in 0..8 {
            mem.append_iteration(&format!("entry {i}")).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let log_section = extract_section(&content, LOG_HEADER);
        let remaining: Vec<&str> = log_section.lines().filter(|l| !l.trim().is_empty()).collect();
        assert!(remaining.len() <= 5);
        assert!(content.contains("entry 7"), "most recent entry must survive pruning");

        let archived = std::fs::read_dir(&archive_dir).unwrap().count();
        assert!(archived > 0, "overflow should be archived, not discarded");
    }
}
