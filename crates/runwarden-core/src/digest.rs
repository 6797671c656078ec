use crate::constants::{dirs, files, keywords, rc_codes};
use crate::errors::DomainError;
use crate::rc::read_rc;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const BANNER_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub execution_path: PathBuf,
    /// `None` when the step never wrote a return code.
    pub exit_code: Option<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDigest {
    pub entries: Vec<DigestEntry>,
}

impl ErrorDigest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ErrorDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "Failed step: {} (rc={})",
                entry.execution_path.display(),
                entry.exit_code.as_deref().unwrap_or("unknown")
            )?;
            write!(f, "{}", entry.excerpt)?;
            if !entry.excerpt.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Collects the stderr of every failed step under a run's execution tree.
#[derive(Debug, Clone)]
pub struct ErrorDigestExtractor {
    /// Files shorter than this are included whole.
    pub max_file_lines: usize,
    pub window: usize,
    pub success_codes: Vec<String>,
}

impl Default for ErrorDigestExtractor {
    fn default() -> Self {
        Self {
            max_file_lines: 300,
            window: 100,
            success_codes: vec![rc_codes::SUCCESS.to_string()],
        }
    }
}

impl ErrorDigestExtractor {
    pub fn extract(&self, run_dir: &Path) -> ErrorDigest {
        let mut entries = Vec::new();
        for step_dir in step_dirs(run_dir) {
            let attempts = step_attempts(&step_dir);
            let codes: Vec<Option<String>> = attempts
                .iter()
                .map(|(_, dir)| read_rc(dir).ok().flatten())
                .collect();

            let succeeded = codes
                .iter()
                .flatten()
                .any(|code| self.success_codes.iter().any(|ok| ok == code));
            if succeeded {
                continue;
            }

            let Some(((_, last_dir), last_code)) = attempts.iter().zip(codes).last() else {
                continue;
            };
            entries.push(DigestEntry {
                execution_path: last_dir.clone(),
                exit_code: last_code,
                excerpt: self.stderr_excerpt(last_dir),
            });
        }
        ErrorDigest { entries }
    }

    fn stderr_excerpt(&self, execution_dir: &Path) -> String {
        [files::STDERR, files::STDERR_BACKGROUND]
            .iter()
            .map(|name| execution_dir.join(name))
            .find(|p| p.exists())
            .map(|p| excerpt_file(&p, self.max_file_lines, self.window))
            .unwrap_or_else(|| {
                format!(
                    "unable to find error files in {}\n",
                    execution_dir.display()
                )
            })
    }
}

/// Directories that own an `execution` subdirectory, excluding the
/// engine's own `attempt-N` retry directories.
fn step_dirs(run_dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(run_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| {
            !e.file_name()
                .to_string_lossy()
                .starts_with(dirs::ENGINE_ATTEMPT_PREFIX)
        })
        .map(|e| e.into_path())
        .filter(|p| p.join(dirs::EXECUTION).is_dir())
        .collect();
    found.sort();
    found
}

/// `(attempt number, execution dir)` pairs ordered by attempt.
fn step_attempts(step_dir: &Path) -> Vec<(u32, PathBuf)> {
    let mut attempts = vec![(1, step_dir.join(dirs::EXECUTION))];
    if let Ok(read) = std::fs::read_dir(step_dir) {
        for entry in read.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(num) = name.strip_prefix(dirs::ENGINE_ATTEMPT_PREFIX) else {
                continue;
            };
            let Ok(num) = num.parse::<u32>() else {
                continue;
            };
            let execution = entry.path().join(dirs::EXECUTION);
            if execution.is_dir() {
                attempts.push((num, execution));
            }
        }
    }
    attempts.sort_by_key(|(n, _)| *n);
    attempts
}

fn banner(path: &Path) -> String {
    let rule = "-".repeat(BANNER_WIDTH);
    format!("{}\n{}\n{}\n", rule, path.display(), rule)
}

/// Returns the whole file when it is short, otherwise a window of lines
/// around every line containing an error keyword, each between banners. With
/// no keyword hits the last `window` lines are returned.
pub fn excerpt_file(path: &Path, max_file_lines: usize, window: usize) -> String {
    match stream_excerpt(path, max_file_lines, window) {
        Ok(excerpt) => excerpt,
        Err(e) => format!("unable to read {}: {}\n", path.display(), e),
    }
}

/// Two passes over the file so that only the excerpt is held in memory.
fn stream_excerpt(path: &Path, max_file_lines: usize, window: usize) -> io::Result<String> {
    let half = window / 2;
    let mut head: Vec<String> = Vec::new();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(window);
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut line_count = 0;

    for_each_line(path, |idx, line| {
        line_count = idx + 1;
        let lower = line.to_lowercase();
        if keywords::ERROR.iter().any(|k| lower.contains(k)) {
            let start = idx.saturating_sub(half);
            let end = idx + half + 1;
            match ranges.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => ranges.push((start, end)),
            }
        }
        if idx < max_file_lines {
            head.push(line.clone());
        }
        if window > 0 {
            if tail.len() == window {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })?;

    let mut out = String::new();
    if line_count < max_file_lines {
        push_lines(&mut out, head.iter());
        return Ok(out);
    }

    let banner = banner(path);
    if ranges.is_empty() {
        out.push_str(&banner);
        push_lines(&mut out, tail.iter());
        return Ok(out);
    }

    let mut ranges = ranges.into_iter().peekable();
    let mut open = false;
    for_each_line(path, |idx, line| {
        while let Some(&(start, end)) = ranges.peek() {
            if idx >= end {
                if open {
                    out.push_str(&banner);
                    open = false;
                }
                ranges.next();
                continue;
            }
            if idx >= start {
                if !open {
                    out.push_str(&banner);
                    open = true;
                }
                out.push_str(&line);
                out.push('\n');
            }
            break;
        }
    })?;
    if open {
        out.push_str(&banner);
    }
    Ok(out)
}

/// Feeds each line, without its terminator, to `f`. Invalid UTF-8 is replaced.
fn for_each_line(path: &Path, mut f: impl FnMut(usize, String)) -> io::Result<()> {
    let mut reader = BufReader::new(fs_err::File::open(path)?);
    let mut buf = Vec::new();
    let mut idx = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        f(idx, String::from_utf8_lossy(&buf).into_owned());
        idx += 1;
    }
}

fn push_lines<'a>(out: &mut String, lines: impl Iterator<Item = &'a String>) {
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
}

/// Locates `<execution_root>/<workflow name>/<run_id>`.
pub fn find_run_dir(execution_root: &Path, run_id: &str) -> Result<PathBuf, DomainError> {
    let not_found = || DomainError::RunDirNotFound {
        run_id: run_id.to_string(),
        root: execution_root.to_path_buf(),
    };
    let read = std::fs::read_dir(execution_root).map_err(|_| not_found())?;
    let mut candidates: Vec<PathBuf> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path().join(run_id))
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort();
    candidates.into_iter().next().ok_or_else(not_found)
}
