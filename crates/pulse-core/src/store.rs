// Run Store
// Persistence for run records and step logs. One directory per run with
// an atomically rewritten run.json and an append-only ndjson steps.log.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pulse_types::{HistoryItem, QueryGroup, Run, RunPatch, RunStatus, Step};

use crate::error::{PulseError, Result};

/// Persistence seam for runs and steps. Implementations must be safe to
/// share behind an `Arc` across the delivery task and request handlers.
pub trait RunStore: Send + Sync {
    fn create_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, run_id: &str) -> Result<Option<Run>>;
    /// Applies a partial update; false when the run does not exist
    fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<bool>;
    /// Appends a step, assigning and returning its per-run sequence id
    fn append_step(&self, step: &Step) -> Result<u64>;
    /// Steps in sequence order; `Some(n)` keeps only the most recent `n`
    fn list_steps(&self, run_id: &str, limit: Option<usize>) -> Result<Vec<Step>>;
    /// Most recently started run still in the running state, if any
    fn get_active_run(&self) -> Result<Option<Run>>;
    /// Runs newest-first, capped at `limit`
    fn list_history(&self, limit: usize) -> Result<Vec<HistoryItem>>;
    /// Query-directed runs clustered by query text, newest group first
    fn query_groups(&self, limit: usize) -> Result<Vec<QueryGroup>>;
    /// Removes the run and its step log; false when it did not exist
    fn delete_run(&self, run_id: &str) -> Result<bool>;
}

// ============================================================================
// JSON-file store
// ============================================================================

pub struct JsonRunStore {
    base_dir: PathBuf,
    /// Next step sequence per run, lazily recovered from the log on first use
    next_seq: Mutex<HashMap<String, u64>>,
}

impl JsonRunStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let base_dir = state_dir.join("runs");
        fs::create_dir_all(&base_dir)
            .map_err(|e| PulseError::IoError(format!("Failed to create runs directory: {}", e)))?;
        Ok(Self {
            base_dir,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    fn load_run(&self, run_id: &str) -> Result<Run> {
        let path = self.run_dir(run_id).join("run.json");
        let content = fs::read_to_string(&path)
            .map_err(|e| PulseError::IoError(format!("Failed to read run file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| PulseError::ParseError(format!("Failed to parse run file: {}", e)))
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.run_id);
        fs::create_dir_all(&dir)
            .map_err(|e| PulseError::IoError(format!("Failed to create run directory: {}", e)))?;

        let content = serde_json::to_string_pretty(run).map_err(|e| {
            PulseError::SerializationError(format!("Failed to serialize run: {}", e))
        })?;
        atomic_write(&dir.join("run.json"), &content)
    }

    fn recover_next_seq(&self, run_id: &str) -> Result<u64> {
        let steps = self.list_steps(run_id, None)?;
        Ok(steps.last().map(|s| s.seq + 1).unwrap_or(1))
    }

    fn all_runs(&self) -> Result<Vec<Run>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)
            .map_err(|e| PulseError::IoError(format!("Failed to read runs directory: {}", e)))?
        {
            let entry = entry
                .map_err(|e| PulseError::IoError(format!("Failed to read directory entry: {}", e)))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load_run(&run_id) {
                Ok(run) => runs.push(run),
                // A half-written or foreign directory is skipped, not fatal
                Err(_) => continue,
            }
        }
        Ok(runs)
    }
}

impl RunStore for JsonRunStore {
    fn create_run(&self, run: &Run) -> Result<()> {
        self.save_run(run)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        if !self.run_dir(run_id).join("run.json").exists() {
            return Ok(None);
        }
        self.load_run(run_id).map(Some)
    }

    fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<bool> {
        let Some(mut run) = self.get_run(run_id)? else {
            return Ok(false);
        };
        patch.apply(&mut run);
        self.save_run(&run)?;
        Ok(true)
    }

    fn append_step(&self, step: &Step) -> Result<u64> {
        let run_dir = self.run_dir(&step.run_id);
        fs::create_dir_all(&run_dir)
            .map_err(|e| PulseError::IoError(format!("Failed to create run directory: {}", e)))?;

        // The lock covers both seq assignment and the write: concurrent
        // appenders must land in the log in seq order.
        let mut guard = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        let seq = match guard.get(&step.run_id) {
            Some(next) => *next,
            None => self.recover_next_seq(&step.run_id)?,
        };

        let mut stamped = step.clone();
        stamped.seq = seq;

        let path = run_dir.join("steps.log");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PulseError::IoError(format!("Failed to open steps log: {}", e)))?;

        let line = serde_json::to_string(&stamped).map_err(|e| {
            PulseError::SerializationError(format!("Failed to serialize step: {}", e))
        })?;
        writeln!(file, "{}", line)
            .map_err(|e| PulseError::IoError(format!("Failed to write step: {}", e)))?;

        guard.insert(step.run_id.clone(), seq + 1);
        Ok(seq)
    }

    fn list_steps(&self, run_id: &str, limit: Option<usize>) -> Result<Vec<Step>> {
        let path = self.run_dir(run_id).join("steps.log");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| PulseError::IoError(format!("Failed to open steps log: {}", e)))?;
        let reader = BufReader::new(file);

        let mut steps = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| PulseError::IoError(format!("Failed to read steps log line: {}", e)))?;
            // A torn final line from a crash is skipped
            if let Ok(step) = serde_json::from_str(&line) {
                steps.push(step);
            }
        }
        if let Some(limit) = limit {
            if steps.len() > limit {
                steps.drain(..steps.len() - limit);
            }
        }
        Ok(steps)
    }

    fn get_active_run(&self) -> Result<Option<Run>> {
        let mut active: Vec<Run> = self
            .all_runs()?
            .into_iter()
            .filter(|run| run.status == RunStatus::Running)
            .collect();
        active.sort_by_key(|run| std::cmp::Reverse(started_millis(run)));
        Ok(active.into_iter().next())
    }

    fn list_history(&self, limit: usize) -> Result<Vec<HistoryItem>> {
        let mut runs = self.all_runs()?;
        runs.sort_by_key(|run| std::cmp::Reverse(started_millis(run)));
        Ok(runs.iter().take(limit).map(HistoryItem::from_run).collect())
    }

    fn query_groups(&self, limit: usize) -> Result<Vec<QueryGroup>> {
        let mut by_query: HashMap<String, Vec<Run>> = HashMap::new();
        for run in self.all_runs()? {
            let Some(query) = run.query.clone().filter(|q| !q.trim().is_empty()) else {
                continue;
            };
            by_query.entry(query).or_default().push(run);
        }

        let mut groups: Vec<QueryGroup> = by_query
            .into_iter()
            .map(|(query, mut runs)| {
                runs.sort_by_key(|run| std::cmp::Reverse(started_millis(run)));
                QueryGroup {
                    query,
                    run_count: runs.len(),
                    last_run_at: runs.first().and_then(|run| run.started_at),
                    runs: runs.iter().map(HistoryItem::from_run).collect(),
                }
            })
            .collect();
        groups.sort_by_key(|group| {
            std::cmp::Reverse(
                group
                    .last_run_at
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(i64::MIN),
            )
        });
        groups.truncate(limit);
        Ok(groups)
    }

    fn delete_run(&self, run_id: &str) -> Result<bool> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| PulseError::IoError(format!("Failed to delete run directory: {}", e)))?;
        let mut guard = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(run_id);
        Ok(true)
    }
}

/// Runs with no started_at sort oldest
fn started_millis(run: &Run) -> i64 {
    run.started_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN)
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| PulseError::IoError(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| PulseError::IoError(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
