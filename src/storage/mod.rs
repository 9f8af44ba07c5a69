//! File-based persistence for engine state
//!
//! Everything the engine must survive a restart with lives under
//! `.ralph-engine/` in the project root:
//! - `plans/` - plan records (plan + tasks + assignments)
//! - `loops/` - iterative loop state
//! - `events/` - per-scope JSONL transition logs, replayable after restart
//!
//! Writes are atomic (temp file + rename) and a transition is only reported
//! to observers after its save has returned Ok.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::events::EngineEvent;
use crate::models::{Plan, Task, TaskAssignment};
use crate::ralph_loop::RalphLoopState;

/// Get the .ralph-engine directory for a project
pub fn get_engine_dir(project_path: &Path) -> PathBuf {
    project_path.join(".ralph-engine")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {:?}", path))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    // Write to temp file
    fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write temp file {:?}", temp_path))?;

    // Atomic rename
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read file {:?}", path))?;

    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON from {:?}", path))
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;

    atomic_write(path, &content)
}

/// Durable snapshot of one plan: the plan itself, its immutable task list,
/// and the latest assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub plan: Plan,
    pub tasks: Vec<Task>,
    pub assignments: Vec<TaskAssignment>,
}

/// Store for plan records under `plans/<id>.json`
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", plan_id))
    }

    pub fn save(&self, record: &PlanRecord) -> Result<()> {
        write_json(&self.record_path(&record.plan.id), record)
    }

    pub fn load(&self, plan_id: &str) -> Result<PlanRecord> {
        read_json(&self.record_path(plan_id))
    }

    pub fn exists(&self, plan_id: &str) -> bool {
        self.record_path(plan_id).exists()
    }

    /// List all stored plan ids
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory {:?}", self.dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a plan record. Deleting a missing record is a no-op.
    pub fn delete(&self, plan_id: &str) -> Result<()> {
        let path = self.record_path(plan_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete plan record {:?}", path))?;
        }
        Ok(())
    }
}

/// Store for iterative loop state under `loops/<id>.json`
#[derive(Debug, Clone)]
pub struct LoopStore {
    dir: PathBuf,
}

impl LoopStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, loop_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", loop_id))
    }

    pub fn save(&self, state: &RalphLoopState) -> Result<()> {
        write_json(&self.record_path(&state.id), state)
    }

    pub fn load(&self, loop_id: &str) -> Result<RalphLoopState> {
        read_json(&self.record_path(loop_id))
    }

    pub fn delete(&self, loop_id: &str) -> Result<()> {
        let path = self.record_path(loop_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete loop record {:?}", path))?;
        }
        Ok(())
    }
}

/// Append-only JSONL log of state transitions, one file per scope (plan or
/// loop id). Replayable so observers can reconstruct state after a restart.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn log_path(&self, scope_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", scope_id))
    }

    /// Append one event. The file is locked exclusively for the write so
    /// concurrent processes never interleave partial lines.
    pub fn append(&self, scope_id: &str, event: &EngineEvent) -> Result<()> {
        ensure_dir(&self.dir)?;
        let line = serde_json::to_string(event).context("Failed to serialize event")?;

        let path = self.log_path(scope_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {:?}", path))?;

        fs2::FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock event log {:?}", path))?;
        let write_result = writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to event log {:?}", path));
        let _ = fs2::FileExt::unlock(&file);
        write_result?;

        Ok(())
    }

    /// Read back all persisted events for a scope, in emission order.
    /// Lines that fail to parse are skipped with a warning.
    pub fn replay(&self, scope_id: &str) -> Result<Vec<EngineEvent>> {
        let path = self.log_path(scope_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open event log {:?}", path))?;
        fs2::FileExt::lock_shared(&file)
            .with_context(|| format!("Failed to lock event log {:?}", path))?;

        let reader = BufReader::new(&file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read event log {:?}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EngineEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => log::warn!("[Storage] Skipping unparseable event line: {}", e),
            }
        }
        let _ = fs2::FileExt::unlock(&file);

        Ok(events)
    }

    /// Remove the log for a scope. Missing logs are a no-op.
    pub fn delete(&self, scope_id: &str) -> Result<()> {
        let path = self.log_path(scope_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete event log {:?}", path))?;
        }
        Ok(())
    }
}

/// All stores rooted under one project's `.ralph-engine/` directory.
#[derive(Debug, Clone)]
pub struct Storage {
    pub plans: PlanStore,
    pub loops: LoopStore,
    pub events: EventLog,
    root: PathBuf,
}

impl Storage {
    /// Initialize the storage directories for a project, including a
    /// .gitignore for runtime-only state.
    pub fn init(project_path: &Path) -> Result<Self> {
        let root = get_engine_dir(project_path);
        ensure_dir(&root)?;
        ensure_dir(&root.join("plans"))?;
        ensure_dir(&root.join("loops"))?;
        ensure_dir(&root.join("events"))?;

        let gitignore_path = root.join(".gitignore");
        if !gitignore_path.exists() {
            let gitignore_content = r#"# Runtime files (not for sharing)
*.tmp
events/
worktrees/
"#;
            fs::write(&gitignore_path, gitignore_content)
                .context("Failed to write .gitignore")?;
        }

        Ok(Self {
            plans: PlanStore::new(root.join("plans")),
            loops: LoopStore::new(root.join("loops")),
            events: EventLog::new(root.join("events")),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default worktree base directory for this project.
    pub fn worktree_base(&self) -> PathBuf {
        self.root.join("worktrees")
    }
}
