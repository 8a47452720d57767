// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cached workspace file reads and system prompt composition.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use helm_core::estimate_tokens;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Well-known bootstrap file names.
pub mod files {
    /// Operating rules.
    pub const OPERATING_RULES: &str = "AGENTS.md";
    /// Default persona.
    pub const DEFAULT_PERSONA: &str = "SOUL.md";
    /// Per-role persona directory.
    pub const PERSONA_DIR: &str = "souls";
    /// Identity sheet.
    pub const IDENTITY: &str = "IDENTITY.md";
    /// Tool notes.
    pub const TOOLS: &str = "TOOLS.md";
    /// Heartbeat instructions.
    pub const HEARTBEAT: &str = "HEARTBEAT.md";
    /// User profile.
    pub const USER_PROFILE: &str = "USER.md";
    /// Boot instructions.
    pub const BOOT: &str = "BOOT.md";
    /// Marker written once boot has completed.
    pub const BOOT_MARKER: &str = ".boot-complete";
    /// Curated long-term memory.
    pub const MEMORY: &str = "MEMORY.md";
    /// Dated memory directory.
    pub const MEMORY_DIR: &str = "memory";
    /// Skill folders.
    pub const SKILLS_DIR: &str = "skills";
}

/// One cached file read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedFile {
    /// Content, truncated at the configured limit.
    pub content: String,
    /// Whether truncation occurred.
    pub truncated: bool,
    /// Character count before truncation.
    pub original_chars: usize,
}

/// Which prompt shape to compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Persona + operating rules + skills + optional memory + optional time.
    Full,
    /// Operating rules + tool notes only, for sub-agent and heartbeat
    /// contexts where token footprint matters.
    Minimal,
}

/// Inputs for the current-time block.
#[derive(Debug, Clone)]
pub struct TimeContext {
    /// Request-level timezone override.
    pub request_timezone: Option<String>,
    /// Deployment default timezone.
    pub default_timezone: String,
}

/// Labeled memory sections, in prompt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContext {
    /// Curated long-term memory.
    pub long_term: Option<String>,
    /// Yesterday's dated file.
    pub yesterday: Option<String>,
    /// Today's dated file.
    pub today: Option<String>,
}

impl MemoryContext {
    /// Render the labeled sections present, or `None` when empty.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        let mut sections = Vec::new();
        if let Some(text) = &self.long_term {
            sections.push(format!("## Long-term memory\n\n{text}"));
        }
        if let Some(text) = &self.yesterday {
            sections.push(format!("## Yesterday\n\n{text}"));
        }
        if let Some(text) = &self.today {
            sections.push(format!("## Today\n\n{text}"));
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

/// Per-file size line for the context endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapFileStat {
    /// Relative path.
    pub path: String,
    /// Whether the file exists.
    pub present: bool,
    /// Characters after truncation.
    pub chars: usize,
    /// Estimated tokens after truncation.
    pub estimated_tokens: u64,
    /// Whether the file was truncated at the limit.
    pub truncated: bool,
}

/// Reads workspace files with a per-instance cache.
///
/// Each file is read once per loader instance; the cache must be dropped
/// (or [`WorkspaceLoader::invalidate`] called) after a rollback or snapshot
/// restore, which is why the orchestrator constructs one loader per request.
#[derive(Debug)]
pub struct WorkspaceLoader {
    root: PathBuf,
    char_limit: usize,
    cache: Mutex<HashMap<PathBuf, Option<LoadedFile>>>,
}

impl WorkspaceLoader {
    /// Loader over `root`, truncating each file at `char_limit` characters.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, char_limit: usize) -> Self {
        Self {
            root: root.into(),
            char_limit,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Workspace root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a file relative to the root. Missing files yield `None`; reads
    /// are cached for the loader's lifetime; content beyond the limit is
    /// replaced with a visible truncation marker.
    #[must_use]
    pub fn read(&self, rel: impl AsRef<Path>) -> Option<LoadedFile> {
        let rel = rel.as_ref().to_path_buf();
        let mut cache = self.cache.lock().expect("loader cache poisoned");
        if let Some(cached) = cache.get(&rel) {
            return cached.clone();
        }
        let loaded = std::fs::read_to_string(self.root.join(&rel))
            .ok()
            .map(|content| self.truncate(content));
        cache.insert(rel, loaded.clone());
        loaded
    }

    /// Drop every cached read.
    pub fn invalidate(&self) {
        self.cache.lock().expect("loader cache poisoned").clear();
    }

    fn truncate(&self, content: String) -> LoadedFile {
        let original_chars = content.chars().count();
        if original_chars <= self.char_limit {
            return LoadedFile {
                content,
                truncated: false,
                original_chars,
            };
        }
        let kept: String = content.chars().take(self.char_limit).collect();
        LoadedFile {
            content: format!(
                "{kept}\n[truncated: {} of {original_chars} chars]",
                self.char_limit
            ),
            truncated: true,
            original_chars,
        }
    }

    /// Load the persona for `role`: `souls/<role>.md` when present, falling
    /// back to the default persona.
    #[must_use]
    pub fn persona(&self, role: &str) -> Option<LoadedFile> {
        self.read(Path::new(files::PERSONA_DIR).join(format!("{role}.md")))
            .or_else(|| self.read(files::DEFAULT_PERSONA))
    }

    /// Memory context: curated long-term file plus yesterday's and today's
    /// dated files.
    #[must_use]
    pub fn memory(&self, today: DateTime<Utc>) -> MemoryContext {
        let dated = |date: DateTime<Utc>| {
            self.read(
                Path::new(files::MEMORY_DIR).join(format!("{}.md", date.format("%Y-%m-%d"))),
            )
            .map(|f| f.content)
        };
        MemoryContext {
            long_term: self.read(files::MEMORY).map(|f| f.content),
            yesterday: dated(today - Duration::days(1)),
            today: dated(today),
        }
    }

    /// Compose the system prompt.
    ///
    /// `skill_instructions` are the bodies of the admitted skills, already
    /// resolved by the registry.
    #[must_use]
    pub fn compose_prompt(
        &self,
        mode: PromptMode,
        role: &str,
        skill_instructions: &[String],
        memory: Option<&MemoryContext>,
        time: Option<&TimeContext>,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        match mode {
            PromptMode::Full => {
                if let Some(persona) = self.persona(role) {
                    sections.push(persona.content);
                }
                if let Some(rules) = self.read(files::OPERATING_RULES) {
                    sections.push(rules.content);
                }
                for body in skill_instructions {
                    sections.push(body.clone());
                }
                if let Some(rendered) = memory.and_then(MemoryContext::render) {
                    sections.push(rendered);
                }
                if let Some(time) = time {
                    sections.push(render_time_block(Utc::now(), time));
                }
            }
            PromptMode::Minimal => {
                if let Some(rules) = self.read(files::OPERATING_RULES) {
                    sections.push(rules.content);
                }
                if let Some(tools) = self.read(files::TOOLS) {
                    sections.push(tools.content);
                }
            }
        }

        sections.join("\n\n")
    }

    /// Per-file prompt-size stats for the context endpoint.
    #[must_use]
    pub fn bootstrap_stats(&self, role: &str) -> Vec<BootstrapFileStat> {
        let persona_path = format!("{}/{role}.md", files::PERSONA_DIR);
        let paths = [
            files::OPERATING_RULES,
            files::DEFAULT_PERSONA,
            persona_path.as_str(),
            files::IDENTITY,
            files::TOOLS,
            files::HEARTBEAT,
            files::USER_PROFILE,
            files::BOOT,
            files::MEMORY,
        ];
        paths
            .iter()
            .map(|path| match self.read(path) {
                Some(file) => BootstrapFileStat {
                    path: (*path).to_string(),
                    present: true,
                    chars: file.content.chars().count(),
                    estimated_tokens: estimate_tokens(&file.content),
                    truncated: file.truncated,
                },
                None => BootstrapFileStat {
                    path: (*path).to_string(),
                    present: false,
                    chars: 0,
                    estimated_tokens: 0,
                    truncated: false,
                },
            })
            .collect()
    }

    /// Whether boot has completed (`.boot-complete` marker present).
    #[must_use]
    pub fn boot_complete(&self) -> bool {
        self.root.join(files::BOOT_MARKER).exists()
    }
}

/// Render the current-time block: date, 12-hour time, timezone label.
///
/// Timezone resolution: request override > configured default > UTC. Named
/// zones are carried as labels; offsets are honored when the value is a
/// fixed-offset string (`+05:30`, `-08:00`). Anything else renders in UTC
/// under the given label.
fn render_time_block(now: DateTime<Utc>, time: &TimeContext) -> String {
    let label = time
        .request_timezone
        .clone()
        .unwrap_or_else(|| time.default_timezone.clone());

    let local = match label.parse::<FixedOffset>() {
        Ok(offset) => now.with_timezone(&offset).naive_local(),
        Err(_) => now.naive_utc(),
    };

    format!(
        "Current time:\ndate: {}\ntime: {}\ntimezone: {}",
        local.format("%Y-%m-%d"),
        local.format("%I:%M %p"),
        label
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace() -> (tempfile::TempDir, WorkspaceLoader) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AGENTS.md"), "# Rules\nBe helpful.").unwrap();
        fs::write(dir.path().join("SOUL.md"), "# Default persona").unwrap();
        fs::write(dir.path().join("TOOLS.md"), "# Tools\nsearch").unwrap();
        fs::create_dir(dir.path().join("souls")).unwrap();
        fs::write(dir.path().join("souls/researcher.md"), "# Researcher persona").unwrap();
        let loader = WorkspaceLoader::new(dir.path(), 20_000);
        (dir, loader)
    }

    #[test]
    fn missing_file_is_none() {
        let (_dir, loader) = workspace();
        assert!(loader.read("HEARTBEAT.md").is_none());
    }

    #[test]
    fn reads_are_cached_per_instance() {
        let (dir, loader) = workspace();
        let first = loader.read("AGENTS.md").unwrap();
        fs::write(dir.path().join("AGENTS.md"), "changed on disk").unwrap();
        let second = loader.read("AGENTS.md").unwrap();
        assert_eq!(first, second, "cache must serve the original read");

        loader.invalidate();
        let third = loader.read("AGENTS.md").unwrap();
        assert_eq!(third.content, "changed on disk");
    }

    #[test]
    fn truncation_is_observable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AGENTS.md"), "x".repeat(150)).unwrap();
        let loader = WorkspaceLoader::new(dir.path(), 100);
        let file = loader.read("AGENTS.md").unwrap();
        assert!(file.truncated);
        assert_eq!(file.original_chars, 150);
        assert!(file.content.contains("[truncated: 100 of 150 chars]"));
    }

    #[test]
    fn persona_prefers_role_file() {
        let (_dir, loader) = workspace();
        assert_eq!(loader.persona("researcher").unwrap().content, "# Researcher persona");
        assert_eq!(loader.persona("assistant").unwrap().content, "# Default persona");
    }

    #[test]
    fn full_prompt_orders_sections() {
        let (_dir, loader) = workspace();
        let prompt = loader.compose_prompt(
            PromptMode::Full,
            "assistant",
            &["## Skill: triage".to_string()],
            None,
            None,
        );
        let persona_at = prompt.find("# Default persona").unwrap();
        let rules_at = prompt.find("# Rules").unwrap();
        let skill_at = prompt.find("## Skill: triage").unwrap();
        assert!(persona_at < rules_at && rules_at < skill_at);
    }

    #[test]
    fn minimal_prompt_skips_persona_and_memory() {
        let (_dir, loader) = workspace();
        let prompt = loader.compose_prompt(PromptMode::Minimal, "assistant", &[], None, None);
        assert!(prompt.contains("# Rules"));
        assert!(prompt.contains("# Tools"));
        assert!(!prompt.contains("persona"));
    }

    #[test]
    fn memory_context_labels_sections() {
        let (dir, loader) = workspace();
        fs::write(dir.path().join("MEMORY.md"), "prefers brevity").unwrap();
        fs::create_dir(dir.path().join("memory")).unwrap();
        let today = Utc::now();
        fs::write(
            dir.path()
                .join(format!("memory/{}.md", today.format("%Y-%m-%d"))),
            "met with ops",
        )
        .unwrap();

        let memory = loader.memory(today);
        let rendered = memory.render().unwrap();
        assert!(rendered.contains("## Long-term memory"));
        assert!(rendered.contains("prefers brevity"));
        assert!(rendered.contains("## Today"));
        assert!(rendered.contains("met with ops"));
        assert!(!rendered.contains("## Yesterday"));
    }

    #[test]
    fn empty_memory_renders_none() {
        let (_dir, loader) = workspace();
        assert!(loader.memory(Utc::now()).render().is_none());
    }

    #[test]
    fn time_block_uses_request_override() {
        let time = TimeContext {
            request_timezone: Some("+05:30".to_string()),
            default_timezone: "UTC".to_string(),
        };
        let now = Utc::now();
        let block = render_time_block(now, &time);
        assert!(block.contains("timezone: +05:30"));
        let shifted = now.with_timezone(&"+05:30".parse::<FixedOffset>().unwrap());
        assert!(block.contains(&shifted.format("%I:%M %p").to_string()));
    }

    #[test]
    fn time_block_falls_back_to_default_label() {
        let time = TimeContext {
            request_timezone: None,
            default_timezone: "America/New_York".to_string(),
        };
        let block = render_time_block(Utc::now(), &time);
        assert!(block.contains("timezone: America/New_York"));
    }

    #[test]
    fn bootstrap_stats_mark_missing_files() {
        let (_dir, loader) = workspace();
        let stats = loader.bootstrap_stats("assistant");
        let rules = stats.iter().find(|s| s.path == "AGENTS.md").unwrap();
        assert!(rules.present);
        assert!(rules.estimated_tokens > 0);
        let heartbeat = stats.iter().find(|s| s.path == "HEARTBEAT.md").unwrap();
        assert!(!heartbeat.present);
    }
}
