//! Prompt text for planning, step execution and failure diagnosis.

use std::fmt::Write as _;
use std::path::Path;

use ap_core::config::ProjectConfig;
use ap_core::plan::PlanStep;

/// Fixed rules appended to every step prompt.
pub const RULES: &str = "\
RULES:
- Do not create documentation, summaries, notes or report files unless the step explicitly asks for them.
- Make concrete file edits to complete this step. Reading and describing is not enough.
- Stay within the scope of this step. Later steps are handled separately.
- When finished, list every file you modified, then end with a line starting with `Summary:` describing what changed.";

const READ_ONLY_RULES: &str = "\
RULES:
- This step is read-only. Do not modify any files.
- Do not create documentation, summaries, notes or report files.
- When finished, end with a line starting with `Summary:` describing what you found.";

/// Recovery note injected when a writable step finished without edits.
pub const NO_WRITES_NOTE: &str = "The previous attempt finished without modifying any files. \
This step requires actual file changes: use Write or Edit to make them before finishing.";

// ---------------------------------------------------------------------------
// Plan skeleton
// ---------------------------------------------------------------------------

/// Optional plan sections derived from per-project settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSkeleton {
    pub sections: Vec<String>,
}

impl PlanSkeleton {
    pub fn from_project(cfg: &ProjectConfig) -> Self {
        let mut sections = Vec::new();
        if cfg.web_search {
            sections.push("Research: search the web for current best practice before designing the change.".to_string());
        }
        if cfg.library_docs {
            sections.push("Library docs: look up the documentation of every library the change touches.".to_string());
        }
        if cfg.build_verify {
            let cmd = cfg.build_command.as_deref().unwrap_or("the project's build command");
            sections.push(format!("Build verification: a step that runs {cmd} and fixes any errors."));
        }
        if cfg.test {
            let cmd = cfg.test_command.as_deref().unwrap_or("the project's test suite");
            sections.push(format!("Tests: a step that adds or updates tests and runs {cmd}."));
        }
        if cfg.pre_commit {
            sections.push("Pre-commit: a step that runs the pre-commit hooks and fixes what they report.".to_string());
        }
        if cfg.commit {
            sections.push("Commit: a final step that commits the changes with a descriptive message.".to_string());
        }
        if cfg.push {
            sections.push("Push: after committing, push the branch to its remote.".to_string());
        }
        Self { sections }
    }

    fn render(&self) -> String {
        if self.sections.is_empty() {
            return String::new();
        }
        let mut out = String::from("SKELETON (include these as steps where they apply):\n");
        for section in &self.sections {
            let _ = writeln!(out, "- {section}");
        }
        out
    }
}

pub fn plan_prompt(project_path: &Path, description: &str, skeleton: &PlanSkeleton) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are planning work in the project at {}.", project_path.display());
    let _ = writeln!(out, "First read the relevant project files so the plan fits the existing code.");
    let _ = writeln!(out, "Do not modify any files while planning.\n");
    let _ = writeln!(out, "TASK:\n{}\n", description.trim());
    out.push_str(&skeleton.render());
    out.push_str(
        "\nYour final message must be the plan and nothing else, in exactly this markdown format:\n\n\
         # <short plan title>\n\n\
         ## Analysis\n\
         <what exists today and what has to change>\n\n\
         ### Step 1: <title>\n\
         <what to do, naming concrete files>\n\
         Verify: <how to check this step worked>\n\
         Agent: <optional role>\n\
         ReadOnly: <true only for steps that change no files>\n\n\
         ### Step 2: <title>\n\
         ...\n\n\
         ## Constraints\n\
         - <optional constraint>\n\n\
         ## Dependencies\n\
         - <optional absolute path outside the project the steps need access to>\n",
    );
    out
}

// ---------------------------------------------------------------------------
// Step and recovery prompts
// ---------------------------------------------------------------------------

pub struct StepContext<'a> {
    pub description: &'a str,
    pub project_path: &'a Path,
    pub previous: &'a [String],
    pub step: &'a PlanStep,
    pub total_steps: usize,
    pub recovery: Option<&'a str>,
}

pub fn step_prompt(ctx: &StepContext<'_>) -> String {
    let step = ctx.step;
    let mut out = String::new();
    let _ = writeln!(out, "Project: {}", ctx.project_path.display());
    let _ = writeln!(out, "Overall task: {}\n", ctx.description.trim());

    if !ctx.previous.is_empty() {
        out.push_str("Completed steps:\n");
        for (i, summary) in ctx.previous.iter().enumerate() {
            let _ = writeln!(out, "{}. {summary}", i + 1);
        }
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "Current step {} of {}: {}",
        step.number, ctx.total_steps, step.title
    );
    if !step.body.is_empty() {
        let _ = writeln!(out, "{}", step.body);
    }
    if let Some(verify) = &step.verify {
        let _ = writeln!(out, "Verify: {verify}");
    }
    if let Some(recovery) = ctx.recovery {
        let _ = writeln!(out, "\nPREVIOUS ATTEMPT FAILED:\n{recovery}");
    }
    out.push('\n');
    out.push_str(if step.read_only { READ_ONLY_RULES } else { RULES });
    out
}

pub fn recovery_prompt(
    description: &str,
    step: &PlanStep,
    exit_code: i32,
    output_tail: &str,
    denials: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "A coding agent failed a step. Diagnose why; do not modify any files.\n");
    let _ = writeln!(out, "Task: {}", description.trim());
    let _ = writeln!(out, "Step {}: {}", step.number, step.title);
    let _ = writeln!(out, "Exit code: {exit_code}");
    if !denials.is_empty() {
        let _ = writeln!(out, "Denied tools: {}", denials.join(", "));
    }
    let _ = writeln!(out, "\nEnd of the agent's output:\n{output_tail}\n");
    out.push_str(
        "Reply with at most three sentences: the likely cause and what the next attempt should do differently.",
    );
    out
}

/// Last `max` characters of `s`.
pub fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Short summary of a step's output: the last `Summary:` line, otherwise
/// the last non-empty paragraph, truncated to `max` characters.
pub fn summarize(output: &str, max: usize) -> String {
    let from_marker = output.lines().rev().find_map(|line| {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        lower
            .strip_prefix("summary:")
            .map(|_| line["summary:".len()..].trim().to_string())
    });
    let text = from_marker.unwrap_or_else(|| {
        output
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .last()
            .unwrap_or("")
            .to_string()
    });
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() <= max {
        return text;
    }
    let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(read_only: bool) -> PlanStep {
        PlanStep {
            number: 2,
            title: "Add parser".into(),
            body: "Edit src/parse.rs".into(),
            verify: Some("cargo test passes".into()),
            agent: None,
            read_only,
        }
    }

    #[test]
    fn skeleton_follows_project_toggles() {
        let cfg = ProjectConfig {
            web_search: true,
            test: false,
            push: true,
            build_command: Some("make".into()),
            ..ProjectConfig::default()
        };
        let skel = PlanSkeleton::from_project(&cfg);
        let text = skel.sections.join("\n");
        assert!(text.contains("Research"));
        assert!(text.contains("runs make"));
        assert!(text.contains("Push"));
        assert!(!text.contains("Tests:"));
    }

    #[test]
    fn plan_prompt_names_path_and_schema() {
        let prompt = plan_prompt(Path::new("/p/demo"), "add a parser", &PlanSkeleton::default());
        assert!(prompt.contains("/p/demo"));
        assert!(prompt.contains("read the relevant project files"));
        assert!(prompt.contains("## Analysis"));
        assert!(prompt.contains("### Step 1:"));
        assert!(!prompt.contains("SKELETON"));
    }

    #[test]
    fn step_prompt_carries_context() {
        let s = step(false);
        let previous = vec!["Created module".to_string()];
        let prompt = step_prompt(&StepContext {
            description: "add a parser",
            project_path: Path::new("/p/demo"),
            previous: &previous,
            step: &s,
            total_steps: 3,
            recovery: Some("Diagnosis: wrong file"),
        });
        assert!(prompt.contains("Current step 2 of 3: Add parser"));
        assert!(prompt.contains("1. Created module"));
        assert!(prompt.contains("Verify: cargo test passes"));
        assert!(prompt.contains("Diagnosis: wrong file"));
        assert!(prompt.contains("Make concrete file edits"));

        let ro = step(true);
        let prompt = step_prompt(&StepContext {
            description: "x",
            project_path: Path::new("/p"),
            previous: &[],
            step: &ro,
            total_steps: 1,
            recovery: None,
        });
        assert!(prompt.contains("read-only"));
        assert!(!prompt.contains("Completed steps"));
    }

    #[test]
    fn recovery_prompt_lists_denials() {
        let prompt = recovery_prompt("t", &step(false), 1, "boom", &["Edit".into()]);
        assert!(prompt.contains("Exit code: 1"));
        assert!(prompt.contains("Denied tools: Edit"));
        assert!(prompt.contains("boom"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 3), "llo");
        assert_eq!(tail("ab", 5), "ab");
    }

    #[test]
    fn summary_prefers_marker_line() {
        let out = "Edited a.rs\n\nSummary: added the parser\n";
        assert_eq!(summarize(out, 100), "added the parser");
        assert_eq!(summarize("first\n\nsecond   para", 100), "second para");
        assert_eq!(summarize("abcdefghij", 6), "abc...");
    }
}
