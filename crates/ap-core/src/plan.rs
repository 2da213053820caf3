//! Structured plans and the markdown schema they are written in.
//!
//! ```text
//! # Title
//! ## Analysis
//! ### Step 1: Do the thing
//! body text...
//! Verify: how to check it
//! Agent: backend
//! ReadOnly: true
//! ## Constraints
//! - keep the public API
//! ## Dependencies
//! - /path/to/shared/lib   (first token only)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanStep {
    pub number: u32,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Plan {
    pub title: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Extra paths the agent is granted access to.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains no steps")]
    NoSteps,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Step,
    Constraints,
    Dependencies,
    Other,
}

impl Plan {
    /// Parse a plan document. Fails when no `### Step N:` heading is present.
    pub fn parse(content: &str) -> Result<Plan> {
        let mut plan = Plan::default();
        let mut section = Section::Preamble;
        let mut body: Vec<&str> = Vec::new();

        for raw in content.lines() {
            let line = raw.trim_end();
            let trimmed = line.trim_start();

            if let Some(step) = parse_step_heading(trimmed) {
                flush_body(&mut plan, &mut body);
                plan.steps.push(step);
                section = Section::Step;
                continue;
            }
            if let Some(heading) = trimmed.strip_prefix("## ") {
                flush_body(&mut plan, &mut body);
                section = match heading.trim().to_ascii_lowercase().as_str() {
                    "constraints" => Section::Constraints,
                    "dependencies" => Section::Dependencies,
                    _ => Section::Other,
                };
                continue;
            }
            if let Some(title) = trimmed.strip_prefix("# ") {
                if plan.title.is_empty() {
                    plan.title = title.trim().to_string();
                    continue;
                }
            }

            match section {
                Section::Step => {
                    let Some(step) = plan.steps.last_mut() else {
                        continue;
                    };
                    if let Some(v) = strip_key(trimmed, "verify:") {
                        step.verify = Some(v.to_string());
                    } else if let Some(v) = strip_key(trimmed, "agent:") {
                        step.agent = Some(v.to_string());
                    } else if let Some(v) = strip_key(trimmed, "readonly:") {
                        step.read_only = matches!(v.to_ascii_lowercase().as_str(), "true" | "yes");
                    } else {
                        body.push(line);
                    }
                }
                Section::Constraints => {
                    if let Some(item) = trimmed.strip_prefix("- ") {
                        plan.constraints.push(item.trim().to_string());
                    }
                }
                Section::Dependencies => {
                    if let Some(item) = trimmed.strip_prefix("- ") {
                        if let Some(token) = item.split_whitespace().next() {
                            plan.dependencies.push(token.to_string());
                        }
                    }
                }
                Section::Preamble | Section::Other => {}
            }
        }
        flush_body(&mut plan, &mut body);

        if plan.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }
        Ok(plan)
    }

    pub fn parse_file(path: &Path) -> Result<Plan> {
        let content = std::fs::read_to_string(path)?;
        Plan::parse(&content)
    }

    /// Render the plan back into the markdown schema accepted by [`Plan::parse`].
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", self.title);
        for step in &self.steps {
            let _ = writeln!(out, "### Step {}: {}", step.number, step.title);
            if !step.body.is_empty() {
                let _ = writeln!(out, "{}", step.body);
            }
            if let Some(verify) = &step.verify {
                let _ = writeln!(out, "Verify: {verify}");
            }
            if let Some(agent) = &step.agent {
                let _ = writeln!(out, "Agent: {agent}");
            }
            if step.read_only {
                let _ = writeln!(out, "ReadOnly: true");
            }
            out.push('\n');
        }
        if !self.constraints.is_empty() {
            out.push_str("## Constraints\n");
            for c in &self.constraints {
                let _ = writeln!(out, "- {c}");
            }
            out.push('\n');
        }
        if !self.dependencies.is_empty() {
            out.push_str("## Dependencies\n");
            for d in &self.dependencies {
                let _ = writeln!(out, "- {d}");
            }
        }
        out
    }
}

fn parse_step_heading(line: &str) -> Option<PlanStep> {
    let rest = line.strip_prefix("### ")?.trim_start();
    let rest = strip_key(rest, "step")?;
    let (number, title) = match rest.split_once(':') {
        Some((n, t)) => (n, t),
        None => (rest, ""),
    };
    let number = number.trim().parse().ok()?;
    Some(PlanStep {
        number,
        title: title.trim().to_string(),
        ..PlanStep::default()
    })
}

/// Case-insensitive prefix strip; returns the trimmed remainder.
fn strip_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let head = line.get(..key.len())?;
    if head.eq_ignore_ascii_case(key) {
        Some(line[key.len()..].trim())
    } else {
        None
    }
}

fn flush_body(plan: &mut Plan, body: &mut Vec<&str>) {
    if let Some(step) = plan.steps.last_mut() {
        if step.body.is_empty() && !body.is_empty() {
            step.body = trim_blank_lines(body).join("\n");
        }
    }
    body.clear();
}

fn trim_blank_lines<'a, 'b>(lines: &'b [&'a str]) -> &'b [&'a str] {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(s), Some(e)) => &lines[s..=e],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Add greeting

## Analysis
The project has no greeting file.

### Step 1: Create file hello.txt
Write hello.txt in the project root.
It should contain a single line.
verify: cat hello.txt prints hello

### Step 2: Review
Agent: reviewer
ReadOnly: yes
Read the file and confirm it exists.

## Constraints
- do not touch README.md
- keep it short

## Dependencies
- /srv/shared   read access only
- ../common
";

    #[test]
    fn parses_full_document() {
        let plan = Plan::parse(SAMPLE).unwrap();
        assert_eq!(plan.title, "Add greeting");
        assert_eq!(plan.steps.len(), 2);

        let first = &plan.steps[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.title, "Create file hello.txt");
        assert_eq!(
            first.body,
            "Write hello.txt in the project root.\nIt should contain a single line."
        );
        assert_eq!(first.verify.as_deref(), Some("cat hello.txt prints hello"));
        assert!(!first.read_only);

        let second = &plan.steps[1];
        assert_eq!(second.agent.as_deref(), Some("reviewer"));
        assert!(second.read_only);
        assert_eq!(second.body, "Read the file and confirm it exists.");

        assert_eq!(plan.constraints, vec!["do not touch README.md", "keep it short"]);
        assert_eq!(plan.dependencies, vec!["/srv/shared", "../common"]);
    }

    #[test]
    fn analysis_text_is_not_part_of_any_step() {
        let plan = Plan::parse(SAMPLE).unwrap();
        assert!(plan.steps.iter().all(|s| !s.body.contains("no greeting file")));
    }

    #[test]
    fn only_first_h1_is_the_title() {
        let doc = "# First\n### Step 1: a\n# Second\n";
        let plan = Plan::parse(doc).unwrap();
        assert_eq!(plan.title, "First");
        assert_eq!(plan.steps[0].body, "# Second");
    }

    #[test]
    fn document_without_steps_is_rejected() {
        let err = Plan::parse("# Title\n## Analysis\nnothing to do\n").unwrap_err();
        assert!(matches!(err, PlanError::NoSteps));
    }

    #[test]
    fn rendered_plan_parses_back_to_the_same_plan() {
        let plan = Plan::parse(SAMPLE).unwrap();
        let reparsed = Plan::parse(&plan.to_markdown()).unwrap();
        assert_eq!(reparsed, plan);
    }
}
