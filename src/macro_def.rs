//! The macro container.

use crate::error::MacroError;
use crate::step_types::MacroStep;
use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Accepts any id string; one that is not a UUID is replaced by a fresh one.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(Uuid::parse_str(raw.trim()).unwrap_or_else(|_| {
        let id = Uuid::new_v4();
        log::warn!("Macro id '{}' is not a UUID; using {}", raw, id);
        id
    }))
}

/// A named, ordered tree of steps plus default variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    #[serde(default = "Uuid::new_v4", alias = "macro_id", deserialize_with = "lenient_id")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default = "Local::now")]
    pub created_at: DateTime<Local>,
    #[serde(default = "Local::now")]
    pub updated_at: DateTime<Local>,
}

impl Macro {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            variables: BTreeMap::new(),
            steps: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the macro as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Local::now();
    }

    pub fn with_steps(mut self, steps: Vec<MacroStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Number of steps in the whole tree.
    pub fn step_count(&self) -> usize {
        fn count(steps: &[MacroStep]) -> usize {
            steps
                .iter()
                .map(|s| 1 + s.children().into_iter().map(count).sum::<usize>())
                .sum()
        }
        count(&self.steps)
    }

    pub fn find_step(&self, step_id: &str) -> Option<&MacroStep> {
        fn find<'a>(steps: &'a [MacroStep], id: &str) -> Option<&'a MacroStep> {
            steps.iter().find_map(|s| {
                if s.step_id == id {
                    Some(s)
                } else {
                    s.children().into_iter().find_map(|c| find(c, id))
                }
            })
        }
        find(&self.steps, step_id)
    }

    /// Collects every problem in the macro; `Ok` only when there are none.
    pub fn validate(&self) -> Result<(), MacroError> {
        let mut issues = Vec::new();
        if self.name.trim().is_empty() {
            issues.push("Macro name cannot be empty".to_string());
        }
        let mut seen = HashSet::new();
        walk(&self.steps, "", &mut seen, &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(MacroError::InvalidMacro(issues))
        }
    }
}

fn walk<'a>(
    steps: &'a [MacroStep],
    prefix: &str,
    seen: &mut HashSet<&'a str>,
    issues: &mut Vec<String>,
) {
    for (i, step) in steps.iter().enumerate() {
        let path = format!("{}{}", prefix, i + 1);
        if !seen.insert(step.step_id.as_str()) {
            issues.push(format!(
                "Step {} ({}): duplicate step_id '{}'",
                path, step.name, step.step_id
            ));
        }
        step.validate_into(&path, issues);
        let labels: &[&str] = match step.children().len() {
            2 => &["true", "false"],
            _ => &["body"],
        };
        for (children, label) in step.children().into_iter().zip(labels) {
            walk(children, &format!("{}.{}.", path, label), seen, issues);
        }
    }
}
