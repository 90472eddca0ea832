//! Loading and structural validation of `skills.yaml`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use aggregator_core::Skill;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SkillsError {
    #[error("failed to read skills file: {0}")]
    Io(#[from] std::io::Error),
    #[error("skills file is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("skills file failed validation:\n{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, SkillsError>;

#[derive(Debug, serde::Deserialize)]
struct SkillsFile {
    #[serde(default)]
    skills: Vec<Skill>,
}

/// Load and validate `path`. A missing file is the caller's concern (the
/// facade treats it as "no skills"); this function only handles a file
/// that exists but fails to parse or validate.
pub async fn load_skills_file(path: impl AsRef<Path>) -> Result<Vec<Skill>> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let parsed: SkillsFile = serde_yaml::from_str(&content)?;
    validate(&parsed.skills)?;
    debug!("loaded {} skill(s) from {:?}", parsed.skills.len(), path.as_ref());
    Ok(parsed.skills)
}

/// Aggregate every structural problem into a single error: duplicate
/// names, empty step lists, and any step-name cycle among the skills in
/// this file (§9 Open Question: refused at load time).
fn validate(skills: &[Skill]) -> Result<()> {
    let mut problems = Vec::new();
    let mut seen_names = HashSet::new();

    for skill in skills {
        if skill.name.trim().is_empty() {
            problems.push("a skill has an empty name".to_string());
        } else if !seen_names.insert(skill.name.as_str()) {
            problems.push(format!("duplicate skill name: {}", skill.name));
        }
        if skill.steps.is_empty() {
            problems.push(format!("skill '{}' has no steps", skill.name));
        }
        for step in &skill.steps {
            if step.tool.trim().is_empty() {
                problems.push(format!("skill '{}' has a step with an empty tool name", skill.name));
            }
        }
    }

    if let Some(cycle) = find_cycle(skills) {
        problems.push(format!("recursive skill reference detected: {}", cycle.join(" -> ")));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SkillsError::Validation(problems.join("\n")))
    }
}

/// Build a graph from each skill to the skill names its steps reference,
/// and report the first cycle found (including a skill step naming
/// itself).
fn find_cycle(skills: &[Skill]) -> Option<Vec<String>> {
    let skill_names: HashSet<&str> = skills.iter().map(|s| s.name.as_str()).collect();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for skill in skills {
        let referenced: Vec<&str> = skill
            .steps
            .iter()
            .map(|step| step.tool.as_str())
            .filter(|tool| skill_names.contains(tool))
            .collect();
        edges.insert(skill.name.as_str(), referenced);
    }

    #[derive(PartialEq, Clone, Copy)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(Mark::Done) = marks.get(node) {
            return None;
        }
        if let Some(Mark::Visiting) = marks.get(node) {
            let start = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        if let Some(neighbors) = edges.get(node) {
            for next in neighbors {
                if let Some(cycle) = visit(next, edges, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for name in skill_names.iter() {
        if let Some(cycle) = visit(name, &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::SkillStep;

    fn step(tool: &str) -> SkillStep {
        SkillStep {
            tool: tool.to_string(),
            server: None,
            args: serde_json::json!({}),
            result_var: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error_for_caller_to_classify() {
        let result = load_skills_file("/nonexistent/skills.yaml").await;
        assert!(matches!(result, Err(SkillsError::Io(_))));
    }

    #[tokio::test]
    async fn well_formed_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.yaml");
        tokio::fs::write(
            &path,
            r#"
skills:
  - name: echo_twice
    description: Echoes twice
    parameters:
      input:
        type: string
    steps:
      - tool: echo
        args:
          message: "{{input}}"
        result_var: first
"#,
        )
        .await
        .unwrap();

        let skills = load_skills_file(&path).await.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "echo_twice");
        assert_eq!(skills[0].steps.len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let skills = vec![
            Skill {
                name: "a".to_string(),
                description: "x".to_string(),
                parameters: Default::default(),
                steps: vec![step("echo")],
            },
            Skill {
                name: "a".to_string(),
                description: "y".to_string(),
                parameters: Default::default(),
                steps: vec![step("echo")],
            },
        ];
        assert!(validate(&skills).is_err());
    }

    #[test]
    fn direct_self_reference_is_a_cycle() {
        let skills = vec![Skill {
            name: "loopy".to_string(),
            description: "refers to itself".to_string(),
            parameters: Default::default(),
            steps: vec![step("loopy")],
        }];
        assert!(validate(&skills).is_err());
    }

    #[test]
    fn mutual_reference_is_a_cycle() {
        let skills = vec![
            Skill {
                name: "a".to_string(),
                description: "".to_string(),
                parameters: Default::default(),
                steps: vec![step("b")],
            },
            Skill {
                name: "b".to_string(),
                description: "".to_string(),
                parameters: Default::default(),
                steps: vec![step("a")],
            },
        ];
        assert!(validate(&skills).is_err());
    }

    #[test]
    fn non_recursive_skills_are_valid() {
        let skills = vec![Skill {
            name: "a".to_string(),
            description: "".to_string(),
            parameters: Default::default(),
            steps: vec![step("echo")],
        }];
        assert!(validate(&skills).is_ok());
    }
}
