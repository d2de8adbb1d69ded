//! The fixed set of analysis roles.
//!
//! Every role is a variant of [`AgentRole`] carrying its dependency list,
//! retrieval queries, prompts and output contract. New roles are added as
//! new variants.
//!
//! Default topology:
//!
//! ```text
//! coordinator → semantic → best_practice ─┬→ sde ─┬→ qa
//!                                         └→ pm  ─┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Semantic,
    BestPractice,
    Sde,
    Pm,
    Qa,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Coordinator,
        AgentRole::Semantic,
        AgentRole::BestPractice,
        AgentRole::Sde,
        AgentRole::Pm,
        AgentRole::Qa,
    ];

    /// Roles that write the user-facing reports. Requested roles are usually
    /// a subset of these.
    pub const WRITERS: [AgentRole; 2] = [AgentRole::Sde, AgentRole::Pm];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Semantic => "semantic",
            AgentRole::BestPractice => "best_practice",
            AgentRole::Sde => "sde",
            AgentRole::Pm => "pm",
            AgentRole::Qa => "qa",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "Coordinator",
            AgentRole::Semantic => "Semantic Analysis",
            AgentRole::BestPractice => "Best Practices",
            AgentRole::Sde => "Engineering Report",
            AgentRole::Pm => "Product Report",
            AgentRole::Qa => "Quality Review",
        }
    }

    /// Roles that must be `done` before this role may run.
    ///
    /// `qa` additionally depends on whichever writers are part of the
    /// run; see [`crate::graph::TaskGraph::plan`].
    pub fn dependencies(&self) -> &'static [AgentRole] {
        match self {
            AgentRole::Coordinator => &[],
            AgentRole::Semantic => &[AgentRole::Coordinator],
            AgentRole::BestPractice => &[AgentRole::Semantic],
            AgentRole::Sde | AgentRole::Pm | AgentRole::Qa => &[AgentRole::BestPractice],
        }
    }

    /// Retrieval queries issued to build this role's code context.
    pub fn context_queries(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Coordinator => &[
                "main entrypoint application startup",
                "API routes endpoints handlers",
                "database models schemas entities",
                "configuration settings environment",
            ],
            AgentRole::Semantic => &[
                "core modules and components",
                "data flow between services",
            ],
            AgentRole::BestPractice => &[
                "error handling and validation",
                "tests and test setup",
                "authentication secrets and security",
            ],
            AgentRole::Sde => &[
                "architecture services and modules",
                "API routes endpoints handlers",
                "database models schemas entities",
            ],
            AgentRole::Pm => &[
                "user facing features and workflows",
                "README project overview documentation",
            ],
            AgentRole::Qa => &[],
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => {
                "You are the lead analyst coordinating a code review team. \
                 You survey a repository and decide what the specialists should examine."
            }
            AgentRole::Semantic => {
                "You are a software archaeologist. You map the components, APIs, \
                 data entities and data flows of a codebase from its source."
            }
            AgentRole::BestPractice => {
                "You are a senior reviewer focused on engineering quality. \
                 You identify strengths, risks and concrete improvements."
            }
            AgentRole::Sde => {
                "You are a principal software engineer writing a technical report \
                 for engineers who will work on this codebase."
            }
            AgentRole::Pm => {
                "You are a product manager writing a product-level report \
                 about what this software does for its users."
            }
            AgentRole::Qa => {
                "You are a QA lead validating the reports produced by other \
                 analysts against the evidence in the code."
            }
        }
    }

    /// What the role is asked to produce.
    pub fn task(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => {
                "Summarize the project, list the analysis priorities, and propose \
                 search queries the semantic analyst should run."
            }
            AgentRole::Semantic => {
                "Identify the main components, APIs, data entities, data flows and \
                 key files, and summarize the technology stack."
            }
            AgentRole::BestPractice => {
                "Assess the codebase against engineering best practices: list \
                 strengths, risks and prioritized recommendations."
            }
            AgentRole::Sde => {
                "Write the engineering report: architecture summary, components, \
                 APIs, database model, suggested mermaid diagrams and technical notes."
            }
            AgentRole::Pm => {
                "Write the product report: product summary, key features, user \
                 journeys, constraints, risks, roadmap ideas and suggested diagrams."
            }
            AgentRole::Qa => {
                "Validate the upstream reports: point out unsupported claims, gaps \
                 and contradictions, then give an overall assessment."
            }
        }
    }

    /// Keys the role's JSON output must contain.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Coordinator => &["project_summary", "analysis_priorities", "semantic_queries"],
            AgentRole::Semantic => &[
                "components",
                "apis",
                "entities",
                "data_flows",
                "key_files",
                "stack_summary",
            ],
            AgentRole::BestPractice => &["strengths", "risks", "recommendations", "overall_assessment"],
            AgentRole::Sde => &[
                "architecture_summary",
                "components",
                "apis",
                "database_model",
                "diagrams",
                "technical_notes",
            ],
            AgentRole::Pm => &[
                "product_summary",
                "key_features",
                "user_journeys",
                "constraints",
                "risks",
                "roadmap_ideas",
                "diagrams",
            ],
            AgentRole::Qa => &["sde_validation", "pm_validation", "overall_assessment"],
        }
    }

    /// Role-specific sampling temperature; `None` uses the run's setting.
    pub fn temperature(&self) -> Option<f32> {
        match self {
            AgentRole::Coordinator => Some(0.2),
            AgentRole::Qa => Some(0.4),
            _ => None,
        }
    }

    /// Question words that make this role's findings relevant in chat.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Coordinator => &["overview", "summary", "purpose", "priority"],
            AgentRole::Semantic => &["component", "stack", "entity", "flow", "file", "module"],
            AgentRole::BestPractice => &["risk", "security", "practice", "improve", "recommend", "quality"],
            AgentRole::Sde => &["architecture", "api", "endpoint", "database", "schema", "design", "diagram"],
            AgentRole::Pm => &["feature", "user", "product", "journey", "roadmap", "business"],
            AgentRole::Qa => &["validation", "accuracy", "gap", "review", "correct"],
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "coordinator" => Ok(AgentRole::Coordinator),
            "semantic" => Ok(AgentRole::Semantic),
            "best_practice" | "best_practices" => Ok(AgentRole::BestPractice),
            "sde" | "engineering" => Ok(AgentRole::Sde),
            "pm" | "product" => Ok(AgentRole::Pm),
            "qa" | "quality" => Ok(AgentRole::Qa),
            other => anyhow::bail!(
                "unknown role '{}'. Known roles: coordinator, semantic, best_practice, sde, pm, qa",
                other
            ),
        }
    }
}

/// Parse a comma-separated role list such as `"sde,pm"`.
pub fn parse_roles(list: &str) -> anyhow::Result<Vec<AgentRole>> {
    let mut roles = Vec::new();
    for part in list.split(',').filter(|p| !p.trim().is_empty()) {
        let role: AgentRole = part.parse()?;
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok(roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("best-practices".parse::<AgentRole>().unwrap(), AgentRole::BestPractice);
        assert_eq!("PM".parse::<AgentRole>().unwrap(), AgentRole::Pm);
        assert!("designer".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_parse_roles_dedups() {
        let roles = parse_roles("sde, pm,sde").unwrap();
        assert_eq!(roles, vec![AgentRole::Sde, AgentRole::Pm]);
        assert!(parse_roles("sde,wizard").is_err());
    }

    #[test]
    fn test_every_role_has_output_contract() {
        for role in AgentRole::ALL {
            assert!(!role.required_keys().is_empty(), "{} has no keys", role);
            assert!(!role.system_prompt().is_empty());
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
    }

    #[test]
    fn test_default_dependencies_are_acyclic_by_order() {
        // Every dependency is declared earlier in ALL.
        for (i, role) in AgentRole::ALL.iter().enumerate() {
            for dep in role.dependencies() {
                let j = AgentRole::ALL.iter().position(|r| r == dep).unwrap();
                assert!(j < i, "{} depends on later role {}", role, dep);
            }
        }
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&AgentRole::BestPractice).unwrap(),
            "\"best_practice\""
        );
    }
}
