//! Analysis run settings: depth, verbosity, roles and named templates.
//!
//! Depth and verbosity are applied uniformly to every node of a run. They
//! size retrieval and generation budgets and never change the graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::roles::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    Standard,
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

/// Per-node budgets derived from [`Depth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthParameters {
    /// Chunks requested per retrieval query.
    pub retrieval_k: usize,
    /// Maximum distinct chunks placed in one node's prompt.
    pub chunk_limit: usize,
    /// Maximum prompt size in characters.
    pub prompt_chars: usize,
    pub detail_level: &'static str,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Standard => "standard",
            Depth::Deep => "deep",
        }
    }

    pub fn parameters(&self) -> DepthParameters {
        match self {
            Depth::Quick => DepthParameters {
                retrieval_k: 3,
                chunk_limit: 10,
                prompt_chars: 12_000,
                detail_level: "high-level overview",
            },
            Depth::Standard => DepthParameters {
                retrieval_k: 5,
                chunk_limit: 25,
                prompt_chars: 24_000,
                detail_level: "detailed analysis",
            },
            Depth::Deep => DepthParameters {
                retrieval_k: 10,
                chunk_limit: 50,
                prompt_chars: 48_000,
                detail_level: "comprehensive deep-dive",
            },
        }
    }
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }

    pub fn max_output_tokens(&self) -> u32 {
        match self {
            Verbosity::Low => 1500,
            Verbosity::Medium => 3000,
            Verbosity::High => 4000,
        }
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            Verbosity::Low => "Be concise. Use bullet points. Limit explanations to 1-2 sentences.",
            Verbosity::Medium => "Provide clear explanations. Balance brevity with completeness.",
            Verbosity::High => "Provide detailed explanations, examples, and context. Be thorough.",
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(Depth::Quick),
            "standard" => Ok(Depth::Standard),
            "deep" => Ok(Depth::Deep),
            other => anyhow::bail!("unknown depth '{}'. Must be quick, standard, or deep.", other),
        }
    }
}

impl FromStr for Verbosity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Verbosity::Low),
            "medium" => Ok(Verbosity::Medium),
            "high" => Ok(Verbosity::High),
            other => anyhow::bail!("unknown verbosity '{}'. Must be low, medium, or high.", other),
        }
    }
}

/// Everything that parameterizes one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub depth: Depth,
    pub verbosity: Verbosity,
    /// Requested roles; the run also includes their dependencies.
    pub roles: Vec<AgentRole>,
    /// Default sampling temperature for roles without their own.
    pub temperature: f32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            depth: Depth::Standard,
            verbosity: Verbosity::Medium,
            roles: AgentRole::WRITERS.to_vec(),
            temperature: 0.3,
        }
    }
}

impl AnalysisSettings {
    /// Settings of a named template, or `None` for an unknown name.
    ///
    /// | template | depth | verbosity | roles | temperature |
    /// |---|---|---|---|---|
    /// | `quick_scan` | quick | low | sde | 0.2 |
    /// | `full_analysis` | deep | high | sde, pm | 0.3 |
    /// | `sde_focused` | deep | high | sde | 0.3 |
    /// | `pm_focused` | standard | medium | pm | 0.4 |
    pub fn template(name: &str) -> Option<Self> {
        let settings = match name {
            "quick_scan" => Self {
                depth: Depth::Quick,
                verbosity: Verbosity::Low,
                roles: vec![AgentRole::Sde],
                temperature: 0.2,
            },
            "full_analysis" => Self {
                depth: Depth::Deep,
                verbosity: Verbosity::High,
                roles: vec![AgentRole::Sde, AgentRole::Pm],
                temperature: 0.3,
            },
            "sde_focused" => Self {
                depth: Depth::Deep,
                verbosity: Verbosity::High,
                roles: vec![AgentRole::Sde],
                temperature: 0.3,
            },
            "pm_focused" => Self {
                depth: Depth::Standard,
                verbosity: Verbosity::Medium,
                roles: vec![AgentRole::Pm],
                temperature: 0.4,
            },
            _ => return None,
        };
        Some(settings)
    }

    pub const TEMPLATES: [&'static str; 4] = ["quick_scan", "full_analysis", "sde_focused", "pm_focused"];

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.roles.is_empty() {
            anyhow::bail!("at least one analysis role must be requested");
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            anyhow::bail!("temperature must be in [0.0, 1.0], got {}", self.temperature);
        }
        Ok(())
    }

    /// Temperature for `role`: its own override, else the run default.
    pub fn temperature_for(&self, role: AgentRole) -> f32 {
        role.temperature().unwrap_or(self.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_parameters_grow() {
        let q = Depth::Quick.parameters();
        let s = Depth::Standard.parameters();
        let d = Depth::Deep.parameters();
        assert_eq!((q.retrieval_k, s.retrieval_k, d.retrieval_k), (3, 5, 10));
        assert!(q.chunk_limit < s.chunk_limit && s.chunk_limit < d.chunk_limit);
        assert!(q.prompt_chars < d.prompt_chars);
    }

    #[test]
    fn test_parse_depth_and_verbosity() {
        assert_eq!("Deep".parse::<Depth>().unwrap(), Depth::Deep);
        assert_eq!("low".parse::<Verbosity>().unwrap(), Verbosity::Low);
        assert!("extreme".parse::<Depth>().is_err());
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn test_templates() {
        for name in AnalysisSettings::TEMPLATES {
            let settings = AnalysisSettings::template(name).unwrap();
            settings.validate().unwrap();
        }
        let quick = AnalysisSettings::template("quick_scan").unwrap();
        assert_eq!(quick.depth, Depth::Quick);
        assert_eq!(quick.roles, vec![AgentRole::Sde]);
        assert!(AnalysisSettings::template("nope").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut s = AnalysisSettings::default();
        s.temperature = 1.5;
        assert!(s.validate().is_err());
        s.temperature = 0.5;
        s.roles.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_role_temperature_override() {
        let s = AnalysisSettings::default();
        assert_eq!(s.temperature_for(AgentRole::Coordinator), 0.2);
        assert_eq!(s.temperature_for(AgentRole::Sde), 0.3);
    }
}
