//! Domain knowledge injected into the agents' prompts.

use std::path::Path;

use serde::Deserialize;

/// Supplies domain context to the agents. Swapping domains means swapping
/// the injected value.
pub trait DomainContextProvider: Send + Sync {
    /// Extra guidance for requirements refinement (business rules, glossary).
    fn requirements_context(&self) -> String;

    /// Extra guidance for code generation (conventions, architecture).
    fn code_context(&self) -> String;

    /// Languages, frameworks and tools the repository uses.
    fn tech_stack(&self) -> Vec<String>;
}

/// Context loaded once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StaticDomainContext {
    pub requirements: String,
    pub code: String,
    pub tech_stack: Vec<String>,
}

impl StaticDomainContext {
    /// Parse a TOML document:
    ///
    /// ```toml
    /// requirements = "Payments go through Stripe."
    /// code = "Handlers live in src/routes."
    /// tech_stack = ["rust", "axum", "postgres"]
    /// ```
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl DomainContextProvider for StaticDomainContext {
    fn requirements_context(&self) -> String {
        self.requirements.clone()
    }

    fn code_context(&self) -> String {
        self.code.clone()
    }

    fn tech_stack(&self) -> Vec<String> {
        if self.tech_stack.is_empty() {
            vec!["general software development".to_string()]
        } else {
            self.tech_stack.clone()
        }
    }
}
