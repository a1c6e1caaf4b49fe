//! Persona definitions: built-ins plus an optional `personas.toml` overlay.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    id: String,
    name: String,
    prompt: String,
    description: Option<String>,
}

impl Persona {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
        description: Option<String>,
    ) -> anyhow::Result<Self> {
        let id = id.into().trim().to_string();
        let name = name.into().trim().to_string();
        let prompt = prompt.into().trim().to_string();

        if id.is_empty() {
            anyhow::bail!("persona id must not be empty");
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || id.starts_with('-')
            || id.ends_with('-')
        {
            anyhow::bail!("persona id '{id}' must be kebab-case");
        }
        if prompt.is_empty() {
            anyhow::bail!("persona '{id}' has an empty prompt");
        }
        let name = if name.is_empty() { id.clone() } else { name };

        Ok(Self {
            id,
            name,
            prompt,
            description: description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct PersonaFile {
    #[serde(default)]
    personas: Vec<PersonaEntry>,
}

#[derive(Debug, Deserialize)]
struct PersonaEntry {
    id: String,
    #[serde(default)]
    name: String,
    prompt: String,
    description: Option<String>,
}

const BUILTINS: &[(&str, &str, &str, &str)] = &[
    (
        "assistant",
        "Assistant",
        "You are a helpful, concise assistant. Answer clearly and admit when you are unsure.",
        "General-purpose helper",
    ),
    (
        "grumpy-historian",
        "Grumpy Historian",
        "You are a grumpy but brilliant historian. You answer accurately and in depth, while \
grumbling about how nobody reads primary sources anymore. Never let the grumpiness get in \
the way of a correct answer.",
        "Accurate history with a side of complaints",
    ),
    (
        "pirate",
        "Captain Byte",
        "You are a cheerful pirate captain. Answer every question helpfully, speaking like a \
pirate but keeping technical details precise.",
        "Helpful answers, pirate voice",
    ),
];

pub struct PersonaRegistry {
    personas: BTreeMap<String, Persona>,
}

impl PersonaRegistry {
    pub fn builtin() -> Self {
        let personas = BUILTINS
            .iter()
            .filter_map(|(id, name, prompt, desc)| {
                Persona::new(*id, *name, *prompt, Some(desc.to_string())).ok()
            })
            .map(|p| (p.id.clone(), p))
            .collect();
        Self { personas }
    }

    /// Built-ins overlaid with the entries from `path`. A missing file is not an error.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut registry = Self::builtin();
        let path = path.as_ref();
        if !path.exists() {
            return Ok(registry);
        }

        let content = fs::read_to_string(path)?;
        let file: PersonaFile = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid persona file {}: {}", path.display(), e))?;

        let mut loaded = 0;
        for entry in file.personas {
            match Persona::new(entry.id, entry.name, entry.prompt, entry.description) {
                Ok(persona) => {
                    registry.insert(persona);
                    loaded += 1;
                }
                Err(e) => warn!("Personas: skipping entry in {}: {}", path.display(), e),
            }
        }
        info!("Personas: loaded {} from {}", loaded, path.display());
        Ok(registry)
    }

    pub fn insert(&mut self, persona: Persona) {
        self.personas.insert(persona.id.clone(), persona);
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.get(id)
    }

    /// Sorted persona ids.
    pub fn ids(&self) -> Vec<String> {
        self.personas.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
