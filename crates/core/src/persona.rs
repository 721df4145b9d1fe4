use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("Failed to read persona file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid persona JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("interruption_sensitivity must be within 0.0..=1.0, got {0}")]
    Sensitivity(f32),
}

fn default_sensitivity() -> f32 {
    0.5
}

/// The character a host process speaks as.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPersona {
    pub id: String,
    pub name: String,
    pub voice_id: String,
    pub system_prompt: String,
    #[serde(default = "default_sensitivity")]
    pub interruption_sensitivity: f32,
    #[serde(default)]
    pub voice_settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub interaction_rules: Vec<String>,
    /// Handle under which this host is known to other agents.
    #[serde(default, alias = "a2a_id")]
    pub external_id: Option<String>,
}

impl HostPersona {
    /// Parses and validates a persona from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, PersonaError> {
        let persona: HostPersona = serde_json::from_str(json)?;
        if !(0.0..=1.0).contains(&persona.interruption_sensitivity) {
            return Err(PersonaError::Sensitivity(persona.interruption_sensitivity));
        }
        Ok(persona)
    }

    pub fn load(path: &Path) -> Result<Self, PersonaError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PersonaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Renders the instruction block handed to the dialogue generator for one turn.
    pub fn instructions_for(&self, label: &str, content: &str) -> String {
        let voice_settings =
            serde_json::to_string(&self.voice_settings).unwrap_or_else(|_| "{}".to_string());
        let rules = if self.interaction_rules.is_empty() {
            "none".to_string()
        } else {
            self.interaction_rules
                .iter()
                .map(|r| format!("- {r}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You are {name}, a podcast host.\n\
             Your personality: {prompt}\n\
             Voice Settings: {voice_settings}\n\
             Interaction Rules:\n{rules}\n\n\
             Current Topic: {label}\n\
             Key Facts: {content}\n\n\
             Task: Engage in a natural conversation. You are live on air.",
            name = self.name,
            prompt = self.system_prompt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SASCHA: &str = r#"{
        "id": "host_sascha",
        "name": "Sascha",
        "voice_id": "voice_123",
        "system_prompt": "Curious and warm.",
        "voice_settings": {"stability": 0.5},
        "interaction_rules": ["Be nice"],
        "a2a_id": "agent_sascha"
    }"#;

    #[test]
    fn test_persona_parses_with_defaults_and_alias() {
        let persona = HostPersona::from_json(SASCHA).unwrap();
        assert_eq!(persona.name, "Sascha");
        assert_eq!(persona.interruption_sensitivity, 0.5);
        assert_eq!(persona.voice_settings["stability"], 0.5);
        assert_eq!(persona.interaction_rules, vec!["Be nice".to_string()]);
        assert_eq!(persona.external_id.as_deref(), Some("agent_sascha"));
    }

    #[test]
    fn test_persona_rejects_out_of_range_sensitivity() {
        let json = r#"{"id":"x","name":"X","voice_id":"v","system_prompt":"p","interruption_sensitivity":1.5}"#;
        assert!(matches!(
            HostPersona::from_json(json),
            Err(PersonaError::Sensitivity(_))
        ));
    }

    #[test]
    fn test_persona_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SASCHA.as_bytes()).unwrap();
        let persona = HostPersona::load(file.path()).unwrap();
        assert_eq!(persona.id, "host_sascha");

        let missing = HostPersona::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(PersonaError::Read { .. })));
    }

    #[test]
    fn test_instructions_include_topic_and_rules() {
        let persona = HostPersona::from_json(SASCHA).unwrap();
        let text = persona.instructions_for("Intro", "Welcome everyone");
        assert!(text.contains("You are Sascha"));
        assert!(text.contains("Current Topic: Intro"));
        assert!(text.contains("Key Facts: Welcome everyone"));
        assert!(text.contains("- Be nice"));
    }
}
