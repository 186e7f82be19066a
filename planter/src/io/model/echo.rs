//! Offline stand-in used when no model credential resolves.

use super::{DeltaSink, Model, ModelError};
use crate::core::types::{DeltaKind, Message, ModelReply, ModelRequest};

/// Answers immediately with the configuration problem instead of calling out.
#[derive(Debug, Clone)]
pub struct EchoFallbackModel {
    note: String,
}

impl EchoFallbackModel {
    pub fn new(note: impl Into<String>) -> Self {
        Self { note: note.into() }
    }
}

impl Model for EchoFallbackModel {
    fn name(&self) -> &str {
        "echo-fallback"
    }

    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        let objective = request
            .messages
            .iter()
            .find_map(|message| match message {
                Message::User(text) => text.lines().next(),
                _ => None,
            })
            .unwrap_or_default();
        let answer = format!(
            "No model is configured, so no investigation was run.\n\
             Configuration error: {}\n\
             Objective: {objective}",
            self.note
        );
        on_delta(DeltaKind::Text, &answer);
        Ok(ModelReply::final_answer(answer))
    }

    fn fallback_note(&self) -> Option<&str> {
        Some(&self.note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ModelResponse;

    #[test]
    fn echoes_note_and_objective_deterministically() {
        let model = EchoFallbackModel::new("no API key");
        let messages = [Message::User("Objective: count files\nmore".to_string())];
        let request = ModelRequest {
            system: "",
            messages: &messages,
            tools: &[],
            reasoning_effort: None,
        };
        let mut streamed = String::new();
        let reply = model
            .invoke(&request, &mut |_, text: &str| streamed.push_str(text))
            .expect("reply");
        let ModelResponse::FinalAnswer(answer) = reply.response else {
            panic!("expected final answer");
        };
        assert!(answer.contains("Configuration error: no API key"));
        assert!(answer.contains("Objective: Objective: count files"));
        assert_eq!(streamed, answer);
        assert_eq!(model.fallback_note(), Some("no API key"));
    }
}
