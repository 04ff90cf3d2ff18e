use serde::{Deserialize, Serialize};

pub const ROLE_USER: &str = "user";
pub const ROLE_MODEL: &str = "model";

/// A message body: an optional role tag plus ordered parts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    FunctionResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        response: serde_json::Value,
    },
}

impl Content {
    pub fn new(role: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role.into()),
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(ROLE_USER, vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(ROLE_MODEL, vec![Part::text(text)])
    }

    /// Concatenation of all text parts, in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn function_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Part::FunctionCall {
            id: None,
            name: name.into(),
            args,
        }
    }

    pub fn function_response(name: impl Into<String>, response: serde_json::Value) -> Self {
        Part::FunctionResponse {
            id: None,
            name: name.into(),
            response,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Part::FunctionCall { .. })
    }

    pub fn is_function_response(&self) -> bool {
        matches!(self, Part::FunctionResponse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_joins_only_text_parts() {
        let content = Content::new(
            ROLE_MODEL,
            vec![
                Part::text("hel"),
                Part::function_call("lookup", serde_json::json!({"q": "x"})),
                Part::text("lo"),
            ],
        );
        assert_eq!(content.text(), "hello");
    }

    #[test]
    fn part_tagging_is_snake_case() {
        let json = serde_json::to_value(Part::function_response(
            "lookup",
            serde_json::json!({"ok": true}),
        ))
        .unwrap();
        assert_eq!(json["type"], "function_response");
        assert_eq!(json["name"], "lookup");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn user_text_sets_role() {
        let c = Content::user_text("hi");
        assert_eq!(c.role.as_deref(), Some(ROLE_USER));
        assert!(!c.is_empty());
    }
}
