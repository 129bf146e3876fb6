//! Registry response parsing.

use serde::Deserialize;
use serde_json::Value;

/// Promoted fields of one registry model version, plus the verbatim payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteModel {
    pub model_id: u64,
    pub model_version_id: Option<u64>,
    /// Logical model name (falls back to the version name).
    pub name: Option<String>,
    pub version_name: Option<String>,
    pub base_model: Option<String>,
    pub model_type: Option<String>,
    pub raw: Value,
}

/// Answer to a lookup-by-hash request that reached the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(RemoteModel),
    /// The registry does not know this hash.
    NotFound,
    /// A success response that could not be interpreted.
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionPayload {
    id: Option<u64>,
    model_id: Option<u64>,
    name: Option<String>,
    base_model: Option<String>,
    model: Option<ModelSection>,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    name: Option<String>,
    #[serde(rename = "type")]
    model_type: Option<String>,
}

/// Interpret the body of a successful by-hash response.
pub fn parse_version_payload(body: &[u8]) -> LookupOutcome {
    let raw: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => return LookupOutcome::Malformed(format!("invalid JSON: {}", e)),
    };
    if !raw.is_object() {
        return LookupOutcome::Malformed("expected a JSON object".to_string());
    }

    let payload: VersionPayload = match serde_json::from_value(raw.clone()) {
        Ok(payload) => payload,
        Err(e) => return LookupOutcome::Malformed(format!("unexpected shape: {}", e)),
    };

    let Some(model_id) = payload.model_id else {
        return LookupOutcome::Malformed("missing modelId".to_string());
    };

    let (name, version_name) = match payload.model.as_ref().and_then(|m| m.name.clone()) {
        Some(model_name) => (Some(model_name), payload.name),
        None => (payload.name, None),
    };

    LookupOutcome::Found(RemoteModel {
        model_id,
        model_version_id: payload.id,
        name,
        version_name,
        base_model: payload.base_model,
        model_type: payload.model.and_then(|m| m.model_type),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_payload() {
        let body = json!({
            "id": 128713,
            "modelId": 4201,
            "name": "v6.0",
            "baseModel": "SD 1.5",
            "model": {"name": "Realistic Vision", "type": "Checkpoint", "nsfw": false},
            "files": [{"hashes": {"SHA256": "ABC"}}]
        });

        let LookupOutcome::Found(model) = parse_version_payload(body.to_string().as_bytes())
        else {
            panic!("expected found");
        };
        assert_eq!(model.model_id, 4201);
        assert_eq!(model.model_version_id, Some(128713));
        assert_eq!(model.name.as_deref(), Some("Realistic Vision"));
        assert_eq!(model.version_name.as_deref(), Some("v6.0"));
        assert_eq!(model.model_type.as_deref(), Some("Checkpoint"));
        assert_eq!(model.raw["files"][0]["hashes"]["SHA256"], "ABC");
    }

    #[test]
    fn test_parse_minimal_payload() {
        let outcome = parse_version_payload(br#"{"modelId": 42, "name": "X"}"#);
        let LookupOutcome::Found(model) = outcome else {
            panic!("expected found");
        };
        assert_eq!(model.model_id, 42);
        assert_eq!(model.name.as_deref(), Some("X"));
        assert_eq!(model.model_version_id, None);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_version_payload(b"<html>oops</html>"),
            LookupOutcome::Malformed(_)
        ));
        assert!(matches!(
            parse_version_payload(br#"{"id": 1, "name": "no model id"}"#),
            LookupOutcome::Malformed(_)
        ));
        assert!(matches!(
            parse_version_payload(b"[1, 2]"),
            LookupOutcome::Malformed(_)
        ));
        assert!(matches!(
            parse_version_payload(br#"{"modelId": "forty-two"}"#),
            LookupOutcome::Malformed(_)
        ));
    }
}
