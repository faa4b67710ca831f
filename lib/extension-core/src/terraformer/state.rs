use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{CoreError, Result};

#[derive(Debug, Default, Deserialize)]
struct State {
    #[serde(default)]
    outputs: BTreeMap<String, Output>,
    // terraform < 0.12 nests outputs per module
    #[serde(default)]
    modules: Vec<Module>,
}

#[derive(Debug, Default, Deserialize)]
struct Module {
    #[serde(default)]
    outputs: BTreeMap<String, Output>,
}

#[derive(Debug, Deserialize)]
struct Output {
    value: Value,
}

/// Extract the requested output variables from a terraform state document.
///
/// An empty document means the engine never produced a state. Non-string
/// values are returned in their JSON encoding.
pub fn parse_state_outputs(state: &str, keys: &[&str]) -> Result<BTreeMap<String, String>> {
    let missing_all = || CoreError::VariablesNotFound(keys.iter().map(|k| k.to_string()).collect());

    if state.trim().is_empty() {
        return Err(missing_all());
    }

    let state: State = serde_json::from_str(state)?;
    let mut outputs = state.outputs;
    for module in state.modules {
        for (key, output) in module.outputs {
            outputs.entry(key).or_insert(output);
        }
    }

    let mut found = BTreeMap::new();
    let mut missing = Vec::new();
    for key in keys {
        match outputs.get(*key) {
            Some(Output { value: Value::String(s) }) => {
                found.insert(key.to_string(), s.clone());
            }
            Some(Output { value: Value::Null }) | None => missing.push(key.to_string()),
            Some(Output { value }) => {
                found.insert(key.to_string(), value.to_string());
            }
        }
    }

    if !missing.is_empty() {
        return Err(CoreError::VariablesNotFound(missing));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4_state() {
        let state = r#"{
            "version": 4,
            "outputs": {
                "vpc_name": {"value": "shoot--foo--bar", "type": "string"},
                "subnet_nodes": {"value": "shoot--foo--bar-nodes", "type": "string"},
                "unrelated": {"value": "x", "type": "string"}
            },
            "resources": []
        }"#;

        let vars = parse_state_outputs(state, &["vpc_name", "subnet_nodes"]).unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["vpc_name"], "shoot--foo--bar");
        assert_eq!(vars["subnet_nodes"], "shoot--foo--bar-nodes");
    }

    #[test]
    fn test_parse_legacy_module_state() {
        let state = r#"{
            "version": 3,
            "modules": [
                {"path": ["root"], "outputs": {"vpc_name": {"sensitive": false, "type": "string", "value": "vpc"}}}
            ]
        }"#;

        let vars = parse_state_outputs(state, &["vpc_name"]).unwrap();
        assert_eq!(vars["vpc_name"], "vpc");
    }

    #[test]
    fn test_empty_state() {
        match parse_state_outputs("", &["vpc_name", "subnet_nodes"]) {
            Err(CoreError::VariablesNotFound(keys)) => {
                assert_eq!(keys, vec!["vpc_name", "subnet_nodes"])
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_key() {
        let state = r#"{"version": 4, "outputs": {"vpc_name": {"value": "vpc"}}}"#;
        match parse_state_outputs(state, &["vpc_name", "service_account_email"]) {
            Err(CoreError::VariablesNotFound(keys)) => {
                assert_eq!(keys, vec!["service_account_email"])
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_state_without_outputs() {
        let state = r#"{"version": 4, "resources": []}"#;
        assert!(matches!(
            parse_state_outputs(state, &["vpc_name"]),
            Err(CoreError::VariablesNotFound(_))
        ));
    }

    #[test]
    fn test_non_string_value() {
        let state = r#"{"version": 4, "outputs": {"count": {"value": 3}}}"#;
        assert_eq!(parse_state_outputs(state, &["count"]).unwrap()["count"], "3");
    }

    #[test]
    fn test_malformed_state() {
        assert!(matches!(
            parse_state_outputs("{not json", &["vpc_name"]),
            Err(CoreError::SerializationError(_))
        ));
    }
}
