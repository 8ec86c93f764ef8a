use crate::error::{BridgeError, BridgeResult};
use crate::golden::validate_name;
use crate::model::{FlowDefinition, Predicate, StepAction, FLOW_VERSION};
use regex::Regex;
use std::fs;
use std::path::Path;

/// Load a flow document; `.yaml`/`.yml` are YAML, everything else JSON.
pub fn load_flow_file(path: &Path) -> BridgeResult<FlowDefinition> {
    let data =
        fs::read_to_string(path).map_err(|err| BridgeError::io("failed to read flow file", err))?;
    let name = path.to_string_lossy();
    let flow = if name.ends_with(".yaml") || name.ends_with(".yml") {
        parse_flow_yaml(&data)?
    } else {
        parse_flow_json(&data)?
    };
    validate_flow(&flow)?;
    Ok(flow)
}

pub fn parse_flow_json(data: &str) -> BridgeResult<FlowDefinition> {
    serde_json::from_str(data).map_err(|err| {
        BridgeError::validation(
            "failed to parse flow json",
            serde_json::json!({"source": err.to_string()}),
        )
    })
}

pub fn parse_flow_yaml(data: &str) -> BridgeResult<FlowDefinition> {
    serde_yml::from_str(data).map_err(|err| {
        BridgeError::validation(
            "failed to parse flow yaml",
            serde_json::json!({"source": err.to_string()}),
        )
    })
}

/// Structural checks that do not need a session.
pub fn validate_flow(flow: &FlowDefinition) -> BridgeResult<()> {
    if flow.flow_version != FLOW_VERSION {
        return Err(BridgeError::validation(
            "unsupported flow_version",
            serde_json::json!({"flow_version": flow.flow_version, "supported": FLOW_VERSION}),
        ));
    }
    if flow.steps.is_empty() {
        return Err(BridgeError::validation(
            "flow has no steps",
            serde_json::json!({"flow": flow.name}),
        ));
    }
    for step in flow.steps.iter().chain(&flow.recovery) {
        match &step.action {
            StepAction::SaveGolden { golden } => validate_name(golden)?,
            StepAction::Assert(predicate) => validate_predicate(predicate)?,
            _ => {}
        }
    }
    if let Some(step) = flow
        .recovery
        .iter()
        .find(|step| matches!(step.action, StepAction::Connect { .. }))
    {
        return Err(BridgeError::validation(
            "recovery steps cannot connect",
            serde_json::json!({"step": step.label()}),
        ));
    }
    Ok(())
}

fn validate_predicate(predicate: &Predicate) -> BridgeResult<()> {
    match predicate {
        Predicate::Golden { name } => validate_name(name),
        Predicate::Matches { pattern } => Regex::new(pattern).map(|_| ()).map_err(|err| {
            BridgeError::validation(
                "invalid pattern in matches predicate",
                serde_json::json!({"pattern": pattern, "source": err.to_string()}),
            )
        }),
        Predicate::All { predicates } | Predicate::Any { predicates } => {
            if predicates.is_empty() {
                return Err(BridgeError::validation(
                    "predicate group is empty",
                    serde_json::json!({"predicate": predicate}),
                ));
            }
            predicates.iter().try_for_each(validate_predicate)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::model::{ActionTarget, Key, WaitCondition};

    const LOGON_YAML: &str = r#"
name: tso-logon
variables:
  applid: TSO
steps:
  - type: connect
  - type: wait
    condition: text
    text: "Logon ===>"
    timeout_ms: 5000
  - type: fill
    name: userid
    target: { label: "Logon ===>", offset: 1 }
    value: "${user}"
  - type: press
    key: enter
  - type: assert
    predicate: text_present
    text: "ENTER PASSWORD"
recovery:
  - type: press
    key: PF3
"#;

    #[test]
    fn parses_yaml_flow() {
        let flow = parse_flow_yaml(LOGON_YAML).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(flow.steps.len(), 5);
        assert!(matches!(
            &flow.steps[1].action,
            StepAction::Wait(WaitCondition::Text { text }) if text == "Logon ===>"
        ));
        assert!(matches!(
            &flow.steps[2].action,
            StepAction::Fill { target: ActionTarget::Label { offset: 1, .. }, .. }
        ));
        assert!(matches!(flow.steps[3].action, StepAction::Press { key: Key::Enter }));
        assert_eq!(flow.steps[1].timeout_ms, Some(5000));
        assert!(validate_flow(&flow).is_ok());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_golden_names() {
        let bad_key = r#"{"name":"x","steps":[{"type":"press","key":"F13"}]}"#;
        assert!(parse_flow_json(bad_key).is_err());

        let bad_golden = r#"{"name":"x","steps":[{"type":"save_golden","golden":"../x"}]}"#;
        let flow = parse_flow_json(bad_golden).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_err());
    }

    #[test]
    fn empty_flows_are_rejected() {
        let flow = parse_flow_json(r#"{"name":"x","steps":[]}"#).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_err());
    }

    #[test]
    fn parses_predicate_groups() {
        let yaml = r#"
name: ready-check
steps:
  - type: assert
    predicate: any
    predicates:
      - predicate: text_present
        text: READY
      - predicate: all
        predicates:
          - predicate: matches
            pattern: "IKJ\\d{5}I"
          - predicate: keyboard_unlocked
"#;
        let flow = parse_flow_yaml(yaml).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_ok());
        let StepAction::Assert(Predicate::Any { predicates }) = &flow.steps[0].action else {
            panic!("expected an any group");
        };
        assert_eq!(predicates.len(), 2);
        assert!(matches!(&predicates[1], Predicate::All { predicates } if predicates.len() == 2));
    }

    #[test]
    fn rejects_bad_patterns_and_empty_groups() {
        let bad_pattern = r#"{"name":"x","steps":[{"type":"assert","predicate":"matches","pattern":"(READY"}]}"#;
        let flow = parse_flow_json(bad_pattern).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_err());

        let empty = r#"{"name":"x","steps":[{"type":"assert","predicate":"all","predicates":[]}]}"#;
        let flow = parse_flow_json(empty).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_err());

        let nested_golden = r#"{"name":"x","steps":[{"type":"assert","predicate":"any","predicates":[{"predicate":"golden","name":"../x"}]}]}"#;
        let flow = parse_flow_json(nested_golden).unwrap_or_else(|e| panic!("{e}"));
        assert!(validate_flow(&flow).is_err());
    }
}
