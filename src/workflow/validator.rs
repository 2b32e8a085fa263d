//! Workflow definition validation.

use serde_json::Value;

use super::expression::check_syntax;
use super::types::{EventTriggerConfig, Schedule, StepSpec, TriggerType};
use crate::error::{Error, Result};

/// The parts of a definition that are checked before it is stored.
pub struct DefinitionDraft<'a> {
    pub name: &'a str,
    pub steps: &'a [Value],
    pub schedule: Option<&'a Schedule>,
    pub trigger_type: TriggerType,
    pub trigger_config: Option<&'a EventTriggerConfig>,
}

/// Validate a workflow definition.
///
/// Checks for:
/// - A non-empty name
/// - At least one step
/// - Every step (including condition branches) has a recognized kind and
///   the fields that kind requires
/// - Condition expressions parse
/// - Schedules have an interval of at least 1
/// - Event triggers carry an event configuration
pub fn validate_definition(draft: &DefinitionDraft<'_>) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(Error::Validation("Workflow name is required".into()));
    }

    if draft.steps.is_empty() {
        return Err(Error::Validation(
            "Workflow must have at least one step".into(),
        ));
    }

    validate_steps(draft.steps, "steps")?;

    if let Some(schedule) = draft.schedule {
        if schedule.interval < 1 {
            return Err(Error::Validation(
                "Schedule interval must be at least 1".into(),
            ));
        }
        schedule.period()?;
    }

    match draft.trigger_type {
        TriggerType::Schedule if draft.schedule.is_none() => Err(Error::Validation(
            "Trigger type 'schedule' requires a schedule".into(),
        )),
        TriggerType::Event if draft.trigger_config.is_none() => Err(Error::Validation(
            "Trigger type 'event' requires a trigger_config".into(),
        )),
        _ => Ok(()),
    }
}

fn validate_steps(steps: &[Value], path: &str) -> Result<()> {
    for (index, raw) in steps.iter().enumerate() {
        let location = format!("{}[{}]", path, index);
        let spec = StepSpec::from_value(raw).map_err(|e| match e {
            Error::UnknownKind(kind) => Error::Validation(format!(
                "{}: unknown {} (expected one of: {})",
                location,
                kind,
                StepSpec::KINDS.join(", ")
            )),
            Error::Validation(msg) => Error::Validation(format!("{}: {}", location, msg)),
            other => other,
        })?;

        match &spec {
            StepSpec::WebScrape(web) if web.url.trim().is_empty() => {
                return Err(Error::Validation(format!("{}: 'url' is required", location)));
            }
            StepSpec::DataStore(store) => {
                if store.data_type.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::Validation(format!(
                        "{}: 'data_type' is required",
                        location
                    )));
                }
                if store.value_source.is_none() && store.value.is_none() {
                    return Err(Error::Validation(format!(
                        "{}: 'value_source' is required",
                        location
                    )));
                }
            }
            StepSpec::Condition(condition) => {
                check_syntax(&condition.condition).map_err(|e| {
                    Error::Validation(format!("{}: invalid condition: {}", location, e))
                })?;
                validate_steps(&condition.then_steps, &format!("{}.then", location))?;
                validate_steps(&condition.else_steps, &format!("{}.else", location))?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Frequency, WatchedKind};
    use serde_json::json;

    fn draft<'a>(steps: &'a [Value]) -> DefinitionDraft<'a> {
        DefinitionDraft {
            name: "lookup",
            steps,
            schedule: None,
            trigger_type: TriggerType::Manual,
            trigger_config: None,
        }
    }

    #[test]
    fn test_valid_manual_workflow() {
        let steps = vec![
            json!({"type": "api_query", "api_selection": "auto"}),
            json!({"type": "llm_analysis", "analysis_type": "analyze_results"}),
        ];
        assert!(validate_definition(&draft(&steps)).is_ok());
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let steps = vec![json!({"type": "send_email"})];
        let err = validate_definition(&draft(&steps)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("steps[0]"));
    }

    #[test]
    fn test_rejects_missing_kind() {
        let steps = vec![json!({"url": "https://example.com"})];
        assert!(matches!(
            validate_definition(&draft(&steps)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_kind_in_nested_branch() {
        let steps = vec![json!({
            "type": "condition",
            "condition": "$count > 3",
            "else": [{"type": "bogus"}]
        })];
        let err = validate_definition(&draft(&steps)).unwrap_err();
        assert!(err.to_string().contains("steps[0].else[0]"));
    }

    #[test]
    fn test_rejects_bad_condition_syntax() {
        let steps = vec![json!({"type": "condition", "condition": "$count >"})];
        assert!(validate_definition(&draft(&steps)).is_err());
    }

    #[test]
    fn test_rejects_empty_steps_and_name() {
        assert!(validate_definition(&draft(&[])).is_err());

        let steps = vec![json!({"type": "web_scrape", "url": "https://example.com"})];
        let mut d = draft(&steps);
        d.name = " ";
        assert!(validate_definition(&d).is_err());
    }

    #[test]
    fn test_data_store_requires_kind_and_value() {
        let steps = vec![json!({"type": "data_store", "store_type": "datapoint", "value_source": "$x"})];
        assert!(validate_definition(&draft(&steps)).is_err());

        let steps = vec![json!({"type": "data_store", "store_type": "datapoint", "data_type": "email"})];
        assert!(validate_definition(&draft(&steps)).is_err());

        let steps = vec![json!({
            "type": "data_store", "store_type": "datapoint",
            "data_type": "email", "value_source": "$scraped_content"
        })];
        assert!(validate_definition(&draft(&steps)).is_ok());
    }

    #[test]
    fn test_trigger_requirements() {
        let steps = vec![json!({"type": "web_scrape", "url": "https://example.com"})];

        let mut d = draft(&steps);
        d.trigger_type = TriggerType::Event;
        assert!(validate_definition(&d).is_err());

        let config = EventTriggerConfig {
            watch: WatchedKind::NewCase,
            data_kind: None,
        };
        d.trigger_config = Some(&config);
        assert!(validate_definition(&d).is_ok());

        let zero = Schedule {
            frequency: Frequency::Hourly,
            interval: 0,
        };
        let mut d = draft(&steps);
        d.trigger_type = TriggerType::Schedule;
        d.schedule = Some(&zero);
        assert!(validate_definition(&d).is_err());
    }

    #[test]
    fn test_rejects_schedule_too_long_to_evaluate() {
        let steps = vec![json!({"type": "web_scrape", "url": "https://example.com"})];
        let huge = Schedule {
            frequency: Frequency::Weekly,
            interval: 1_000_000_000,
        };
        let mut d = draft(&steps);
        d.trigger_type = TriggerType::Schedule;
        d.schedule = Some(&huge);
        let err = validate_definition(&d).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
