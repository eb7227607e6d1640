//! Merges `/api/tags` and `/api/show` responses into the foundation-model
//! table without duplicating rows and without overwriting already-populated
//! parameter blobs.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use gateway_core::json::safe_str;
use gateway_core::GatewayError;
use gateway_history::{FoundationModelCandidate, FoundationModelRow, HistoryStore};

/// `/api/tags` yields `{models: [...]}`; each entry becomes (or refreshes) a
/// FoundationModel row with `combined_inference_parameters = NULL`.
pub fn reconcile_api_tags(
    history: &HistoryStore,
    provider_identifiers: &str,
    accessed_at: DateTime<Utc>,
    tags: &Value,
) -> Result<Vec<FoundationModelRow>, GatewayError> {
    let entries = tags
        .get("models")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut reconciled = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(human_id) = safe_str(&entry, &["name"]) else {
            warn!("tags entry without a name, skipping: {entry}");
            continue;
        };
        let details = entry.get("details").cloned().unwrap_or_else(|| json!({}));
        let modified_at = safe_str(&entry, &["modified_at"])
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));

        let candidate = FoundationModelCandidate {
            human_id: human_id.to_string(),
            provider_identifiers: provider_identifiers.to_string(),
            model_identifiers: Some(json!({"details": details})),
            combined_inference_parameters: None,
            first_seen_at: Some(modified_at.unwrap_or(accessed_at)),
            last_seen: Some(modified_at.map_or(accessed_at, |m| m.max(accessed_at))),
        };

        let row = match history.lookup_foundation_model_detailed(&candidate)? {
            Some(existing) => history.merge_in_updates(existing.id, &candidate)?,
            None => history.insert_foundation_model(&candidate)?,
        };
        reconciled.push(row);
    }

    Ok(reconciled)
}

/// `/api/show` fills `combined_inference_parameters` for one model.
///
/// Rule: exact match on all four identity fields → merge; else a tags-only
/// match (same details, null parameters) is upgraded in place; else insert.
pub fn reconcile_api_show(
    history: &HistoryStore,
    provider_identifiers: &str,
    human_id: &str,
    accessed_at: DateTime<Utc>,
    show: &Value,
) -> Result<FoundationModelRow, GatewayError> {
    let mut details = json!({});
    let mut parameters = Map::new();

    if let Some(fields) = show.as_object() {
        for (key, value) in fields {
            match key.as_str() {
                "details" => details = value.clone(),
                // The parameter list comes back in random order.
                "parameters" => {
                    let mut lines: Vec<&str> = value
                        .as_str()
                        .unwrap_or_default()
                        .lines()
                        .collect();
                    lines.sort_unstable();
                    parameters.insert(key.clone(), Value::String(lines.join("\n")));
                }
                // The modelfile interleaves the same unordered parameters.
                "modelfile" => {
                    parameters.insert(
                        key.clone(),
                        Value::String("# modelfile omitted: field ordering is unstable".into()),
                    );
                }
                _ => {
                    parameters.insert(key.clone(), value.clone());
                }
            }
        }
    }

    let model_identifiers = json!({"details": details});
    let candidate = FoundationModelCandidate {
        human_id: human_id.to_string(),
        provider_identifiers: provider_identifiers.to_string(),
        model_identifiers: Some(model_identifiers.clone()),
        combined_inference_parameters: Some(Value::Object(parameters)),
        first_seen_at: Some(accessed_at),
        last_seen: Some(accessed_at),
    };

    if let Some(exact) = history.lookup_foundation_model_detailed(&candidate)? {
        return history.merge_in_updates(exact.id, &candidate);
    }

    let tags_only =
        history.lookup_tags_only_model(human_id, provider_identifiers, &model_identifiers)?;
    if let Some(unfilled) = tags_only {
        return history.merge_in_updates(unfilled.id, &candidate);
    }

    history.insert_foundation_model(&candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDER: &str = r#"{"endpoint":"http://localhost:11434","name":"ollama"}"#;

    fn tags_fixture() -> Value {
        json!({
            "models": [
                {
                    "name": "llama3:8b",
                    "modified_at": "2024-04-20T10:00:00Z",
                    "details": {"format": "gguf", "parameter_size": "8B"},
                },
                {
                    "name": "llama3:8b",
                    "modified_at": "2024-04-21T10:00:00Z",
                    "details": {"format": "gguf", "parameter_size": "70B"},
                },
            ],
        })
    }

    #[test]
    fn same_name_different_details_become_distinct_rows() {
        let history = HistoryStore::open_in_memory().unwrap();
        let rows = reconcile_api_tags(&history, PROVIDER, Utc::now(), &tags_fixture()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].id, rows[1].id);
        assert!(rows.iter().all(|r| r.combined_inference_parameters.is_none()));
    }

    #[test]
    fn repeated_tags_pull_reuses_rows() {
        let history = HistoryStore::open_in_memory().unwrap();
        let first = reconcile_api_tags(&history, PROVIDER, Utc::now(), &tags_fixture()).unwrap();
        let second = reconcile_api_tags(&history, PROVIDER, Utc::now(), &tags_fixture()).unwrap();
        let first_ids: Vec<_> = first.iter().map(|r| r.id).collect();
        let second_ids: Vec<_> = second.iter().map(|r| r.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn show_fills_exactly_the_matching_row() {
        let history = HistoryStore::open_in_memory().unwrap();
        reconcile_api_tags(&history, PROVIDER, Utc::now(), &tags_fixture()).unwrap();

        let show = json!({
            "details": {"format": "gguf", "parameter_size": "8B"},
            "template": "{{ .Prompt }}",
            "parameters": "stop \"z\"\nstop \"a\"",
            "modelfile": "FROM llama3\nPARAMETER stop a",
        });
        let filled =
            reconcile_api_show(&history, PROVIDER, "llama3:8b", Utc::now(), &show).unwrap();

        let params = filled.combined_inference_parameters.clone().unwrap();
        assert_eq!(params["template"], json!("{{ .Prompt }}"));
        // Parameter lines are stored sorted; the modelfile content is not
        // trusted at all.
        assert_eq!(params["parameters"], json!("stop \"a\"\nstop \"z\""));
        assert!(params["modelfile"].as_str().unwrap().starts_with("# modelfile omitted"));

        // The sibling row (different parameter_size) stays unfilled.
        let mut unfilled = 0;
        for id in 1..=2 {
            let row = history.get_foundation_model(id).unwrap().unwrap();
            if row.id != filled.id {
                assert!(row.combined_inference_parameters.is_none());
                unfilled += 1;
            }
        }
        assert_eq!(unfilled, 1);
    }

    #[test]
    fn show_for_unknown_model_inserts_a_fresh_row() {
        let history = HistoryStore::open_in_memory().unwrap();
        let show = json!({
            "details": {"format": "gguf"},
            "template": "{{ .Prompt }}",
        });
        let row =
            reconcile_api_show(&history, PROVIDER, "mystery:latest", Utc::now(), &show).unwrap();
        assert!(row.combined_inference_parameters.is_some());
    }

    #[test]
    fn repeated_show_merges_instead_of_duplicating() {
        let history = HistoryStore::open_in_memory().unwrap();
        let show = json!({
            "details": {"format": "gguf"},
            "template": "{{ .Prompt }}",
        });
        let first =
            reconcile_api_show(&history, PROVIDER, "llama3:8b", Utc::now(), &show).unwrap();
        let second =
            reconcile_api_show(&history, PROVIDER, "llama3:8b", Utc::now(), &show).unwrap();
        assert_eq!(first.id, second.id);
    }
}
