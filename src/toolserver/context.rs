//! Task-context reconstruction.
//!
//! Renders a task's history as Markdown for follow-up prompts: the original
//! request plus every prior dispatch that produced a structured result, in
//! start order. A pure function of the manifest and the envelopes.

use crate::store::{DispatchEnvelope, TaskManifest};

/// Build the `## Task History` blob. Dispatches without a structured
/// result are omitted; when none qualify the `### Previous Work` section is
/// dropped entirely.
pub fn build_task_context(manifest: &TaskManifest, envelopes: &[DispatchEnvelope]) -> String {
    let mut out = String::from("## Task History\n\n### Original Request\n");
    out.push_str(manifest.description.as_deref().unwrap_or(&manifest.name));
    out.push('\n');

    let mut finished: Vec<&DispatchEnvelope> = envelopes
        .iter()
        .filter(|e| e.structured_result.is_some())
        .collect();
    finished.sort_by_key(|e| e.started_at);

    if finished.is_empty() {
        return out;
    }

    out.push_str("\n### Previous Work\n");
    for envelope in finished {
        let Some(result) = &envelope.structured_result else {
            continue;
        };
        out.push_str(&format!(
            "\n**{}** ({}): {}\n",
            envelope.role,
            envelope.status.as_str(),
            result.summary
        ));
        push_list(&mut out, "Changes", &result.changes);
        push_list(&mut out, "Issues", &result.issues);
        push_list(&mut out, "Questions", &result.questions);
    }
    out
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{title}:\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DispatchStatus, ResultStatus, StructuredResult};
    use std::path::PathBuf;

    fn manifest() -> TaskManifest {
        TaskManifest::new(
            "Build login",
            "build-login",
            Some("Add a login endpoint".to_string()),
            None,
        )
    }

    fn envelope(id: &str, summary: Option<&str>) -> DispatchEnvelope {
        let mut e = DispatchEnvelope::new(
            id.to_string(),
            "build-login".into(),
            "api-dev".into(),
            "model".into(),
            PathBuf::from("/tmp"),
            None,
        );
        e.status = DispatchStatus::Completed;
        if let Some(summary) = summary {
            e.structured_result = Some(StructuredResult {
                status: ResultStatus::Success,
                summary: summary.to_string(),
                changes: vec!["added POST /login".to_string()],
                issues: vec![],
                questions: vec![],
                pr_url: None,
            });
        }
        e
    }

    #[test]
    fn renders_history_with_structured_results() {
        let envelopes = vec![
            envelope("01A", Some("Added login endpoint")),
            envelope("01B", None),
        ];
        let context = build_task_context(&manifest(), &envelopes);
        assert!(context.starts_with("## Task History"));
        assert!(context.contains("### Original Request\nAdd a login endpoint"));
        assert!(context.contains("### Previous Work"));
        assert!(context.contains("**api-dev** (completed): Added login endpoint"));
        assert!(context.contains("- added POST /login"));
    }

    #[test]
    fn previous_work_dropped_when_nothing_qualifies() {
        let envelopes = vec![envelope("01A", None)];
        let context = build_task_context(&manifest(), &envelopes);
        assert!(context.contains("### Original Request"));
        assert!(!context.contains("### Previous Work"));
    }

    #[test]
    fn entries_come_in_start_order() {
        let mut early = envelope("01A", Some("first work"));
        let mut late = envelope("01B", Some("second work"));
        early.started_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        late.started_at = chrono::Utc::now();
        // Hand them over out of order — the builder sorts by start time.
        let context = build_task_context(&manifest(), &[late, early]);
        let first = context.find("first work").expect("first present");
        let second = context.find("second work").expect("second present");
        assert!(first < second);
    }

    #[test]
    fn falls_back_to_task_name_without_description() {
        let manifest = TaskManifest::new("Build login", "build-login", None, None);
        let context = build_task_context(&manifest, &[]);
        assert!(context.contains("### Original Request\nBuild login"));
    }

    #[test]
    fn builder_is_pure() {
        let envelopes = vec![envelope("01A", Some("Added login endpoint"))];
        let a = build_task_context(&manifest(), &envelopes);
        let b = build_task_context(&manifest(), &envelopes);
        assert_eq!(a, b);
    }
}
