use serde::{Deserialize, Serialize};

use crate::category::{Category, ClassificationResult};

/// A project created/updated event as published by the projects service.
///
/// Only the fields the worker needs are kept, every other field of the producer's
/// payload is ignored. All fields are optional at this level: whether an event is
/// complete enough to classify is decided by [`ProjectEvent::classifiable`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvent {
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub event_type: Option<String>,
}

/// The parts of a [`ProjectEvent`] required to classify it.
#[derive(Debug, PartialEq, Eq)]
pub struct ClassifiableProject<'a> {
    pub project_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
}

impl ProjectEvent {
    /// Returns `None` if the project id or the description is missing or empty.
    /// A missing title is classified as an empty one.
    pub fn classifiable(&self) -> Option<ClassifiableProject<'_>> {
        let project_id = self.project_id.as_deref().filter(|id| !id.is_empty())?;
        let description = self
            .description
            .as_deref()
            .filter(|description| !description.is_empty())?;

        Some(ClassifiableProject {
            project_id,
            title: self.title.as_deref().unwrap_or_default(),
            description,
        })
    }
}

/// The enriched event republished under the categorized routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizedEvent {
    pub project_id: String,
    pub main_category: Category,
    pub tags: Vec<String>,
    /// Seconds since the unix epoch, with sub-second precision.
    pub categorized_at: f64,
    pub original_event_type: Option<String>,
}

impl CategorizedEvent {
    pub fn new(
        project_id: &str,
        classification: ClassificationResult,
        categorized_at: f64,
        original_event_type: Option<String>,
    ) -> Self {
        Self {
            project_id: project_id.to_owned(),
            main_category: classification.main_category,
            tags: classification.tags,
            categorized_at,
            original_event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deserialize_ignores_extra_fields() {
        let event: ProjectEvent = serde_json::from_value(json!({
            "eventType": "CREATED",
            "projectId": "3f2c6a6e-1f7e-4b9e-9a43-0e5b0d9d2b11",
            "employerId": "8a1d",
            "title": "API in Go",
            "description": "Build a REST API using Go and PostgreSQL",
            "status": "OPEN",
            "minSalary": 100.0,
            "requiredSkills": ["Go"],
        }))
        .unwrap();

        assert_eq!(event.event_type.as_deref(), Some("CREATED"));
        assert_eq!(
            event.project_id.as_deref(),
            Some("3f2c6a6e-1f7e-4b9e-9a43-0e5b0d9d2b11")
        );
    }

    #[test]
    fn test_classifiable_requires_id_and_description() {
        let complete = ProjectEvent {
            project_id: Some("p1".to_owned()),
            title: None,
            description: Some("Build a REST API".to_owned()),
            event_type: None,
        };
        assert_eq!(
            complete.classifiable(),
            Some(ClassifiableProject {
                project_id: "p1",
                title: "",
                description: "Build a REST API",
            })
        );

        let empty_description = ProjectEvent {
            description: Some(String::new()),
            ..complete.clone()
        };
        assert_eq!(empty_description.classifiable(), None);

        let missing_id = ProjectEvent {
            project_id: None,
            ..complete.clone()
        };
        assert_eq!(missing_id.classifiable(), None);

        let empty_id = ProjectEvent {
            project_id: Some(String::new()),
            ..complete
        };
        assert_eq!(empty_id.classifiable(), None);
    }

    #[test]
    fn test_null_fields_are_missing() {
        let event: ProjectEvent = serde_json::from_value(json!({
            "projectId": "p2",
            "description": null,
        }))
        .unwrap();
        assert_eq!(event.classifiable(), None);
    }

    #[test]
    fn test_categorized_event_wire_format() {
        let event = CategorizedEvent::new(
            "p1",
            ClassificationResult::new(
                Category::SoftwareDevelopment,
                vec!["Go".to_owned(), "PostgreSQL".to_owned()],
            ),
            1_700_000_000.5,
            None,
        );

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "projectId": "p1",
                "mainCategory": "Desarrollo de Software",
                "tags": ["Go", "PostgreSQL"],
                "categorizedAt": 1_700_000_000.5,
                "originalEventType": null,
            })
        );
    }
}
