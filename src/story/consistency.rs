use serde::{Deserialize, Serialize};

/// Advisory result of comparing a story's topic-space with its workspace's current selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryConsistency {
    pub is_consistent: bool,
    pub message: String,
}

/// Checks that the story's referenced topic-space is still one the workspace references.
///
/// Never an error: an inconsistent story is still readable and saveable.
pub fn check_consistency(
    workspace_topic_space_ids: &[String],
    story_topic_space_id: Option<&str>,
) -> StoryConsistency {
    let Some(story_topic_space_id) = story_topic_space_id else {
        return StoryConsistency {
            is_consistent: true,
            message: "No story for this workspace; consistency check skipped".to_string(),
        };
    };
    if workspace_topic_space_ids
        .iter()
        .any(|id| id == story_topic_space_id)
    {
        StoryConsistency {
            is_consistent: true,
            message: format!(
                "Story topic-space {story_topic_space_id} is referenced by the workspace"
            ),
        }
    } else {
        tracing::warn!(
            "[check_consistency] Story topic-space {} not in workspace topic-spaces {:?}",
            story_topic_space_id,
            workspace_topic_space_ids
        );
        StoryConsistency {
            is_consistent: false,
            message: format!(
                "Story was built from topic-space {story_topic_space_id}, but the workspace now references [{}]",
                workspace_topic_space_ids.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn referenced_topic_space_is_consistent() {
        let result = check_consistency(&ids(&["T1", "T2"]), Some("T1"));
        assert!(result.is_consistent);
    }

    #[test]
    fn drifted_topic_space_names_both_sides() {
        let result = check_consistency(&ids(&["T2"]), Some("T1"));
        assert!(!result.is_consistent);
        assert!(result.message.contains("T1"), "{}", result.message);
        assert!(result.message.contains("T2"), "{}", result.message);
    }

    #[test]
    fn missing_story_is_skipped() {
        let result = check_consistency(&ids(&["T2"]), None);
        assert!(result.is_consistent);
        assert!(result.message.contains("skipped"));
    }

    #[test]
    fn empty_workspace_selection_is_inconsistent() {
        let result = check_consistency(&[], Some("T1"));
        assert!(!result.is_consistent);
    }
}
