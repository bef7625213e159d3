//! Slack summary rendering for role channels.

use crate::audience::{member_ids_with_role, primary_customer};
use crate::event::{Project, ProjectStatus, Role};
use crate::notification::{SlackAttachment, SlackField, SlackMessage};

/// Attachment color by project status
fn status_color(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::InReview => "#FEE75C",
        ProjectStatus::Reviewed => "#57F287",
        ProjectStatus::Active => "#3498DB",
        ProjectStatus::Cancelled => "#ED4245",
        _ => "#99AAB5",
    }
}

/// Summarize a project for managers or copilots.
pub fn summary(project: &Project, heading: &str, project_url: &str) -> SlackMessage {
    let link = format!("{}/{}", project_url.trim_end_matches('/'), project.id);
    let owner = primary_customer(project)
        .map(|m| m.user_id.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut fields = vec![
        SlackField {
            title: "Status".to_string(),
            value: project.status.as_str().to_string(),
            short: true,
        },
        SlackField {
            title: "Owner".to_string(),
            value: owner,
            short: true,
        },
    ];

    for (title, role) in [
        ("Customers", Role::Customer),
        ("Managers", Role::Manager),
        ("Copilots", Role::Copilot),
    ] {
        fields.push(SlackField {
            title: title.to_string(),
            value: member_ids_with_role(project, role).len().to_string(),
            short: true,
        });
    }

    SlackMessage {
        text: format!("{}: *{}*", heading, project.name),
        attachments: vec![SlackAttachment {
            title: project.name.clone(),
            title_link: link,
            text: project.description.clone().unwrap_or_default(),
            color: status_color(project.status).to_string(),
            fields,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{member, project};

    #[test]
    fn test_summary_structure() {
        let mut p = project(
            12,
            vec![
                member(1, Role::Customer, true),
                member(2, Role::Copilot, false),
            ],
        );
        p.status = ProjectStatus::Reviewed;

        let msg = summary(&p, "Project reviewed", "https://app/projects/");

        assert_eq!(msg.text, "Project reviewed: *Project 12*");
        let attachment = &msg.attachments[0];
        assert_eq!(attachment.title_link, "https://app/projects/12");
        assert_eq!(attachment.color, "#57F287");
        assert_eq!(attachment.fields[0].value, "reviewed");
        assert_eq!(attachment.fields[1].value, "1");
        assert_eq!(attachment.fields[4].title, "Copilots");
        assert_eq!(attachment.fields[4].value, "1");
    }

    #[test]
    fn test_summary_without_owner() {
        let msg = summary(&project(1, vec![]), "Heads up", "https://app/projects");
        assert_eq!(msg.attachments[0].fields[1].value, "unknown");
        assert_eq!(msg.attachments[0].color, "#99AAB5");
    }
}
