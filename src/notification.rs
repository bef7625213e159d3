//! Outbound notification descriptors.
//!
//! Builders emit [`Notification`] values; the dispatcher classifies them,
//! serializes the publishable ones and hands repost directives to the
//! scheduler.

use crate::event::Role;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Direct notification types understood by the general notification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "project.created")]
    ProjectCreated,
    #[serde(rename = "project.submittedForReview")]
    SubmittedForReview,
    #[serde(rename = "project.availableForReview")]
    AvailableForReview,
    #[serde(rename = "project.reviewed")]
    Reviewed,
    #[serde(rename = "project.availableToClaim")]
    AvailableToClaim,
    #[serde(rename = "project.member.joined")]
    MemberJoined,
    #[serde(rename = "project.member.managerJoined")]
    ManagerJoined,
    #[serde(rename = "project.member.copilotJoined")]
    CopilotJoined,
    #[serde(rename = "project.member.left")]
    MemberLeft,
    #[serde(rename = "project.member.removed")]
    MemberRemoved,
    #[serde(rename = "project.member.ownerChanged")]
    OwnerChanged,
}

impl NotificationType {
    /// Wire name used as the notification `type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project.created",
            Self::SubmittedForReview => "project.submittedForReview",
            Self::AvailableForReview => "project.availableForReview",
            Self::Reviewed => "project.reviewed",
            Self::AvailableToClaim => "project.availableToClaim",
            Self::MemberJoined => "project.member.joined",
            Self::ManagerJoined => "project.member.managerJoined",
            Self::CopilotJoined => "project.member.copilotJoined",
            Self::MemberLeft => "project.member.left",
            Self::MemberRemoved => "project.member.removed",
            Self::OwnerChanged => "project.member.ownerChanged",
        }
    }

    /// Short human subject.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "created",
            Self::SubmittedForReview => "submitted for review",
            Self::AvailableForReview => "available for review",
            Self::Reviewed => "reviewed",
            Self::AvailableToClaim => "available to claim",
            Self::MemberJoined => "team member added",
            Self::ManagerJoined => "manager joined",
            Self::CopilotJoined => "copilot joined",
            Self::MemberLeft => "left",
            Self::MemberRemoved => "removed",
            Self::OwnerChanged => "owner changed",
        }
    }
}

/// One addressee of a direct notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl Recipient {
    pub fn new(id: i64, params: Map<String, Value>) -> Self {
        Self { id, params }
    }
}

/// A notification addressed to specific user ids, published to the general
/// destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectNotification {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub subject: String,
    pub recipients: Vec<Recipient>,
}

impl DirectNotification {
    /// Build a notification sending the same params to every user id.
    pub fn to_users(
        notification_type: NotificationType,
        user_ids: impl IntoIterator<Item = i64>,
        params: &Map<String, Value>,
    ) -> Self {
        Self {
            notification_type,
            subject: notification_type.subject().to_string(),
            recipients: user_ids
                .into_iter()
                .map(|id| Recipient::new(id, params.clone()))
                .collect(),
        }
    }

    pub fn recipient_ids(&self) -> Vec<i64> {
        self.recipients.iter().map(|r| r.id).collect()
    }
}

/// Slack-style message rendered for role channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackAttachment {
    pub title: String,
    pub title_link: String,
    #[serde(default)]
    pub text: String,
    pub color: String,
    #[serde(default)]
    pub fields: Vec<SlackField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

/// A message for every manager or every copilot.
///
/// `repost = true` asks the scheduler to keep re-announcing the payload
/// until a cancelling directive arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleNotification {
    pub target: Role,
    pub payload: SlackMessage,
    pub repost: bool,
}

/// Starts, continues or cancels the recurring announcement for a role.
///
/// `active = false` cancels. `active = true` re-arms with `payload`; without
/// a payload it leaves whatever is already scheduled alone.
#[derive(Debug, Clone, PartialEq)]
pub struct RepostDirective {
    pub target: Role,
    pub active: bool,
    pub payload: Option<SlackMessage>,
}

impl RepostDirective {
    pub fn cancel(target: Role) -> Self {
        Self {
            target,
            active: false,
            payload: None,
        }
    }

    pub fn arm(target: Role, payload: SlackMessage) -> Self {
        Self {
            target,
            active: true,
            payload: Some(payload),
        }
    }
}

/// Everything a builder can emit for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Direct(DirectNotification),
    Role(RoleNotification),
    Repost(RepostDirective),
}

impl Notification {
    /// Role this notification targets, `None` for direct notifications.
    pub fn target(&self) -> Option<Role> {
        match self {
            Notification::Direct(_) => None,
            Notification::Role(n) => Some(n.target),
            Notification::Repost(d) => Some(d.target),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Notification::Direct(n) => n.notification_type.as_str(),
            Notification::Role(n) if n.repost => "role.repost",
            Notification::Role(_) => "role",
            Notification::Repost(d) if d.active => "repost.arm",
            Notification::Repost(_) => "repost.cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_notification_wire_shape() {
        let mut params = Map::new();
        params.insert("projectId".into(), json!(1));
        let n = DirectNotification::to_users(NotificationType::ProjectCreated, [7], &params);

        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "project.created");
        assert_eq!(value["subject"], "created");
        assert_eq!(value["recipients"][0]["id"], 7);
        assert_eq!(value["recipients"][0]["params"]["projectId"], 1);
    }

    #[test]
    fn test_empty_params_are_omitted() {
        let n = DirectNotification::to_users(NotificationType::MemberLeft, [1, 2], &Map::new());
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["recipients"], json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn test_type_names_match_serde() {
        for t in [
            NotificationType::ProjectCreated,
            NotificationType::AvailableToClaim,
            NotificationType::OwnerChanged,
        ] {
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
    }

    #[test]
    fn test_notification_target() {
        let direct = Notification::Direct(DirectNotification::to_users(
            NotificationType::Reviewed,
            [],
            &Map::new(),
        ));
        assert_eq!(direct.target(), None);

        let cancel = Notification::Repost(RepostDirective::cancel(Role::Copilot));
        assert_eq!(cancel.target(), Some(Role::Copilot));
        assert_eq!(cancel.label(), "repost.cancel");
    }
}
