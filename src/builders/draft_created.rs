//! `project.draft-created`: tell the owner their project exists.

use super::project_params;
use crate::audience::primary_customer;
use crate::event::Project;
use crate::notification::{DirectNotification, Notification, NotificationType};
use tracing::warn;

pub fn build(project: &Project) -> Vec<Notification> {
    let Some(owner) = primary_customer(project) else {
        warn!(project_id = project.id, "Draft project has no primary customer, skipping");
        return Vec::new();
    };

    vec![Notification::Direct(DirectNotification::to_users(
        NotificationType::ProjectCreated,
        [owner.user_id],
        &project_params(project),
    ))]
}
