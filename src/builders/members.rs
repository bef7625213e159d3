//! Member lifecycle builders: added, removed, and ownership transfer.
//!
//! Each one fetches the current project and the affected user concurrently
//! and notifies every current member.

use super::{project_user_params, BuildError, BuilderContext};
use crate::audience::member_ids;
use crate::event::{MemberChange, Role};
use crate::notification::{DirectNotification, Notification, NotificationType};
use tracing::debug;

pub async fn added(
    ctx: &BuilderContext,
    change: &MemberChange,
) -> Result<Vec<Notification>, BuildError> {
    let (project, user) = ctx
        .fetch_project_and_user(change.project_id, change.user_id)
        .await?;

    let notification_type = match change.role {
        Role::Customer => NotificationType::MemberJoined,
        Role::Manager => NotificationType::ManagerJoined,
        Role::Copilot => NotificationType::CopilotJoined,
    };

    Ok(vec![Notification::Direct(DirectNotification::to_users(
        notification_type,
        member_ids(&project),
        &project_user_params(&project, &user),
    ))])
}

pub async fn removed(
    ctx: &BuilderContext,
    change: &MemberChange,
) -> Result<Vec<Notification>, BuildError> {
    let (project, user) = ctx
        .fetch_project_and_user(change.project_id, change.user_id)
        .await?;

    let notification_type = if change.updated_by == change.user_id {
        NotificationType::MemberLeft
    } else {
        NotificationType::MemberRemoved
    };

    Ok(vec![Notification::Direct(DirectNotification::to_users(
        notification_type,
        member_ids(&project),
        &project_user_params(&project, &user),
    ))])
}

/// Only a customer becoming primary (ownership transfer) is announced.
pub async fn updated(
    ctx: &BuilderContext,
    change: &MemberChange,
) -> Result<Vec<Notification>, BuildError> {
    if change.role != Role::Customer || !change.is_primary {
        debug!(
            project_id = change.project_id,
            user_id = change.user_id,
            "Member update is not an ownership transfer"
        );
        return Ok(Vec::new());
    }

    let (project, owner) = ctx
        .fetch_project_and_user(change.project_id, change.user_id)
        .await?;

    Ok(vec![Notification::Direct(DirectNotification::to_users(
        NotificationType::OwnerChanged,
        member_ids(&project),
        &project_user_params(&project, &owner),
    ))])
}
