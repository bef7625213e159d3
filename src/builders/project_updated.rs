//! `project.updated`: status transitions into review and out of it.
//!
//! - `-> in_review`: customers hear it was submitted, the reviewer pool hears
//!   it is available, managers get a summary.
//! - `-> reviewed`: every member hears it was reviewed. Without a copilot the
//!   copilot pool is told it can be claimed and the copilot summary repeats
//!   until one is assigned.
//!
//! Any other change, including no status change at all, produces nothing.

use super::{project_params, slack, BuilderContext};
use crate::audience::{has_copilot, member_ids, member_ids_with_role};
use crate::event::{ProjectStatus, ProjectUpdate, Role};
use crate::notification::{DirectNotification, Notification, NotificationType, RoleNotification};
use tracing::debug;

pub const MANAGER_HEADING: &str = "Project submitted for review";
pub const COPILOT_WANTED_HEADING: &str = "Project ready for a copilot";
pub const COPILOT_ASSIGNED_HEADING: &str = "Project reviewed";

pub fn build(ctx: &BuilderContext, update: &ProjectUpdate) -> Vec<Notification> {
    let project = &update.updated;

    if update.original.status == project.status {
        debug!(project_id = project.id, "Status unchanged, nothing to announce");
        return Vec::new();
    }

    let params = project_params(project);

    match project.status {
        ProjectStatus::InReview => vec![
            Notification::Direct(DirectNotification::to_users(
                NotificationType::SubmittedForReview,
                member_ids_with_role(project, Role::Customer),
                &params,
            )),
            Notification::Direct(DirectNotification::to_users(
                NotificationType::AvailableForReview,
                ctx.pools.reviewers(),
                &params,
            )),
            Notification::Role(RoleNotification {
                target: Role::Manager,
                payload: slack::summary(project, MANAGER_HEADING, &ctx.project_url),
                repost: false,
            }),
        ],
        ProjectStatus::Reviewed => {
            let needs_copilot = !has_copilot(project);

            let mut notifications = vec![Notification::Direct(DirectNotification::to_users(
                NotificationType::Reviewed,
                member_ids(project),
                &params,
            ))];

            if needs_copilot {
                notifications.push(Notification::Direct(DirectNotification::to_users(
                    NotificationType::AvailableToClaim,
                    ctx.pools.copilots(),
                    &params,
                )));
            }

            let heading = if needs_copilot {
                COPILOT_WANTED_HEADING
            } else {
                COPILOT_ASSIGNED_HEADING
            };
            notifications.push(Notification::Role(RoleNotification {
                target: Role::Copilot,
                payload: slack::summary(project, heading, &ctx.project_url),
                repost: needs_copilot,
            }));

            notifications
        }
        _ => Vec::new(),
    }
}
