//! `project.claim.reminder`: re-check copilot assignment for a reviewed
//! project and keep or stop the copilot repost accordingly.

use super::project_updated::COPILOT_WANTED_HEADING;
use super::{slack, BuilderContext};
use crate::audience::has_copilot;
use crate::event::{Project, ProjectStatus, Role};
use crate::notification::{Notification, RepostDirective};

pub fn build(ctx: &BuilderContext, project: &Project) -> Vec<Notification> {
    if project.status != ProjectStatus::Reviewed {
        return Vec::new();
    }

    let directive = if has_copilot(project) {
        RepostDirective::cancel(Role::Copilot)
    } else {
        RepostDirective::arm(
            Role::Copilot,
            slack::summary(project, COPILOT_WANTED_HEADING, &ctx.project_url),
        )
    };

    vec![Notification::Repost(directive)]
}
