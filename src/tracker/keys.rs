//! Cache keys and invalidation scopes for tracker resources.

use crate::cache::{build_key, CacheKey, Cacheable, KeyPattern, Result};

use super::types::{Activity, Comment, Member, Project, Task, TaskList, Team};

pub const TEAM_ID: &str = "teamId";
pub const PROJECT_ID: &str = "projectId";
pub const LIST_ID: &str = "listId";
pub const TASK_ID: &str = "taskId";
pub const ID: &str = "id";

// ============================================================================
// Cacheable implementations
// ============================================================================

macro_rules! cacheable {
  ($($ty:ty => $resource:literal),* $(,)?) => {
    $(
      impl Cacheable for $ty {
        fn cache_id(&self) -> i64 {
          self.id
        }

        fn resource_type() -> &'static str {
          $resource
        }
      }
    )*
  };
}

cacheable! {
  Team => "team",
  Member => "member",
  Project => "project",
  TaskList => "list",
  Task => "task",
  Comment => "comment",
  Activity => "activity_entry",
}

// ============================================================================
// Query key types
// ============================================================================

/// Reads the tracker client can cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerQuery {
  /// All teams visible to the user
  Teams,
  Team { id: i64 },
  /// Members of a team
  Members { team_id: i64 },
  /// Projects of a team
  Projects { team_id: i64 },
  Project { id: i64 },
  /// Lists (columns) of a project
  Lists { project_id: i64 },
  /// Tasks of a list
  Tasks { list_id: i64 },
  Task { id: i64 },
  /// Comment thread of a task
  Comments { task_id: i64 },
  /// Activity log of a project
  Activity { project_id: i64 },
}

impl TrackerQuery {
  pub fn resource(&self) -> &'static str {
    match self {
      Self::Teams => "teams",
      Self::Team { .. } => Team::resource_type(),
      Self::Members { .. } => "members",
      Self::Projects { .. } => "projects",
      Self::Project { .. } => Project::resource_type(),
      Self::Lists { .. } => "lists",
      Self::Tasks { .. } => "tasks",
      Self::Task { .. } => Task::resource_type(),
      Self::Comments { .. } => "comments",
      Self::Activity { .. } => "activity",
    }
  }

  pub fn cache_key(&self) -> Result<CacheKey> {
    let resource = self.resource();
    match *self {
      Self::Teams => CacheKey::new(resource),
      Self::Team { id } | Self::Project { id } | Self::Task { id } => build_key(resource, [(ID, id)]),
      Self::Members { team_id } | Self::Projects { team_id } => build_key(resource, [(TEAM_ID, team_id)]),
      Self::Lists { project_id } | Self::Activity { project_id } => {
        build_key(resource, [(PROJECT_ID, project_id)])
      }
      Self::Tasks { list_id } => build_key(resource, [(LIST_ID, list_id)]),
      Self::Comments { task_id } => build_key(resource, [(TASK_ID, task_id)]),
    }
  }

  /// Pattern covering exactly this read.
  pub fn pattern(&self) -> Result<KeyPattern> {
    Ok(KeyPattern::from(&self.cache_key()?))
  }

  pub fn description(&self) -> String {
    match self {
      Self::Teams => "all teams".to_string(),
      Self::Team { id } => format!("team {}", id),
      Self::Members { team_id } => format!("members of team {}", team_id),
      Self::Projects { team_id } => format!("projects of team {}", team_id),
      Self::Project { id } => format!("project {}", id),
      Self::Lists { project_id } => format!("lists of project {}", project_id),
      Self::Tasks { list_id } => format!("tasks in list {}", list_id),
      Self::Task { id } => format!("task {}", id),
      Self::Comments { task_id } => format!("comments on task {}", task_id),
      Self::Activity { project_id } => format!("activity of project {}", project_id),
    }
  }
}

/// Every cached read scoped to a team, across resource types.
pub fn team_scope(team_id: i64) -> KeyPattern {
  KeyPattern::any().param(TEAM_ID, team_id)
}
