use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
  pub id: i64,
  pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
  Owner,
  Admin,
  #[default]
  Member,
}

/// Team member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
  pub id: i64,
  pub team_id: i64,
  pub email: String,
  pub name: Option<String>,
  #[serde(default)]
  pub role: MemberRole,
}

/// Project owned by a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
  pub id: i64,
  pub team_id: i64,
  pub name: String,
  pub description: Option<String>,
}

/// Column of tasks inside a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
  pub id: i64,
  pub project_id: i64,
  pub name: String,
  #[serde(default)]
  pub position: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
  #[default]
  Task,
  Feature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Todo,
  InProgress,
  Done,
}

/// Task or feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: i64,
  pub project_id: i64,
  pub list_id: i64,
  pub title: String,
  pub description: Option<String>,
  #[serde(default)]
  pub kind: TaskKind,
  #[serde(default)]
  pub status: TaskStatus,
  pub assignee_id: Option<i64>,
}

impl Task {
  /// Apply the fields set in `update`.
  pub fn apply(&mut self, update: &TaskUpdate) {
    if let Some(title) = &update.title {
      self.title = title.clone();
    }
    if let Some(description) = &update.description {
      self.description = Some(description.clone());
    }
    if let Some(status) = update.status {
      self.status = status;
    }
    if let Some(list_id) = update.list_id {
      self.list_id = list_id;
    }
    if let Some(assignee_id) = update.assignee_id {
      self.assignee_id = Some(assignee_id);
    }
  }
}

/// Comment on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
  pub id: i64,
  pub task_id: i64,
  pub author_id: i64,
  pub body: String,
  pub created_at: Option<DateTime<Utc>>,
}

/// Activity log line for a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
  pub id: i64,
  pub project_id: i64,
  pub task_id: Option<i64>,
  pub actor_id: Option<i64>,
  pub action: String,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Mutation inputs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMember {
  pub team_id: i64,
  pub email: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
  pub team_id: i64,
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl Project {
  pub fn apply(&mut self, update: &ProjectUpdate) {
    if let Some(name) = &update.name {
      self.name = name.clone();
    }
    if let Some(description) = &update.description {
      self.description = Some(description.clone());
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTaskList {
  pub project_id: i64,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
  pub project_id: i64,
  pub list_id: i64,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub kind: TaskKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub list_id: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
  pub task_id: i64,
  /// Project the task belongs to, for its activity log
  pub project_id: i64,
  pub author_id: i64,
  pub body: String,
}
