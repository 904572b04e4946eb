//! Project tracker resources on top of the generic cache.

mod client;
mod keys;
pub mod patches;
mod remote;
mod types;

pub use client::TrackerClient;
pub use keys::{team_scope, TrackerQuery, ID, LIST_ID, PROJECT_ID, TASK_ID, TEAM_ID};
pub use remote::{Remote, COMMENTS, LISTS, MEMBERS, PROJECTS, TASKS};
pub use types::{
  Activity, Comment, Member, MemberRole, NewComment, NewMember, NewProject, NewTask, NewTaskList,
  Project, ProjectUpdate, Task, TaskKind, TaskList, TaskStatus, TaskUpdate, Team,
};
