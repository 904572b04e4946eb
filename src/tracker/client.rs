//! Cached tracker client that routes reads through the query cache and writes
//! through the mutation engine.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::cache::{decode_value, encode_value, KeyPattern, Mutation, RemoteError, Result};
use crate::client::{EntityQuery, QueryClient};

use super::keys::{team_scope, TrackerQuery, PROJECT_ID, TASK_ID, TEAM_ID};
use super::patches;
use super::remote::{Remote, COMMENTS, LISTS, MEMBERS, PROJECTS, TASKS};
use super::types::{
  Activity, Comment, Member, NewComment, NewMember, NewProject, NewTask, NewTaskList, Project,
  ProjectUpdate, Task, TaskList, TaskUpdate, Team,
};

/// Tracker client with transparent caching.
///
/// Clones share the cache and the remote.
#[derive(Clone)]
pub struct TrackerClient<R: Remote> {
  remote: R,
  cache: QueryClient,
  /// Ids for records that exist only optimistically, counting down from -1
  temp_ids: Arc<AtomicI64>,
}

impl<R: Remote> TrackerClient<R> {
  pub fn new(remote: R, cache: QueryClient) -> Self {
    Self {
      remote,
      cache,
      temp_ids: Arc::new(AtomicI64::new(0)),
    }
  }

  pub fn cache(&self) -> &QueryClient {
    &self.cache
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn teams(&self) -> Result<Vec<Team>> {
    self.read(TrackerQuery::Teams).await
  }

  pub async fn team(&self, id: i64) -> Result<Team> {
    self.read(TrackerQuery::Team { id }).await
  }

  pub async fn members(&self, team_id: i64) -> Result<Vec<Member>> {
    self.read(TrackerQuery::Members { team_id }).await
  }

  pub async fn projects(&self, team_id: i64) -> Result<Vec<Project>> {
    self.read(TrackerQuery::Projects { team_id }).await
  }

  pub async fn project(&self, id: i64) -> Result<Project> {
    self.read(TrackerQuery::Project { id }).await
  }

  pub async fn lists(&self, project_id: i64) -> Result<Vec<TaskList>> {
    self.read(TrackerQuery::Lists { project_id }).await
  }

  pub async fn tasks(&self, list_id: i64) -> Result<Vec<Task>> {
    self.read(TrackerQuery::Tasks { list_id }).await
  }

  pub async fn task(&self, id: i64) -> Result<Task> {
    self.read(TrackerQuery::Task { id }).await
  }

  pub async fn comments(&self, task_id: i64) -> Result<Vec<Comment>> {
    self.read(TrackerQuery::Comments { task_id }).await
  }

  pub async fn activity(&self, project_id: i64) -> Result<Vec<Activity>> {
    self.read(TrackerQuery::Activity { project_id }).await
  }

  /// Observe `query` through an [`EntityQuery`] bound to this remote.
  pub fn watch<T>(&self, query: TrackerQuery) -> Result<EntityQuery<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let key = query.cache_key()?;
    let options = self.cache.options_for(&key);
    let remote = self.remote.clone();
    let loader_key = key.clone();

    Ok(self.cache.use_entity(
      key,
      move || {
        let pending = remote.get(&loader_key);
        async move {
          let value = pending.await?;
          serde_json::from_value(value).map_err(|e| RemoteError::new("decode", e.to_string()))
        }
      },
      options,
    ))
  }

  async fn read<T: DeserializeOwned>(&self, query: TrackerQuery) -> Result<T> {
    let key = query.cache_key()?;
    let remote = self.remote.clone();
    let loader_key = key.clone();

    let value = self
      .cache
      .fetch_value(&key, move || remote.get(&loader_key), self.cache.options_for(&key))
      .await?;
    decode_value(&key, value)
  }

  // ==========================================================================
  // Members
  // ==========================================================================

  /// Add a member. Every cached read scoped to the team is invalidated.
  pub async fn create_member(&self, input: NewMember) -> Result<Member> {
    let scope = team_scope(input.team_id);
    let body = encode_value(&MEMBERS, &input)?;
    let remote = self.remote.clone();

    let created = self
      .cache
      .mutate(
        Mutation::new(move || remote.create(MEMBERS, body))
          .named("create_member")
          .invalidates(scope),
      )
      .await?;
    decode_value(&MEMBERS, created)
  }

  pub async fn remove_member(&self, member: &Member) -> Result<()> {
    let members = TrackerQuery::Members { team_id: member.team_id }.cache_key()?;
    let (remote, id) = (self.remote.clone(), member.id);

    self
      .cache
      .mutate(
        Mutation::new(move || remote.delete(MEMBERS, id))
          .named("remove_member")
          .optimistic(members.clone(), patches::remove::<Member>(members, id))
          .invalidates(KeyPattern::resource("members").param(TEAM_ID, member.team_id)),
      )
      .await
  }

  // ==========================================================================
  // Projects
  // ==========================================================================

  pub async fn create_project(&self, input: NewProject) -> Result<Project> {
    let projects = TrackerQuery::Projects { team_id: input.team_id }.pattern()?;
    let body = encode_value(&PROJECTS, &input)?;
    let remote = self.remote.clone();

    let created = self
      .cache
      .mutate(
        Mutation::new(move || remote.create(PROJECTS, body))
          .named("create_project")
          .invalidates(projects),
      )
      .await?;
    decode_value(&PROJECTS, created)
  }

  pub async fn update_project(&self, project: &Project, update: ProjectUpdate) -> Result<Project> {
    let detail = TrackerQuery::Project { id: project.id }.cache_key()?;
    let list = TrackerQuery::Projects { team_id: project.team_id }.cache_key()?;
    let mut updated = project.clone();
    updated.apply(&update);
    let body = encode_value(&PROJECTS, &update)?;
    let (remote, id) = (self.remote.clone(), project.id);

    let confirmed = self
      .cache
      .mutate(
        Mutation::new(move || remote.update(PROJECTS, id, body))
          .named("update_project")
          .optimistic(
            detail.clone(),
            patches::edit(detail.clone(), move |p: &mut Project| p.apply(&update)),
          )
          .optimistic(list.clone(), patches::replace(list.clone(), updated))
          .invalidates(KeyPattern::from(&list))
          .invalidates(KeyPattern::from(&detail)),
      )
      .await?;
    decode_value(&PROJECTS, confirmed)
  }

  /// Delete a project along with every cached read scoped to it.
  pub async fn delete_project(&self, project: &Project) -> Result<()> {
    let detail = TrackerQuery::Project { id: project.id }.cache_key()?;
    let list = TrackerQuery::Projects { team_id: project.team_id }.cache_key()?;
    let (remote, id) = (self.remote.clone(), project.id);

    self
      .cache
      .mutate(
        Mutation::new(move || remote.delete(PROJECTS, id))
          .named("delete_project")
          .optimistic(list.clone(), patches::remove::<Project>(list.clone(), id))
          .invalidates(KeyPattern::from(&list))
          .invalidates(KeyPattern::from(&detail))
          .invalidates(KeyPattern::any().param(PROJECT_ID, id)),
      )
      .await
  }

  // ==========================================================================
  // Lists and tasks
  // ==========================================================================

  pub async fn create_list(&self, input: NewTaskList) -> Result<TaskList> {
    let lists = TrackerQuery::Lists { project_id: input.project_id }.pattern()?;
    let activity = TrackerQuery::Activity { project_id: input.project_id }.pattern()?;
    let body = encode_value(&LISTS, &input)?;
    let remote = self.remote.clone();

    let created = self
      .cache
      .mutate(
        Mutation::new(move || remote.create(LISTS, body))
          .named("create_list")
          .invalidates(lists)
          .invalidates(activity),
      )
      .await?;
    decode_value(&LISTS, created)
  }

  pub async fn create_task(&self, input: NewTask) -> Result<Task> {
    let tasks = TrackerQuery::Tasks { list_id: input.list_id }.pattern()?;
    let activity = TrackerQuery::Activity { project_id: input.project_id }.pattern()?;
    let body = encode_value(&TASKS, &input)?;
    let remote = self.remote.clone();

    let created = self
      .cache
      .mutate(
        Mutation::new(move || remote.create(TASKS, body))
          .named("create_task")
          .invalidates(tasks)
          .invalidates(activity),
      )
      .await?;
    decode_value(&TASKS, created)
  }

  /// Edit a task, moving it between lists when `update.list_id` differs.
  ///
  /// The task and its list entries change immediately; the confirmed task replaces
  /// the optimistic one, and the affected lists are refetched.
  pub async fn update_task(&self, task: &Task, update: TaskUpdate) -> Result<Task> {
    let detail = TrackerQuery::Task { id: task.id }.cache_key()?;
    let from = TrackerQuery::Tasks { list_id: task.list_id }.cache_key()?;
    let to_list = update.list_id.unwrap_or(task.list_id);
    let activity = TrackerQuery::Activity { project_id: task.project_id }.pattern()?;

    let mut updated = task.clone();
    updated.apply(&update);
    let body = encode_value(&TASKS, &update)?;
    let (remote, id) = (self.remote.clone(), task.id);

    let mut mutation = Mutation::new(move || remote.update(TASKS, id, body))
      .named("update_task")
      .optimistic(
        detail.clone(),
        patches::edit(detail.clone(), move |t: &mut Task| t.apply(&update)),
      );

    if to_list == task.list_id {
      mutation = mutation.optimistic(from.clone(), patches::replace(from.clone(), updated));
    } else {
      let to = TrackerQuery::Tasks { list_id: to_list }.cache_key()?;
      mutation = mutation
        .optimistic(from.clone(), patches::remove::<Task>(from.clone(), id))
        .optimistic(to.clone(), patches::append(to.clone(), updated))
        .invalidates(KeyPattern::from(&to));
    }

    let confirmed = self
      .cache
      .mutate(
        mutation
          .on_success(detail, |confirmed, _| Some(confirmed.clone()))
          .invalidates(KeyPattern::from(&from))
          .invalidates(activity),
      )
      .await?;
    decode_value(&TASKS, confirmed)
  }

  pub async fn delete_task(&self, task: &Task) -> Result<()> {
    let list = TrackerQuery::Tasks { list_id: task.list_id }.cache_key()?;
    let detail = TrackerQuery::Task { id: task.id }.pattern()?;
    let activity = TrackerQuery::Activity { project_id: task.project_id }.pattern()?;
    let (remote, id) = (self.remote.clone(), task.id);

    self
      .cache
      .mutate(
        Mutation::new(move || remote.delete(TASKS, id))
          .named("delete_task")
          .optimistic(list.clone(), patches::remove::<Task>(list.clone(), id))
          .invalidates(KeyPattern::from(&list))
          .invalidates(detail)
          .invalidates(KeyPattern::resource("comments").param(TASK_ID, id))
          .invalidates(activity),
      )
      .await
  }

  // ==========================================================================
  // Comments
  // ==========================================================================

  /// Post a comment. It shows up in the thread right away under a temporary
  /// negative id until the thread is refetched.
  pub async fn create_comment(&self, input: NewComment) -> Result<Comment> {
    let thread = TrackerQuery::Comments { task_id: input.task_id }.cache_key()?;
    let activity = TrackerQuery::Activity { project_id: input.project_id }.pattern()?;
    let pending = Comment {
      id: self.temp_id(),
      task_id: input.task_id,
      author_id: input.author_id,
      body: input.body.clone(),
      created_at: Some(Utc::now()),
    };
    let body = encode_value(&COMMENTS, &input)?;
    let remote = self.remote.clone();

    let created = self
      .cache
      .mutate(
        Mutation::new(move || remote.create(COMMENTS, body))
          .named("create_comment")
          .optimistic(thread.clone(), patches::append(thread.clone(), pending))
          .invalidates(KeyPattern::from(&thread))
          .invalidates(activity),
      )
      .await?;
    decode_value(&COMMENTS, created)
  }

  pub async fn delete_comment(&self, comment: &Comment) -> Result<()> {
    let thread = TrackerQuery::Comments { task_id: comment.task_id }.cache_key()?;
    let (remote, id) = (self.remote.clone(), comment.id);

    self
      .cache
      .mutate(
        Mutation::new(move || remote.delete(COMMENTS, id))
          .named("delete_comment")
          .optimistic(thread.clone(), patches::remove::<Comment>(thread.clone(), id))
          .invalidates(KeyPattern::from(&thread)),
      )
      .await
  }

  fn temp_id(&self) -> i64 {
    self.temp_ids.fetch_sub(1, Ordering::SeqCst) - 1
  }
}

impl<R: Remote> std::fmt::Debug for TrackerClient<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TrackerClient")
      .field("cache", &self.cache)
      .finish_non_exhaustive()
  }
}
