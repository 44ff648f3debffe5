use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Group, GroupMember, GroupPatch, GroupStudent, NewGroup, Roll, StudentRollState};
use crate::window::RollWindow;

/// Proof that the caller owns the recomputation slot. Dropping it frees the
/// slot for the next run.
pub struct RunLease {
    _held: Box<dyn Send>,
}

impl RunLease {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Everything the recomputation engine and the group catalog read or write.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Claims the store-wide recomputation slot, or `None` while another run,
    /// from any process sharing the store, holds it.
    async fn try_begin_run(&self) -> Result<Option<RunLease>>;

    async fn list_groups(&self) -> Result<Vec<Group>>;

    async fn create_group(&self, group: NewGroup) -> Result<Group>;

    /// `None` when no group has this id.
    async fn update_group(&self, id: i32, patch: GroupPatch) -> Result<Option<Group>>;

    /// Removes the group together with its membership rows.
    async fn delete_group(&self, id: i32) -> Result<Option<Group>>;

    async fn list_student_ids(&self) -> Result<Vec<i32>>;

    async fn list_rolls(&self, window: RollWindow) -> Result<Vec<Roll>>;

    async fn list_roll_states(&self, roll_ids: &[i32]) -> Result<Vec<StudentRollState>>;

    /// Swaps one group's membership for `rows` and stamps `student_count` and
    /// `run_at`, all or nothing. `None` when the group no longer exists.
    async fn replace_memberships(
        &self,
        group_id: i32,
        rows: &[GroupStudent],
        run_at: DateTime<Utc>,
    ) -> Result<Option<Group>>;

    async fn list_group_members(&self, group_id: i32) -> Result<Vec<GroupMember>>;
}
