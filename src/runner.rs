use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{FilterError, Result};
use crate::filter;
use crate::models::Group;
use crate::store::AttendanceStore;
use crate::window::RollWindow;

/// Drives membership recomputation across the whole group catalog.
///
/// Only one run may be active per store, across processes; an overlapping
/// trigger is rejected with [`FilterError::RunInProgress`] rather than queued.
/// Groups and student
/// ids are read once when the run starts, and each group's membership is
/// swapped in its own transaction, so a failure part way through leaves the
/// groups not yet reached with the membership of the previous run.
pub struct FilterRunner {
    store: Arc<dyn AttendanceStore>,
}

impl FilterRunner {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.store
    }

    pub async fn run_filters(&self) -> Result<Vec<Group>> {
        self.run_filters_at(Utc::now()).await
    }

    pub async fn run_filters_at(&self, now: DateTime<Utc>) -> Result<Vec<Group>> {
        let _lease = self
            .store
            .try_begin_run()
            .await?
            .ok_or(FilterError::RunInProgress)?;

        let run_id = Uuid::new_v4();
        self.run(now)
            .instrument(info_span!("run_filters", %run_id))
            .await
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<Vec<Group>> {
        let groups = self.store.list_groups().await?;
        let student_ids = self.store.list_student_ids().await?;
        info!(
            groups = groups.len(),
            students = student_ids.len(),
            "starting filter run"
        );

        let mut refreshed = Vec::with_capacity(groups.len());
        for group in &groups {
            match self.refresh_group(group, &student_ids, now).await? {
                Some(updated) => refreshed.push(updated),
                None => warn!(group_id = group.id, "group removed during run, skipping"),
            }
        }

        info!(groups = refreshed.len(), "filter run complete");
        Ok(refreshed)
    }

    async fn refresh_group(
        &self,
        group: &Group,
        student_ids: &[i32],
        now: DateTime<Utc>,
    ) -> Result<Option<Group>> {
        let window = RollWindow::trailing(now, group.number_of_weeks);
        let roll_ids: Vec<i32> = self
            .store
            .list_rolls(window)
            .await?
            .into_iter()
            .filter(|roll| window.contains(roll.completed_at))
            .map(|roll| roll.id)
            .collect();

        let records = if roll_ids.is_empty() {
            Vec::new()
        } else {
            self.store.list_roll_states(&roll_ids).await?
        };

        let members = filter::evaluate_group(group, student_ids, &records);
        debug!(
            group_id = group.id,
            rolls = roll_ids.len(),
            records = records.len(),
            members = members.len(),
            "evaluated group"
        );

        self.store.replace_memberships(group.id, &members, now).await
    }
}
