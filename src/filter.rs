use std::collections::HashMap;

use crate::models::{Comparison, Group, GroupStudent, RollStateSet, StudentRollState};

/// Counts records whose state is accepted. Duplicate records for the same roll
/// are counted individually.
pub fn count_incidents<'a, I>(records: I, accepted: &RollStateSet) -> i32
where
    I: IntoIterator<Item = &'a StudentRollState>,
{
    records
        .into_iter()
        .filter(|record| accepted.contains(record.state))
        .count() as i32
}

/// Groups a batch of roll states by student so each student is looked up once.
pub fn partition_by_student(records: &[StudentRollState]) -> HashMap<i32, Vec<&StudentRollState>> {
    let mut by_student: HashMap<i32, Vec<&StudentRollState>> = HashMap::new();
    for record in records {
        by_student.entry(record.student_id).or_default().push(record);
    }
    by_student
}

impl Comparison {
    /// `<` admits counts at or below the threshold, `>` at or above it.
    pub fn admits(self, count: i32, threshold: i32) -> bool {
        match self {
            Comparison::LessThan => count <= threshold,
            Comparison::GreaterThan => count >= threshold,
        }
    }
}

/// Evaluates every candidate against one group. `records` must already be
/// restricted to the rolls inside the group's window.
pub fn evaluate_group(
    group: &Group,
    student_ids: &[i32],
    records: &[StudentRollState],
) -> Vec<GroupStudent> {
    let by_student = partition_by_student(records);

    student_ids
        .iter()
        .filter_map(|&student_id| {
            let incident_count = by_student
                .get(&student_id)
                .map(|own| count_incidents(own.iter().copied(), &group.roll_states))
                .unwrap_or(0);

            group
                .ltmt
                .admits(incident_count, group.incidents)
                .then_some(GroupStudent {
                    group_id: group.id,
                    student_id,
                    incident_count,
                })
        })
        .collect()
}
