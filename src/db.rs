use std::io::Read;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};

use crate::error::{FilterError, Result};
use crate::models::{
    Comparison, Group, GroupInput, GroupMember, GroupPatch, GroupStudent, NewGroup, Roll,
    RollState, RollStateSet, Student, StudentRollState,
};
use crate::store::{AttendanceStore, RunLease};
use crate::window::RollWindow;

/// Advisory lock key guarding filter runs across every process on the database.
const RUN_LOCK_KEY: i64 = 0x726f_6c6c_5f67_7270;

const GROUP_COLUMNS: &str =
    "id, name, number_of_weeks, roll_states, incidents, ltmt, run_at, student_count";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn group_from_row(row: &PgRow) -> Result<Group> {
    let id: i32 = row.try_get("id")?;
    let corrupt = |e: FilterError| FilterError::Store(format!("group {id} is corrupt: {e}"));

    let roll_states: String = row.try_get("roll_states")?;
    let ltmt: String = row.try_get("ltmt")?;
    Ok(Group {
        id,
        name: row.try_get("name")?,
        number_of_weeks: row.try_get("number_of_weeks")?,
        roll_states: RollStateSet::parse(&roll_states).map_err(corrupt)?,
        incidents: row.try_get("incidents")?,
        ltmt: Comparison::from_str(&ltmt).map_err(corrupt)?,
        run_at: row.try_get("run_at")?,
        student_count: row.try_get("student_count")?,
    })
}

#[async_trait]
impl AttendanceStore for PgStore {
    /// The lock is transaction scoped, so it is released when the lease's
    /// transaction rolls back on drop, even if the run errored.
    async fn try_begin_run(&self) -> Result<Option<RunLease>> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;

        if !acquired {
            debug!("filter run lock is held elsewhere");
            return Ok(None);
        }
        Ok(Some(RunLease::new(tx)))
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM roll_groups.groups ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(group_from_row).collect()
    }

    async fn create_group(&self, group: NewGroup) -> Result<Group> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO roll_groups.groups (name, number_of_weeks, roll_states, incidents, ltmt)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(&group.name)
        .bind(group.number_of_weeks)
        .bind(group.roll_states.to_string())
        .bind(group.incidents)
        .bind(group.ltmt.as_str())
        .fetch_one(&self.pool)
        .await?;

        group_from_row(&row)
    }

    async fn update_group(&self, id: i32, patch: GroupPatch) -> Result<Option<Group>> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM roll_groups.groups WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = existing else {
            return Ok(None);
        };

        let mut group = group_from_row(&row)?;
        group.apply(patch);

        let row = sqlx::query(&format!(
            r#"
            UPDATE roll_groups.groups
            SET name = $2, number_of_weeks = $3, roll_states = $4, incidents = $5, ltmt = $6
            WHERE id = $1
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&group.name)
        .bind(group.number_of_weeks)
        .bind(group.roll_states.to_string())
        .bind(group.incidents)
        .bind(group.ltmt.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        group_from_row(&row).map(Some)
    }

    async fn delete_group(&self, id: i32) -> Result<Option<Group>> {
        let row = sqlx::query(&format!(
            "DELETE FROM roll_groups.groups WHERE id = $1 RETURNING {GROUP_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(group_from_row).transpose()
    }

    async fn list_student_ids(&self) -> Result<Vec<i32>> {
        let ids = sqlx::query_scalar("SELECT id FROM roll_groups.students ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn list_rolls(&self, window: RollWindow) -> Result<Vec<Roll>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, completed_at
            FROM roll_groups.rolls
            WHERE completed_at BETWEEN $1 AND $2
            "#,
        )
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Roll> {
                Ok(Roll {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    completed_at: row.try_get("completed_at")?,
                })
            })
            .collect()
    }

    async fn list_roll_states(&self, roll_ids: &[i32]) -> Result<Vec<StudentRollState>> {
        let rows = sqlx::query(
            r#"
            SELECT id, roll_id, student_id, state
            FROM roll_groups.student_roll_states
            WHERE roll_id = ANY($1)
            "#,
        )
        .bind(roll_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StudentRollState> {
                let state: String = row.try_get("state")?;
                Ok(StudentRollState {
                    id: row.try_get("id")?,
                    roll_id: row.try_get("roll_id")?,
                    student_id: row.try_get("student_id")?,
                    state: RollState::from_str(&state)?,
                })
            })
            .collect()
    }

    async fn replace_memberships(
        &self,
        group_id: i32,
        rows: &[GroupStudent],
        run_at: DateTime<Utc>,
    ) -> Result<Option<Group>> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query("SELECT id FROM roll_groups.groups WHERE id = $1 FOR UPDATE")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Ok(None);
        }

        sqlx::query("DELETE FROM roll_groups.group_students WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        let student_ids: Vec<i32> = rows.iter().map(|row| row.student_id).collect();
        let incident_counts: Vec<i32> = rows.iter().map(|row| row.incident_count).collect();
        sqlx::query(
            r#"
            INSERT INTO roll_groups.group_students (group_id, student_id, incident_count)
            SELECT $1, member.student_id, member.incident_count
            FROM UNNEST($2::int4[], $3::int4[]) AS member (student_id, incident_count)
            "#,
        )
        .bind(group_id)
        .bind(&student_ids)
        .bind(&incident_counts)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE roll_groups.groups
            SET student_count = $2, run_at = $3
            WHERE id = $1
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(group_id)
        .bind(rows.len() as i32)
        .bind(run_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(group_id, members = rows.len(), "membership replaced");
        group_from_row(&row).map(Some)
    }

    async fn list_group_members(&self, group_id: i32) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.first_name, s.last_name, gs.incident_count
            FROM roll_groups.group_students gs
            JOIN roll_groups.students s ON s.id = gs.student_id
            WHERE gs.group_id = $1
            ORDER BY gs.incident_count DESC, s.last_name, s.first_name
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<GroupMember> {
                let student = Student {
                    id: row.try_get("id")?,
                    first_name: row.try_get("first_name")?,
                    last_name: row.try_get("last_name")?,
                };
                Ok(GroupMember::new(&student, row.try_get("incident_count")?))
            })
            .collect()
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        ("Avery", "Lee"),
        ("Jules", "Moreno"),
        ("Kiara", "Patel"),
        ("Noah", "Okafor"),
    ];

    let mut tx = pool.begin().await?;

    for (first_name, last_name) in students {
        upsert_student(&mut tx, first_name, last_name).await?;
    }

    let now = Utc::now();
    let rolls = vec![
        ("Monday homeroom", now - Duration::days(2)),
        ("Wednesday homeroom", now - Duration::days(5)),
        ("Friday homeroom", now - Duration::days(9)),
        ("Term opener", now - Duration::weeks(5)),
    ];

    for (name, completed_at) in &rolls {
        upsert_roll(&mut tx, name, Some(*completed_at)).await?;
    }

    let states = vec![
        ("Avery", "Lee", "Monday homeroom", RollState::Absent),
        ("Avery", "Lee", "Wednesday homeroom", RollState::Absent),
        ("Avery", "Lee", "Friday homeroom", RollState::Late),
        ("Jules", "Moreno", "Monday homeroom", RollState::Present),
        ("Jules", "Moreno", "Wednesday homeroom", RollState::Late),
        ("Jules", "Moreno", "Friday homeroom", RollState::Present),
        ("Kiara", "Patel", "Monday homeroom", RollState::Present),
        ("Kiara", "Patel", "Term opener", RollState::Absent),
        ("Noah", "Okafor", "Monday homeroom", RollState::Absent),
        ("Noah", "Okafor", "Wednesday homeroom", RollState::Absent),
        ("Noah", "Okafor", "Friday homeroom", RollState::Absent),
        ("Noah", "Okafor", "Term opener", RollState::Absent),
    ];

    for (first_name, last_name, roll_name, state) in states {
        let student_id = upsert_student(&mut tx, first_name, last_name).await?;
        let roll_id: i32 = sqlx::query("SELECT id FROM roll_groups.rolls WHERE name = $1")
            .bind(roll_name)
            .fetch_one(&mut *tx)
            .await?
            .get("id");
        let source_key = natural_source_key(roll_name, first_name, last_name);
        insert_roll_state(&mut tx, roll_id, student_id, state, &source_key).await?;
    }

    tx.commit().await?;

    let groups = vec![
        ("Perfect attendance", 4, "absent,late", 0, "<"),
        ("Frequently late or absent", 2, "absent,late", 3, ">"),
    ];

    let store = PgStore::new(pool.clone());
    let existing: Vec<String> = store
        .list_groups()
        .await?
        .into_iter()
        .map(|group| group.name)
        .collect();

    for (name, weeks, roll_states, incidents, ltmt) in groups {
        if existing.iter().any(|existing| existing == name) {
            continue;
        }
        let input = GroupInput {
            name: Some(name.to_string()),
            number_of_weeks: Some(weeks),
            roll_states: Some(roll_states.to_string()),
            incidents: Some(incidents),
            ltmt: Some(ltmt.to_string()),
        };
        store.create_group(input.into_new_group()?).await?;
    }

    info!("seed data in place");
    Ok(())
}

async fn upsert_student(
    conn: &mut PgConnection,
    first_name: &str,
    last_name: &str,
) -> anyhow::Result<i32> {
    let id = sqlx::query(
        r#"
        INSERT INTO roll_groups.students (first_name, last_name)
        VALUES ($1, $2)
        ON CONFLICT (first_name, last_name) DO UPDATE
        SET first_name = EXCLUDED.first_name
        RETURNING id
        "#,
    )
    .bind(first_name)
    .bind(last_name)
    .fetch_one(&mut *conn)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_roll(
    conn: &mut PgConnection,
    name: &str,
    completed_at: Option<DateTime<Utc>>,
) -> anyhow::Result<i32> {
    let id = sqlx::query(
        r#"
        INSERT INTO roll_groups.rolls (name, completed_at)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE
        SET completed_at = COALESCE(EXCLUDED.completed_at, roll_groups.rolls.completed_at)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(completed_at)
    .fetch_one(&mut *conn)
    .await?
    .get("id");
    Ok(id)
}

/// Returns false when a roll state with the same source key is already stored.
async fn insert_roll_state(
    conn: &mut PgConnection,
    roll_id: i32,
    student_id: i32,
    state: RollState,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO roll_groups.student_roll_states (roll_id, student_id, state, source_key)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(roll_id)
    .bind(student_id)
    .bind(state.as_str())
    .bind(source_key)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// One roll state per student per roll, unless the export names its own key.
fn natural_source_key(roll_name: &str, first_name: &str, last_name: &str) -> String {
    format!("{roll_name}/{first_name} {last_name}")
}

/// One line of an attendance export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub first_name: String,
    pub last_name: String,
    pub roll_name: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: RollState,
    pub source_key: String,
}

/// Reads `first_name,last_name,roll_name,completed_at,state[,source_key]`
/// rows. The whole file is rejected if any row names an unknown state.
pub fn read_attendance_csv<R: Read>(input: R) -> anyhow::Result<Vec<AttendanceRecord>> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        first_name: String,
        last_name: String,
        roll_name: String,
        completed_at: Option<DateTime<Utc>>,
        state: String,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_reader(input);
    let mut records = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed attendance row on line {line}"))?;
        let state = RollState::from_str(row.state.trim())
            .with_context(|| format!("line {line}"))?;

        let first_name = row.first_name.trim().to_string();
        let last_name = row.last_name.trim().to_string();
        let roll_name = row.roll_name.trim().to_string();
        let source_key = row
            .source_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| natural_source_key(&roll_name, &first_name, &last_name));

        records.push(AttendanceRecord {
            first_name,
            last_name,
            roll_name,
            completed_at: row.completed_at,
            state,
            source_key,
        });
    }

    Ok(records)
}

/// Loads the file in one transaction and returns how many roll states were new.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let records = read_attendance_csv(file)?;

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;
    for record in &records {
        let student_id = upsert_student(&mut tx, &record.first_name, &record.last_name).await?;
        let roll_id = upsert_roll(&mut tx, &record.roll_name, record.completed_at).await?;
        if insert_roll_state(&mut tx, roll_id, student_id, record.state, &record.source_key).await? {
            inserted += 1;
        }
    }
    tx.commit().await?;

    debug!(
        read = records.len(),
        inserted,
        "attendance import committed"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reads_attendance_rows() {
        let data = "\
first_name,last_name,roll_name,completed_at,state
Avery,Lee,Monday homeroom,2026-03-09T08:45:00Z,absent
 Jules , Moreno ,Monday homeroom,2026-03-09T08:45:00Z, late
Kiara,Patel,Draft roll,,present
";
        let records = read_attendance_csv(data.as_bytes()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].state, RollState::Absent);
        assert_eq!(
            records[0].completed_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 9, 8, 45, 0).unwrap())
        );
        assert_eq!(records[1].first_name, "Jules");
        assert_eq!(records[1].state, RollState::Late);
        assert_eq!(records[2].completed_at, None);
        assert_eq!(records[1].source_key, "Monday homeroom/Jules Moreno");
    }

    #[test]
    fn repeated_rows_share_a_source_key() {
        let data = "\
first_name,last_name,roll_name,completed_at,state,source_key
Avery,Lee,Monday homeroom,2026-03-09T08:45:00Z,absent,
Avery,Lee,Monday homeroom,2026-03-09T08:45:00Z,absent,
Avery,Lee,Monday homeroom,2026-03-09T08:45:00Z,late,sis-00412
";
        let records = read_attendance_csv(data.as_bytes()).unwrap();
        assert_eq!(records[0].source_key, records[1].source_key);
        assert_eq!(records[2].source_key, "sis-00412");

        let again = read_attendance_csv(data.as_bytes()).unwrap();
        assert_eq!(records, again);
    }

    #[test]
    fn unknown_state_rejects_the_file() {
        let data = "\
first_name,last_name,roll_name,completed_at,state
Avery,Lee,Monday homeroom,2026-03-09T08:45:00Z,sick
";
        let err = read_attendance_csv(data.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
