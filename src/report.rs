use std::fmt::Write;

use crate::models::{Comparison, Group, GroupMember};

fn describe_rule(group: &Group) -> String {
    let bound = match group.ltmt {
        Comparison::LessThan => "at most",
        Comparison::GreaterThan => "at least",
    };
    format!(
        "{bound} {} of [{}] in the last {} week(s)",
        group.incidents, group.roll_states, group.number_of_weeks
    )
}

pub fn build_report(groups: &[(Group, Vec<GroupMember>)]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Group Report");

    if groups.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No groups configured.");
        return output;
    }

    for (group, members) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", group.name);
        let _ = writeln!(output, "Rule: {}", describe_rule(group));
        match group.run_at {
            Some(run_at) => {
                let _ = writeln!(
                    output,
                    "Last run {} with {} student(s)",
                    run_at.format("%Y-%m-%d %H:%M UTC"),
                    group.student_count
                );
            }
            None => {
                let _ = writeln!(output, "Filters have not been run for this group yet.");
            }
        }
        let _ = writeln!(output);

        if members.is_empty() {
            let _ = writeln!(output, "No students currently match.");
            continue;
        }

        let mut sorted = members.clone();
        sorted.sort_by(|a, b| {
            b.incident_count
                .cmp(&a.incident_count)
                .then_with(|| a.full_name.cmp(&b.full_name))
        });
        for member in &sorted {
            let _ = writeln!(
                output,
                "- {} ({} incidents)",
                member.full_name, member.incident_count
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RollStateSet, Student};
    use chrono::{TimeZone, Utc};

    fn group(run: bool) -> Group {
        Group {
            id: 1,
            name: "Frequently late".to_string(),
            number_of_weeks: 2,
            roll_states: RollStateSet::parse("late").unwrap(),
            incidents: 2,
            ltmt: Comparison::GreaterThan,
            run_at: run.then(|| Utc.with_ymd_and_hms(2026, 3, 16, 9, 30, 0).unwrap()),
            student_count: 2,
        }
    }

    fn member(id: i32, first: &str, last: &str, incidents: i32) -> GroupMember {
        let student = Student {
            id,
            first_name: first.to_string(),
            last_name: last.to_string(),
        };
        GroupMember::new(&student, incidents)
    }

    #[test]
    fn lists_members_by_incident_count() {
        let members = vec![
            member(1, "Jules", "Moreno", 2),
            member(2, "Avery", "Lee", 5),
        ];
        let report = build_report(&[(group(true), members)]);

        assert!(report.contains("## Frequently late"));
        assert!(report.contains("Rule: at least 2 of [late] in the last 2 week(s)"));
        assert!(report.contains("Last run 2026-03-16 09:30 UTC with 2 student(s)"));
        let avery = report.find("Avery Lee (5 incidents)").unwrap();
        let jules = report.find("Jules Moreno (2 incidents)").unwrap();
        assert!(avery < jules);
    }

    #[test]
    fn notes_groups_that_never_ran() {
        let report = build_report(&[(group(false), Vec::new())]);
        assert!(report.contains("have not been run"));
        assert!(report.contains("No students currently match."));
    }

    #[test]
    fn empty_catalog() {
        assert!(build_report(&[]).contains("No groups configured."));
    }
}
