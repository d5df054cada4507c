use chrono::{DateTime, Utc};
use std::collections::HashSet;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod db;

pub static COURSE_COLLECTION_NAME: &str = "courses";

/// Lab lifecycle. Transition policy (publishing, closing on due date) is
/// driven by callers; the stored status is authoritative for visibility.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub enum LabStatus {
    Draft,
    Active,
    Closed,
}

impl Default for LabStatus {
    fn default() -> Self {
        LabStatus::Draft
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub enum Comparison {
    Exact,
    IgnoreWhitespace,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TestCase {
    pub input: String,
    pub expected: String,
    pub comparison: Comparison,
    /// Hidden cases are excluded from student-visible feedback.
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub enum ConstraintRule {
    Required,
    Forbidden,
}

/// Structural requirement on submitted code, e.g. "a `for` loop is required,
/// nested at most 2 deep". Enforcement happens in the external grader.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CodeConstraint {
    pub construct: String,
    pub rule: ConstraintRule,
    #[serde(default)]
    pub min_depth: Option<u32>,
    #[serde(default)]
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Task {
    /// Client-assigned, unique within the lab.
    pub id: u32,
    pub instructions: String,
    pub weight: f64,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub constraints: Vec<CodeConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResult {
    pub task_id: u32,
    pub passed: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub enum SubmissionStatus {
    Submitted,
    NotSubmitted,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Submission {
    pub student: Uuid,
    pub code: String,
    #[serde(default = "Utc::now")]
    pub submitted_on: DateTime<Utc>,
    #[serde(default)]
    pub late: bool,
    #[serde(default)]
    pub xp: u32,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub results: Vec<TaskResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Lab {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub status: LabStatus,
    #[serde(default)]
    pub due_on: Option<DateTime<Utc>>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

impl Lab {
    /// Records a submission, keeping at most one per student. A repeated
    /// submission replaces the previous record; lateness and timestamp are
    /// recomputed for the replacement.
    pub fn record_submission(
        &mut self,
        student: Uuid,
        code: String,
        now: DateTime<Utc>,
    ) -> &Submission {
        let late = self.due_on.map(|due| now > due).unwrap_or(false);
        let submission = Submission {
            student,
            code,
            submitted_on: now,
            late,
            xp: 0,
            status: SubmissionStatus::Submitted,
            results: Vec::new(),
        };

        let slot = self.submissions.iter().position(|s| s.student == student);
        match slot {
            Some(i) => {
                self.submissions[i] = submission;
                &self.submissions[i]
            }
            None => {
                self.submissions.push(submission);
                self.submissions.last().unwrap()
            }
        }
    }

    pub fn submission_for(&self, student: Uuid) -> Option<&Submission> {
        self.submissions.iter().find(|s| s.student == student)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Class {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    /// Weak reference; the Teacher document lives independently.
    pub teacher: Uuid,
    #[serde(default)]
    pub students: Vec<Uuid>,
    #[serde(default)]
    pub labs: Vec<Lab>,
}

impl Class {
    /// Adds students with set semantics. Insertion order of new members is
    /// kept, duplicates are dropped.
    pub fn add_students(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        for id in ids {
            if !self.students.contains(&id) {
                self.students.push(id);
            }
        }
    }

    pub fn remove_student(&mut self, id: Uuid) -> bool {
        let before = self.students.len();
        self.students.retain(|s| *s != id);
        self.students.len() != before
    }

    /// Labs shown in the student's "active" view.
    pub fn active_labs(&self) -> impl Iterator<Item = &Lab> {
        self.labs.iter().filter(|l| l.status == LabStatus::Active)
    }

    /// Labs shown in the student's "history" view: everything that has left
    /// Draft and is no longer Active. Together with [`Self::active_labs`]
    /// this partitions all non-Draft labs.
    pub fn history_labs(&self) -> impl Iterator<Item = &Lab> {
        self.labs
            .iter()
            .filter(|l| l.status != LabStatus::Draft && l.status != LabStatus::Active)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AggregateError {
    #[error("lab '{lab}' has no tasks")]
    EmptyTaskList { lab: String },
    #[error("lab '{lab}' has multiple tasks with id {task}")]
    DuplicateTaskId { lab: String, task: u32 },
    #[error("lab '{lab}' task {task} has an invalid regex pattern: {pattern}")]
    InvalidRegex {
        lab: String,
        task: u32,
        pattern: String,
    },
}

/// Aggregate root. One document per course; embedded classes, labs, tasks
/// and submissions share its transaction boundary. Unique per
/// (tenant, course_code).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Course {
    #[serde(
        default = "Uuid::new_v4",
        rename = "_id",
        with = "bson::serde_helpers::uuid_1_as_binary"
    )]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub tenant: Uuid,
    pub title: String,
    pub course_code: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub classes: Vec<Class>,
    /// Bumped on every save; writes are conditional on the loaded value.
    #[serde(default)]
    pub version: u64,
}

impl Course {
    /// Checks invariants of the whole embedded tree. Runs before every
    /// persistence, so a patch can't sneak an empty task list past the
    /// create-time check.
    pub fn validate(&self) -> Result<(), AggregateError> {
        for class in &self.classes {
            for lab in &class.labs {
                if lab.tasks.is_empty() {
                    return Err(AggregateError::EmptyTaskList {
                        lab: lab.name.clone(),
                    });
                }

                let mut seen = HashSet::new();
                for task in &lab.tasks {
                    if !seen.insert(task.id) {
                        return Err(AggregateError::DuplicateTaskId {
                            lab: lab.name.clone(),
                            task: task.id,
                        });
                    }

                    // Regex comparisons fail at grading time otherwise, long
                    // after the author stopped looking at the lab.
                    for case in &task.test_cases {
                        if matches!(case.comparison, Comparison::Regex)
                            && regex::Regex::new(&case.expected).is_err()
                        {
                            return Err(AggregateError::InvalidRegex {
                                lab: lab.name.clone(),
                                task: task.id,
                                pattern: case.expected.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Distinct teachers referenced by this course's classes.
    pub fn teachers(&self) -> HashSet<Uuid> {
        self.classes.iter().map(|c| c.teacher).collect()
    }

    pub fn class(&self, id: Uuid) -> Option<&Class> {
        self.classes.iter().find(|c| c.id == id)
    }

    pub fn class_mut(&mut self, id: Uuid) -> Option<&mut Class> {
        self.classes.iter_mut().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lab_with_tasks(name: &str, task_ids: &[u32]) -> Lab {
        Lab {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: LabStatus::Draft,
            due_on: None,
            tasks: task_ids
                .iter()
                .map(|id| Task {
                    id: *id,
                    instructions: String::new(),
                    weight: 1.0,
                    test_cases: vec![],
                    constraints: vec![],
                })
                .collect(),
            submissions: vec![],
        }
    }

    fn course_with_labs(labs: Vec<Lab>) -> Course {
        Course {
            id: Uuid::new_v4(),
            tenant: Uuid::new_v4(),
            title: "Intro".to_string(),
            course_code: "CS101".to_string(),
            created: Utc::now(),
            classes: vec![Class {
                id: Uuid::new_v4(),
                name: "A".to_string(),
                teacher: Uuid::new_v4(),
                students: vec![],
                labs,
            }],
            version: 0,
        }
    }

    #[test]
    fn empty_task_list_fails_validation() {
        let course = course_with_labs(vec![lab_with_tasks("lab1", &[])]);
        assert_eq!(
            course.validate(),
            Err(AggregateError::EmptyTaskList {
                lab: "lab1".to_string()
            })
        );
    }

    #[test]
    fn duplicate_task_ids_fail_validation() {
        let course = course_with_labs(vec![lab_with_tasks("lab1", &[1, 2, 1])]);
        assert_eq!(
            course.validate(),
            Err(AggregateError::DuplicateTaskId {
                lab: "lab1".to_string(),
                task: 1
            })
        );
    }

    #[test]
    fn valid_course_passes_validation() {
        let course = course_with_labs(vec![lab_with_tasks("lab1", &[1, 2, 3])]);
        assert_eq!(course.validate(), Ok(()));
    }

    #[test]
    fn broken_regex_pattern_fails_validation() {
        let mut lab = lab_with_tasks("lab1", &[1]);
        lab.tasks[0].test_cases.push(TestCase {
            input: "2 2".to_string(),
            expected: "4(".to_string(),
            comparison: Comparison::Regex,
            hidden: false,
        });
        let course = course_with_labs(vec![lab]);

        assert_eq!(
            course.validate(),
            Err(AggregateError::InvalidRegex {
                lab: "lab1".to_string(),
                task: 1,
                pattern: "4(".to_string(),
            })
        );
    }

    #[test]
    fn regex_validation_ignores_other_comparison_modes() {
        let mut lab = lab_with_tasks("lab1", &[1]);
        // Exact comparisons may contain anything, including regex
        // metacharacters.
        lab.tasks[0].test_cases.push(TestCase {
            input: "2 2".to_string(),
            expected: "4(".to_string(),
            comparison: Comparison::Exact,
            hidden: false,
        });
        let course = course_with_labs(vec![lab]);

        assert_eq!(course.validate(), Ok(()));
    }

    #[test]
    fn resubmission_replaces_previous_record() {
        let mut lab = lab_with_tasks("lab1", &[1]);
        let student = Uuid::new_v4();
        let now = Utc::now();

        lab.record_submission(student, "first".to_string(), now);
        lab.record_submission(student, "second".to_string(), now + Duration::minutes(5));

        assert_eq!(lab.submissions.len(), 1, "expected a single record");
        assert_eq!(lab.submissions[0].code, "second");
        assert_eq!(lab.submissions[0].submitted_on, now + Duration::minutes(5));
    }

    #[test]
    fn lateness_compares_against_due_date() {
        let mut lab = lab_with_tasks("lab1", &[1]);
        let due = Utc::now();
        lab.due_on = Some(due);

        let on_time = lab
            .record_submission(Uuid::new_v4(), "a".into(), due - Duration::seconds(1))
            .late;
        let late = lab
            .record_submission(Uuid::new_v4(), "b".into(), due + Duration::seconds(1))
            .late;

        assert!(!on_time, "submission before due date flagged late");
        assert!(late, "submission after due date not flagged late");
    }

    #[test]
    fn no_due_date_is_never_late() {
        let mut lab = lab_with_tasks("lab1", &[1]);
        assert!(
            !lab.record_submission(Uuid::new_v4(), "a".into(), Utc::now())
                .late
        );
    }

    #[test]
    fn student_set_add_is_idempotent() {
        let mut class = Class {
            id: Uuid::new_v4(),
            name: "A".to_string(),
            teacher: Uuid::new_v4(),
            students: vec![],
            labs: vec![],
        };
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        class.add_students([s1, s2, s1]);
        class.add_students([s2]);

        assert_eq!(class.students, vec![s1, s2]);
    }

    #[test]
    fn draft_labs_are_excluded_from_both_views() {
        let mut draft = lab_with_tasks("draft", &[1]);
        draft.status = LabStatus::Draft;
        let mut active = lab_with_tasks("active", &[1]);
        active.status = LabStatus::Active;
        let mut closed = lab_with_tasks("closed", &[1]);
        closed.status = LabStatus::Closed;

        let class = Class {
            id: Uuid::new_v4(),
            name: "A".to_string(),
            teacher: Uuid::new_v4(),
            students: vec![],
            labs: vec![draft, active, closed],
        };

        let active_names: Vec<_> = class.active_labs().map(|l| l.name.as_str()).collect();
        let history_names: Vec<_> = class.history_labs().map(|l| l.name.as_str()).collect();

        assert_eq!(active_names, vec!["active"]);
        assert_eq!(history_names, vec!["closed"]);
    }
}
