use chrono::{DateTime, Utc};
use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::course::db::CourseDbExt;
use crate::data::course::{
    Class, CodeConstraint, Lab, LabStatus, Submission, SubmissionStatus, TaskResult, TestCase,
};
use crate::resp::jwt::{auth_problem, AccessClaims};
use crate::resp::problem::{problems, Problem};
use crate::role::Role;

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskView {
    pub id: u32,
    pub instructions: String,
    pub weight: f64,
    /// Hidden cases are stripped before this leaves the server.
    pub test_cases: Vec<TestCase>,
    pub constraints: Vec<CodeConstraint>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmissionView {
    pub code: String,
    pub submitted_on: DateTime<Utc>,
    pub late: bool,
    pub xp: u32,
    pub status: SubmissionStatus,
    pub results: Vec<TaskResult>,
}

impl From<&Submission> for SubmissionView {
    fn from(value: &Submission) -> Self {
        Self {
            code: value.code.clone(),
            submitted_on: value.submitted_on,
            late: value.late,
            xp: value.xp,
            status: value.status,
            results: value.results.clone(),
        }
    }
}

/// Student-facing rendering of a lab: hidden test cases removed, submissions
/// reduced to the student's own record.
#[derive(Debug, Serialize, ToSchema)]
pub struct LabView {
    pub id: Uuid,
    pub name: String,
    pub status: LabStatus,
    pub due_on: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskView>,
    pub submission: Option<SubmissionView>,
}

impl LabView {
    pub fn for_student(lab: &Lab, student: Uuid) -> LabView {
        LabView {
            id: lab.id,
            name: lab.name.clone(),
            status: lab.status,
            due_on: lab.due_on,
            tasks: lab
                .tasks
                .iter()
                .map(|t| TaskView {
                    id: t.id,
                    instructions: t.instructions.clone(),
                    weight: t.weight,
                    test_cases: t.test_cases.iter().filter(|c| !c.hidden).cloned().collect(),
                    constraints: t.constraints.clone(),
                })
                .collect(),
            submission: lab.submission_for(student).map(Into::into),
        }
    }
}

async fn load_class(
    db: &Database,
    auth: &AccessClaims,
    course_id: Uuid,
    class_id: Uuid,
) -> Result<Class, Problem> {
    let course = db
        .get_course(auth.tenant, course_id)
        .await?
        .ok_or_else(|| problems::not_found("course", course_id))?;

    let class = course
        .class(class_id)
        .ok_or_else(|| problems::not_found("class", class_id))?
        .clone();

    // Students only see classes they belong to; the teacher surface goes
    // through the course document instead.
    if auth.role == Role::Student && !class.students.contains(&auth.user) {
        return Err(auth_problem("Not a member of this class."));
    }

    Ok(class)
}

/// Active labs of a class
///
/// Draft labs are never exposed here or in the history view.
#[utoipa::path(
    params(
        ("id", description = "course ID"),
        ("class_id", description = "class ID"),
    ),
    responses(
        (status = 200, description = "Labs open for submission", body = Vec<LabView>),
        (status = 404, description = "Course or class doesn't exist in the caller's tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/course/<id>/class/<class_id>/labs/active")]
#[tracing::instrument(skip(db))]
pub async fn labs_active(
    id: Uuid,
    class_id: Uuid,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<Vec<LabView>>, Problem> {
    let class = load_class(db, &auth, id, class_id).await?;

    Ok(Json(
        class
            .active_labs()
            .map(|lab| LabView::for_student(lab, auth.user))
            .collect(),
    ))
}

/// Past labs of a class
#[utoipa::path(
    params(
        ("id", description = "course ID"),
        ("class_id", description = "class ID"),
    ),
    responses(
        (status = 200, description = "Labs no longer open for submission", body = Vec<LabView>),
        (status = 404, description = "Course or class doesn't exist in the caller's tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/course/<id>/class/<class_id>/labs/history")]
#[tracing::instrument(skip(db))]
pub async fn labs_history(
    id: Uuid,
    class_id: Uuid,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<Vec<LabView>>, Problem> {
    let class = load_class(db, &auth, id, class_id).await?;

    Ok(Json(
        class
            .history_labs()
            .map(|lab| LabView::for_student(lab, auth.user))
            .collect(),
    ))
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubmissionCreateData {
    pub code: String,
}

/// Submit code for a lab
///
/// At most one submission per student and lab; resubmitting replaces the
/// previous record and recomputes the lateness flag.
#[utoipa::path(
    params(
        ("id", description = "course ID"),
        ("class_id", description = "class ID"),
        ("lab_id", description = "lab ID"),
    ),
    request_body = SubmissionCreateData,
    responses(
        (status = 200, description = "Stored submission", body = SubmissionView),
        (status = 400, description = "Submitter is not a member of the class", body = Problem),
        (status = 404, description = "Course, class or lab doesn't exist in the caller's tenant", body = Problem),
        (status = 409, description = "Concurrent course modification, retry", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post(
    "/course/<id>/class/<class_id>/lab/<lab_id>/submission",
    format = "application/json",
    data = "<submission>"
)]
#[tracing::instrument(skip(db))]
pub async fn submission_post(
    id: Uuid,
    class_id: Uuid,
    lab_id: Uuid,
    submission: Json<SubmissionCreateData>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<SubmissionView>, Problem> {
    if submission.code.trim().is_empty() {
        return Err(problems::validation_failed("Submitted code is empty."));
    }

    let stored = db
        .record_submission(
            auth.tenant,
            id,
            class_id,
            lab_id,
            auth.user,
            submission.into_inner().code,
        )
        .await?;

    Ok(Json(SubmissionView::from(&stored)))
}
