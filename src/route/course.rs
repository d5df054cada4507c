use chrono::{DateTime, Utc};
use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::course::db::{
    CourseCreateData, CourseDbExt, CoursePatch, StudentAddOutcome, StudentRecord,
};
use crate::data::course::Course;
use crate::resp::jwt::{auth_problem, AccessClaims};
use crate::resp::problem::{problems, Problem};

#[derive(Debug, Serialize, ToSchema)]
pub struct CourseListResponse {
    pub id: Uuid,
    pub title: String,
    pub course_code: String,
    pub created: DateTime<Utc>,
    pub classes: usize,
}

impl From<Course> for CourseListResponse {
    fn from(value: Course) -> Self {
        Self {
            id: value.id,
            title: value.title,
            course_code: value.course_code,
            created: value.created,
            classes: value.classes.len(),
        }
    }
}

/// List the tenant's courses
#[utoipa::path(
    responses(
        (status = 200, description = "Courses of the caller's tenant", body = Vec<CourseListResponse>),
        (status = 401, description = "Missing/expired token or insufficient privileges", body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/course")]
#[tracing::instrument(skip(db))]
pub async fn course_list(
    db: &State<Database>,
    auth: AccessClaims,
) -> Result<Json<Vec<CourseListResponse>>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let courses = db.list_courses(auth.tenant).await?;

    Ok(Json(courses.into_iter().map(Into::into).collect()))
}

/// Create a course
#[utoipa::path(
    request_body = CourseCreateData,
    responses(
        (status = 200, description = "Created course", body = Course),
        (status = 400, description = "Aggregate validation failed", body = Problem),
        (status = 409, description = "Course code already used in tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/course", format = "application/json", data = "<course>")]
#[tracing::instrument(skip(db))]
pub async fn course_create(
    course: Json<CourseCreateData>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<Course>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let created = db.create_course(auth.tenant, course.into_inner()).await?;

    Ok(Json(created))
}

/// Get course information
#[utoipa::path(
    params(("id", description = "course ID")),
    responses(
        (status = 200, description = "Information about the course", body = Course),
        (status = 404, description = "Queried course doesn't exist in the caller's tenant"),
    ),
    security(("jwt" = []))
)]
#[get("/course/<id>")]
#[tracing::instrument(skip(db))]
pub async fn course_info(
    id: Uuid,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Option<Json<Course>>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let course = db.get_course(auth.tenant, id).await?;

    Ok(course.map(Json))
}

/// Update a course
#[utoipa::path(
    params(("id", description = "course ID")),
    request_body = CoursePatch,
    responses(
        (status = 200, description = "Updated course", body = Course),
        (status = 404, description = "Queried course doesn't exist in the caller's tenant", body = Problem),
        (status = 409, description = "Version conflict or duplicate course code", body = Problem),
    ),
    security(("jwt" = []))
)]
#[put("/course/<id>", format = "application/json", data = "<patch>")]
#[tracing::instrument(skip(db))]
pub async fn course_update(
    id: Uuid,
    patch: Json<CoursePatch>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<Course>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let updated = db.update_course(auth.tenant, id, patch.into_inner()).await?;

    Ok(Json(updated))
}

/// Delete a course
///
/// Embedded classes, labs and submissions go with it; affected teachers'
/// cached loads are recomputed from the pre-delete class assignments.
#[utoipa::path(
    params(("id", description = "course ID")),
    responses(
        (status = 200, description = "Deleted course id", body = String),
        (status = 404, description = "Queried course doesn't exist in the caller's tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[delete("/course/<id>")]
#[tracing::instrument(skip(db))]
pub async fn course_delete(
    id: Uuid,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<String, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let deleted = db.delete_course(auth.tenant, id).await?;

    Ok(deleted.id.to_string())
}

/// Add students to a class
///
/// Each record is upserted by (tenant, email) and linked into the class
/// student set. The batch is not atomic; the response carries one outcome
/// per input record.
#[utoipa::path(
    params(
        ("id", description = "course ID"),
        ("class_id", description = "class ID"),
    ),
    request_body = Vec<StudentRecord>,
    responses(
        (status = 200, description = "Per-record outcomes", body = Vec<StudentAddOutcome>),
        (status = 404, description = "Course or class doesn't exist in the caller's tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post(
    "/course/<id>/class/<class_id>/students",
    format = "application/json",
    data = "<students>"
)]
#[tracing::instrument(skip(db))]
pub async fn class_add_students(
    id: Uuid,
    class_id: Uuid,
    students: Json<Vec<StudentRecord>>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<Vec<StudentAddOutcome>>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    if students.is_empty() {
        return Err(problems::validation_failed("No student records provided."));
    }

    let outcomes = db
        .add_students_to_class(auth.tenant, id, class_id, students.into_inner())
        .await?;

    Ok(Json(outcomes))
}
