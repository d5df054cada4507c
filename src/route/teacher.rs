use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::identity::db::{IdentityDbExt, SignupData};
use crate::data::identity::Teacher;
use crate::data::stats::StatsDbExt;
use crate::resp::jwt::{auth_problem, AccessClaims};
use crate::resp::problem::{problems, Problem};
use crate::role::Role;

#[derive(Debug, Serialize, ToSchema)]
pub struct TeacherResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    /// Cached load projection; see the stats recompute endpoints for
    /// freshness.
    pub course_load: u32,
    pub classes_load: u32,
    pub students: u32,
}

impl From<Teacher> for TeacherResponse {
    fn from(value: Teacher) -> Self {
        Self {
            id: value.id,
            email: value.email,
            name: value.name,
            course_load: value.course_load,
            classes_load: value.classes_load,
            students: value.students,
        }
    }
}

/// Create a teacher account
#[utoipa::path(
    request_body = SignupData,
    responses(
        (status = 200, description = "Created teacher", body = TeacherResponse),
        (status = 400, description = "Invalid email or weak password", body = Problem),
        (status = 401, description = "Caller is not an admin", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/teacher", format = "application/json", data = "<teacher>")]
#[tracing::instrument(skip(db))]
pub async fn teacher_create(
    teacher: Json<SignupData>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<TeacherResponse>, Problem> {
    if auth.role < Role::Admin {
        return Err(auth_problem("Only admins can create teacher accounts."));
    }

    let created = db.create_teacher(auth.tenant, teacher.into_inner()).await?;

    Ok(Json(created.into()))
}

/// Get a teacher with cached load statistics
#[utoipa::path(
    params(("id", description = "teacher ID")),
    responses(
        (status = 200, description = "Teacher with cached loads", body = TeacherResponse),
        (status = 404, description = "Teacher doesn't exist in the caller's tenant", body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/teacher/<id>/stats")]
#[tracing::instrument(skip(db))]
pub async fn teacher_stats(
    id: Uuid,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<TeacherResponse>, Problem> {
    if !auth.role.can_author() {
        return Err(auth_problem("Permission level too low."));
    }

    let teacher = db
        .get_teacher(auth.tenant, id)
        .await?
        .ok_or_else(|| problems::not_found("teacher", id))?;

    Ok(Json(teacher.into()))
}

/// Recompute load statistics for every assigned teacher
///
/// Safe to run at any time; the projection is a full overwrite and cannot
/// drift with repeated runs.
#[utoipa::path(
    responses(
        (status = 200, description = "Recompute finished"),
        (status = 401, description = "Caller is not an admin", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/teacher/stats/recompute")]
#[tracing::instrument(skip(db))]
pub async fn teacher_stats_recompute(
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<(), Problem> {
    if auth.role < Role::Admin {
        return Err(auth_problem("Only admins can trigger a global recompute."));
    }

    db.recompute_teacher_loads(auth.tenant, None).await
}
