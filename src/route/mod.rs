use std::collections::BTreeMap;

use rocket::{Build, Rocket, Route};

pub mod auth;
pub mod course;
pub mod lab;
pub mod payment;
pub mod teacher;

use auth::*;
use course::*;
use lab::*;
use payment::*;
use teacher::*;

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    data::course as cd,
    data::course::db::{
        CourseCreateData, CoursePatch, StudentAddOutcome, StudentAddStatus, StudentRecord,
    },
    data::identity::db::{LoginData, SignupData},
    data::payment::PaymentEvent,
    resp::{jwt::doc::JWTAuth, problem::Problem},
    role::Role,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        course_list,
        course_create,
        course_info,
        course_update,
        course_delete,
        class_add_students,
        labs_active,
        labs_history,
        submission_post,
        teacher_create,
        teacher_stats,
        teacher_stats_recompute,
        signup,
        login,
        mfa_setup,
        mfa_verify,
        mfa_disable,
        payment_webhook
    ),
    components(schemas(
        Role,
        cd::Course,
        cd::Class,
        cd::Lab,
        cd::LabStatus,
        cd::Task,
        cd::TestCase,
        cd::Comparison,
        cd::CodeConstraint,
        cd::ConstraintRule,
        cd::Submission,
        cd::SubmissionStatus,
        cd::TaskResult,
        CourseCreateData,
        CoursePatch,
        StudentRecord,
        StudentAddOutcome,
        StudentAddStatus,
        CourseListResponse,
        LabView,
        TaskView,
        SubmissionView,
        SubmissionCreateData,
        TeacherResponse,
        SignupData,
        SignupRequest,
        LoginData,
        LoginResponse,
        MfaSetupResponse,
        MfaVerifyData,
        PaymentEvent,
        WebhookAck,
        Problem
    )),
    modifiers(&JWTAuth, &V1_PREFIX)
)]
pub struct ApiDocV1;

pub struct PathPrefix(pub &'static str);
static V1_PREFIX: PathPrefix = PathPrefix("/api/v1");

impl utoipa::Modify for PathPrefix {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let mut new_paths = BTreeMap::new();

        for (path, item) in std::mem::take(&mut openapi.paths.paths) {
            new_paths.insert(self.0.to_string() + path.as_ref(), item);
        }

        openapi.paths.paths = new_paths;
    }
}

pub fn api_v1() -> Vec<Route> {
    routes![
        course_list,
        course_create,
        course_info,
        course_update,
        course_delete,
        class_add_students,
        labs_active,
        labs_history,
        submission_post,
        teacher_create,
        teacher_stats,
        teacher_stats_recompute,
        signup,
        login,
        mfa_setup,
        mfa_verify,
        mfa_disable,
        payment_webhook
    ]
}

pub fn mount_api(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/api/v1", api_v1()).mount(
        "/",
        SwaggerUi::new("/swagger/<_..>").url("/api/v1/openapi.json", ApiDocV1::openapi()),
    )
}
