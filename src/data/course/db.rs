use bson::{from_bson, Bson, Document};
use chrono::Utc;
use mongodb::Database;
use rocket::futures::StreamExt;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Class, Course, Submission, COURSE_COLLECTION_NAME};
use crate::data::filter;
use crate::data::identity::db::IdentityDbExt;
use crate::data::stats::StatsDbExt;
use crate::resp::problem::{problems, Problem};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CourseCreateData {
    pub title: String,
    pub course_code: String,
    #[serde(default)]
    pub classes: Vec<Class>,
}

/// Document-level patch; embedded classes are replaced wholesale, matching
/// the single-document consistency boundary. The tenant field is absent on
/// purpose and can never be replaced.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CoursePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub course_code: Option<String>,
    #[serde(default)]
    pub classes: Option<Vec<Class>>,
}

/// One raw record from the bulk importer. The importer deduplicates by email
/// before calling us; credentials are optional and replaced by a random
/// password when absent.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StudentRecord {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub enum StudentAddStatus {
    Created,
    Updated,
    Failed,
}

/// Per-item outcome of a student batch add. The batch is not atomic; callers
/// get one entry per input record instead of an all-or-nothing error.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StudentAddOutcome {
    pub email: String,
    pub status: StudentAddStatus,
    pub id: Option<Uuid>,
    pub detail: Option<String>,
}

pub trait CourseDbExt {
    async fn create_course(&self, tenant: Uuid, data: CourseCreateData) -> Result<Course, Problem>;

    async fn get_course(&self, tenant: Uuid, id: Uuid) -> Result<Option<Course>, Problem>;

    async fn list_courses(&self, tenant: Uuid) -> Result<Vec<Course>, Problem>;

    async fn update_course(
        &self,
        tenant: Uuid,
        id: Uuid,
        patch: CoursePatch,
    ) -> Result<Course, Problem>;

    async fn delete_course(&self, tenant: Uuid, id: Uuid) -> Result<Course, Problem>;

    /// Saves a modified aggregate, conditional on the version it was loaded
    /// at. Concurrent writers lose with a conflict instead of silently
    /// overwriting each other.
    async fn replace_course(&self, course: Course) -> Result<Course, Problem>;

    async fn add_students_to_class(
        &self,
        tenant: Uuid,
        course_id: Uuid,
        class_id: Uuid,
        students: Vec<StudentRecord>,
    ) -> Result<Vec<StudentAddOutcome>, Problem>;

    async fn record_submission(
        &self,
        tenant: Uuid,
        course_id: Uuid,
        class_id: Uuid,
        lab_id: Uuid,
        student: Uuid,
        code: String,
    ) -> Result<Submission, Problem>;
}

impl CourseDbExt for Database {
    async fn create_course(&self, tenant: Uuid, data: CourseCreateData) -> Result<Course, Problem> {
        let existing = self
            .collection::<Document>(COURSE_COLLECTION_NAME)
            .find_one(filter::by_course_code(&data.course_code, tenant), None)
            .await
            .map_err(Problem::from)?;

        if existing.is_some() {
            return Err(problems::duplicate_key("course_code", &data.course_code));
        }

        let course = Course {
            id: Uuid::new_v4(),
            tenant,
            title: data.title,
            course_code: data.course_code,
            created: Utc::now(),
            classes: data.classes,
            version: 0,
        };

        course
            .validate()
            .map_err(|e| problems::validation_failed(e))?;

        self.collection(COURSE_COLLECTION_NAME)
            .insert_one(
                bson::to_document(&course).expect("Course must be serializable to BSON"),
                None,
            )
            .await
            // The pre-check races with concurrent creates; the unique index
            // turns the loser into a conflict, not an internal error.
            .map_err(|e| {
                if crate::data::is_duplicate_key(&e) {
                    problems::duplicate_key("course_code", &course.course_code)
                } else {
                    Problem::from(e)
                }
            })?;

        let teachers = course.teachers();
        if !teachers.is_empty() {
            self.recompute_teacher_loads(tenant, Some(&teachers)).await?;
        }

        Ok(course)
    }

    async fn get_course(&self, tenant: Uuid, id: Uuid) -> Result<Option<Course>, Problem> {
        let document = self
            .collection::<Document>(COURSE_COLLECTION_NAME)
            .find_one(filter::by_id_in_tenant(id, tenant), None)
            .await
            .map_err(Problem::from)?;

        match document {
            Some(doc) => Ok(Some(from_bson(Bson::Document(doc)).map_err(Problem::from)?)),
            None => Ok(None),
        }
    }

    async fn list_courses(&self, tenant: Uuid) -> Result<Vec<Course>, Problem> {
        let mut documents = self
            .collection::<Document>(COURSE_COLLECTION_NAME)
            .find(filter::by_tenant(tenant), None)
            .await
            .map_err(Problem::from)?;

        let mut courses = vec![];
        while let Some(result) = documents.next().await {
            let document = Bson::Document(result.map_err(Problem::from)?);
            match from_bson::<Course>(document) {
                Ok(course) => courses.push(course),
                Err(_) => {
                    tracing::warn!("Unable to deserialize Course document.")
                }
            }
        }

        Ok(courses)
    }

    async fn update_course(
        &self,
        tenant: Uuid,
        id: Uuid,
        patch: CoursePatch,
    ) -> Result<Course, Problem> {
        let mut course = self
            .get_course(tenant, id)
            .await?
            .ok_or_else(|| problems::not_found("course", id))?;

        let teachers_before = course.teachers();

        if let Some(title) = patch.title {
            course.title = title;
        }
        if let Some(code) = patch.course_code {
            if code != course.course_code {
                let taken = self
                    .collection::<Document>(COURSE_COLLECTION_NAME)
                    .find_one(filter::by_course_code(&code, tenant), None)
                    .await
                    .map_err(Problem::from)?;
                if taken.is_some() {
                    return Err(problems::duplicate_key("course_code", &code));
                }
                course.course_code = code;
            }
        }
        if let Some(classes) = patch.classes {
            course.classes = classes;
        }

        course
            .validate()
            .map_err(|e| problems::validation_failed(e))?;

        let course = self.replace_course(course).await?;

        // Union of assignments before and after, so teachers dropped by the
        // patch are recomputed down to their remaining load.
        let mut affected = teachers_before;
        affected.extend(course.teachers());
        if !affected.is_empty() {
            self.recompute_teacher_loads(tenant, Some(&affected)).await?;
        }

        Ok(course)
    }

    async fn delete_course(&self, tenant: Uuid, id: Uuid) -> Result<Course, Problem> {
        let course = self
            .get_course(tenant, id)
            .await?
            .ok_or_else(|| problems::not_found("course", id))?;

        // Snapshot before delete; afterwards the aggregate no longer knows
        // which teachers it referenced and their loads would under-count.
        let teachers = course.teachers();

        self.collection::<Course>(COURSE_COLLECTION_NAME)
            .delete_one(filter::by_id_in_tenant(id, tenant), None)
            .await
            .map_err(Problem::from)?;

        if !teachers.is_empty() {
            self.recompute_teacher_loads(tenant, Some(&teachers)).await?;
        }

        Ok(course)
    }

    async fn replace_course(&self, mut course: Course) -> Result<Course, Problem> {
        let loaded_version = course.version;
        course.version += 1;

        let mut condition = filter::by_id_in_tenant(course.id, course.tenant);
        condition.insert("version", loaded_version as i64);

        let result = self
            .collection::<Document>(COURSE_COLLECTION_NAME)
            .replace_one(
                condition,
                bson::to_document(&course).expect("Course must be serializable to BSON"),
                None,
            )
            .await
            // A replace can only violate the (tenant, course_code) index when
            // a concurrent create claimed the patched code first.
            .map_err(|e| {
                if crate::data::is_duplicate_key(&e) {
                    problems::duplicate_key("course_code", &course.course_code)
                } else {
                    Problem::from(e)
                }
            })?;

        if result.modified_count == 0 {
            return Err(problems::write_conflict("course", course.id));
        }

        Ok(course)
    }

    async fn add_students_to_class(
        &self,
        tenant: Uuid,
        course_id: Uuid,
        class_id: Uuid,
        students: Vec<StudentRecord>,
    ) -> Result<Vec<StudentAddOutcome>, Problem> {
        let mut course = self
            .get_course(tenant, course_id)
            .await?
            .ok_or_else(|| problems::not_found("course", course_id))?;

        course
            .class(class_id)
            .ok_or_else(|| problems::not_found("class", class_id))?;

        let mut outcomes = vec![];
        let mut linked = vec![];

        // Each upsert stands alone; one bad record doesn't abort the batch.
        for record in students {
            let email = record.email.clone();
            match self
                .upsert_student(tenant, record, course_id, class_id)
                .await
            {
                Ok((id, created)) => {
                    linked.push(id);
                    outcomes.push(StudentAddOutcome {
                        email,
                        status: if created {
                            StudentAddStatus::Created
                        } else {
                            StudentAddStatus::Updated
                        },
                        id: Some(id),
                        detail: None,
                    });
                }
                Err(problem) => {
                    tracing::warn!("student upsert failed for '{}': {}", email, problem);
                    outcomes.push(StudentAddOutcome {
                        email,
                        status: StudentAddStatus::Failed,
                        id: None,
                        detail: Some(problem.title.clone()),
                    });
                }
            }
        }

        let class = course
            .class_mut(class_id)
            .expect("class presence checked above");
        class.add_students(linked);
        let teacher = class.teacher;

        let course = self.replace_course(course).await?;
        debug_assert!(course.class(class_id).is_some());

        self.recompute_teacher_loads(tenant, Some(&[teacher].into_iter().collect()))
            .await?;

        Ok(outcomes)
    }

    async fn record_submission(
        &self,
        tenant: Uuid,
        course_id: Uuid,
        class_id: Uuid,
        lab_id: Uuid,
        student: Uuid,
        code: String,
    ) -> Result<Submission, Problem> {
        let mut course = self
            .get_course(tenant, course_id)
            .await?
            .ok_or_else(|| problems::not_found("course", course_id))?;

        let class = course
            .class_mut(class_id)
            .ok_or_else(|| problems::not_found("class", class_id))?;

        if !class.students.contains(&student) {
            return Err(problems::validation_failed(
                "Student is not a member of the class.",
            ));
        }

        let lab = class
            .labs
            .iter_mut()
            .find(|l| l.id == lab_id)
            .ok_or_else(|| problems::not_found("lab", lab_id))?;

        if lab.status == super::LabStatus::Draft {
            return Err(problems::not_found("lab", lab_id));
        }

        let submission = lab.record_submission(student, code, Utc::now()).clone();

        self.replace_course(course).await?;

        Ok(submission)
    }
}
