use bson::{doc, from_bson, Bson, Document};
use mongodb::Database;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    identity_id, Identity, MfaState, PasswordHash, Student, Teacher, User,
    STUDENT_COLLECTION_NAME, TEACHER_COLLECTION_NAME, USER_COLLECTION_NAME,
};
use crate::data::course::db::StudentRecord;
use crate::data::filter;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;

pub mod problem {
    use crate::resp::problem::Problem;
    use rocket::http::Status;

    #[inline]
    pub fn bad_email(email: impl ToString, detail: impl ToString) -> Problem {
        Problem::new_untyped(Status::BadRequest, "Bad email.")
            .insert_str("email", email)
            .detail(detail)
            .to_owned()
    }

    #[inline]
    pub fn bad_password(detail: impl ToString) -> Problem {
        Problem::new_untyped(Status::BadRequest, "Bad password.")
            .detail(detail)
            .to_owned()
    }

    #[inline]
    pub fn bad_login() -> Problem {
        Problem::new_untyped(Status::Unauthorized, "Bad email or password.")
    }
}

fn validate_email(email: &str) -> Result<(), Problem> {
    if !email.contains('@') {
        return Err(problem::bad_email(email, "Not a valid e-mail address."));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), Problem> {
    if password.len() < 8 {
        return Err(problem::bad_password(
            "Password must be at least 8 characters (bytes) long.",
        ));
    }
    if password.len() > 1024 {
        return Err(problem::bad_password(
            "Passwords longer than 1024 characters aren't supported.",
        ));
    }
    Ok(())
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct SignupData {
    #[schema(format = "email")]
    pub email: String,
    pub name: String,
    #[schema(format = "password")]
    pub password: String,
}

impl std::fmt::Debug for SignupData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignupData:{}", self.email)
    }
}

impl SignupData {
    pub fn validate(&self) -> Result<(), Problem> {
        validate_email(&self.email)?;
        validate_password(&self.password)
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct LoginData {
    /// No token exists yet at login, so the tenant comes from the request.
    pub tenant: Uuid,
    pub email: String,
    #[schema(format = "password")]
    pub password: String,
    /// Required when the identity has MFA enabled.
    #[serde(default)]
    pub totp: Option<String>,
}

impl std::fmt::Debug for LoginData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoginData:{}", self.email)
    }
}

pub trait IdentityDbExt {
    /// One indexed lookup per role collection, returning a tagged variant.
    /// Resolution order is Teacher, User, Student; emails are unique per
    /// (tenant, collection) via index.
    async fn find_identity(
        &self,
        tenant: Uuid,
        email: impl AsRef<str>,
    ) -> Result<Option<Identity>, Problem>;

    /// Resolves an identity by id, probing the same collections as
    /// [`Self::find_identity`]. The granted role says nothing about where the
    /// identity lives: staff accounts carry the Teacher role but are stored
    /// in the users collection.
    async fn find_identity_by_id(
        &self,
        tenant: Uuid,
        id: Uuid,
    ) -> Result<Option<Identity>, Problem>;

    /// Verifies credentials (hashed comparison for every role) and the MFA
    /// code when one is required.
    async fn login(&self, data: LoginData) -> Result<Identity, Problem>;

    async fn create_teacher(&self, tenant: Uuid, data: SignupData) -> Result<Teacher, Problem>;

    async fn create_user(
        &self,
        tenant: Uuid,
        data: SignupData,
        admin_emails: impl AsRef<[String]>,
    ) -> Result<User, Problem>;

    /// Upserts a student by (tenant, email): creates it when absent, else
    /// overwrites the provided profile fields and reassigns course/class.
    /// Returns the student id and whether it was created.
    async fn upsert_student(
        &self,
        tenant: Uuid,
        record: StudentRecord,
        course: Uuid,
        class: Uuid,
    ) -> Result<(Uuid, bool), Problem>;

    async fn get_teacher(&self, tenant: Uuid, id: Uuid) -> Result<Option<Teacher>, Problem>;

    async fn load_mfa(&self, tenant: Uuid, id: Uuid) -> Result<MfaState, Problem>;

    async fn store_mfa(&self, tenant: Uuid, id: Uuid, state: &MfaState) -> Result<(), Problem>;
}

impl IdentityDbExt for Database {
    async fn find_identity(
        &self,
        tenant: Uuid,
        email: impl AsRef<str>,
    ) -> Result<Option<Identity>, Problem> {
        let by_email = filter::by_email_in_tenant(email.as_ref(), tenant);

        if let Some(doc) = self
            .collection::<Document>(TEACHER_COLLECTION_NAME)
            .find_one(by_email.clone(), None)
            .await
            .map_err(Problem::from)?
        {
            let teacher: Teacher = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::Teacher(teacher)));
        }

        if let Some(doc) = self
            .collection::<Document>(USER_COLLECTION_NAME)
            .find_one(by_email.clone(), None)
            .await
            .map_err(Problem::from)?
        {
            let user: User = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::User(user)));
        }

        if let Some(doc) = self
            .collection::<Document>(STUDENT_COLLECTION_NAME)
            .find_one(by_email, None)
            .await
            .map_err(Problem::from)?
        {
            let student: Student = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::Student(student)));
        }

        Ok(None)
    }

    async fn find_identity_by_id(
        &self,
        tenant: Uuid,
        id: Uuid,
    ) -> Result<Option<Identity>, Problem> {
        let by_id = filter::by_id_in_tenant(id, tenant);

        if let Some(doc) = self
            .collection::<Document>(TEACHER_COLLECTION_NAME)
            .find_one(by_id.clone(), None)
            .await
            .map_err(Problem::from)?
        {
            let teacher: Teacher = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::Teacher(teacher)));
        }

        if let Some(doc) = self
            .collection::<Document>(USER_COLLECTION_NAME)
            .find_one(by_id.clone(), None)
            .await
            .map_err(Problem::from)?
        {
            let user: User = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::User(user)));
        }

        if let Some(doc) = self
            .collection::<Document>(STUDENT_COLLECTION_NAME)
            .find_one(by_id, None)
            .await
            .map_err(Problem::from)?
        {
            let student: Student = from_bson(Bson::Document(doc)).map_err(Problem::from)?;
            return Ok(Some(Identity::Student(student)));
        }

        Ok(None)
    }

    async fn login(&self, data: LoginData) -> Result<Identity, Problem> {
        validate_email(&data.email)?;

        let identity = self
            .find_identity(data.tenant, &data.email)
            .await?
            .ok_or_else(problem::bad_login)?;

        if *identity.pw_hash() != PasswordHash::new(&data.password) {
            return Err(problem::bad_login());
        }

        identity
            .mfa()
            .check_login(data.totp.as_deref(), chrono::Utc::now())?;

        Ok(identity)
    }

    async fn create_teacher(&self, tenant: Uuid, data: SignupData) -> Result<Teacher, Problem> {
        data.validate()?;

        if self.find_identity(tenant, &data.email).await?.is_some() {
            return Err(problem::bad_email(
                &data.email,
                "Email already registered.",
            ));
        }

        let teacher = Teacher {
            id: identity_id(tenant, &data.email),
            tenant,
            email: data.email,
            name: data.name,
            pw_hash: PasswordHash::new(&data.password),
            mfa: MfaState::Disabled,
            course_load: 0,
            classes_load: 0,
            students: 0,
        };

        self.collection(TEACHER_COLLECTION_NAME)
            .insert_one(
                bson::to_document(&teacher).expect("Teacher must be serializable to BSON"),
                None,
            )
            .await
            .map_err(Problem::from)?;

        Ok(teacher)
    }

    async fn create_user(
        &self,
        tenant: Uuid,
        data: SignupData,
        admin_emails: impl AsRef<[String]>,
    ) -> Result<User, Problem> {
        data.validate()?;

        if self.find_identity(tenant, &data.email).await?.is_some() {
            return Err(problem::bad_email(
                &data.email,
                "Email already registered.",
            ));
        }

        let role = if admin_emails.as_ref().contains(&data.email) {
            Role::Admin
        } else {
            Role::Teacher
        };

        let user = User {
            id: identity_id(tenant, &data.email),
            tenant,
            email: data.email,
            name: data.name,
            pw_hash: PasswordHash::new(&data.password),
            mfa: MfaState::Disabled,
            role,
        };

        self.collection(USER_COLLECTION_NAME)
            .insert_one(
                bson::to_document(&user).expect("User must be serializable to BSON"),
                None,
            )
            .await
            .map_err(Problem::from)?;

        Ok(user)
    }

    async fn upsert_student(
        &self,
        tenant: Uuid,
        record: StudentRecord,
        course: Uuid,
        class: Uuid,
    ) -> Result<(Uuid, bool), Problem> {
        validate_email(&record.email)?;
        if let Some(password) = &record.password {
            validate_password(password)?;
        }

        let existing = self
            .collection::<Document>(STUDENT_COLLECTION_NAME)
            .find_one(filter::by_email_in_tenant(&record.email, tenant), None)
            .await
            .map_err(Problem::from)?;

        let pw_hash = match &record.password {
            Some(password) => PasswordHash::new(password),
            None => PasswordHash::random(),
        };

        match existing {
            None => {
                let student = Student {
                    id: identity_id(tenant, &record.email),
                    tenant,
                    email: record.email,
                    name: record.name,
                    pw_hash,
                    mfa: MfaState::Disabled,
                    course: Some(course),
                    class: Some(class),
                    xp: 0,
                };

                self.collection(STUDENT_COLLECTION_NAME)
                    .insert_one(
                        bson::to_document(&student)
                            .expect("Student must be serializable to BSON"),
                        None,
                    )
                    .await
                    .map_err(Problem::from)?;

                Ok((student.id, true))
            }
            Some(doc) => {
                let student: Student = from_bson(Bson::Document(doc)).map_err(Problem::from)?;

                // Import overwrites what it provides and reassigns the
                // course/class; credentials only change when the record
                // actually carries a password.
                let mut set = doc! {
                    "name": record.name,
                    "course": course.to_string(),
                    "class": class.to_string(),
                };
                if record.password.is_some() {
                    set.insert("pw_hash", Bson::from(pw_hash));
                }

                self.collection::<Document>(STUDENT_COLLECTION_NAME)
                    .update_one(
                        filter::by_id_in_tenant(student.id, tenant),
                        doc! { "$set": set },
                        None,
                    )
                    .await
                    .map_err(Problem::from)?;

                Ok((student.id, false))
            }
        }
    }

    async fn get_teacher(&self, tenant: Uuid, id: Uuid) -> Result<Option<Teacher>, Problem> {
        let document = self
            .collection::<Document>(TEACHER_COLLECTION_NAME)
            .find_one(filter::by_id_in_tenant(id, tenant), None)
            .await
            .map_err(Problem::from)?;

        match document {
            Some(doc) => Ok(Some(from_bson(Bson::Document(doc)).map_err(Problem::from)?)),
            None => Ok(None),
        }
    }

    async fn load_mfa(&self, tenant: Uuid, id: Uuid) -> Result<MfaState, Problem> {
        let identity = self
            .find_identity_by_id(tenant, id)
            .await?
            .ok_or_else(|| problems::not_found("identity", id))?;

        Ok(identity.mfa().clone())
    }

    async fn store_mfa(&self, tenant: Uuid, id: Uuid, state: &MfaState) -> Result<(), Problem> {
        let identity = self
            .find_identity_by_id(tenant, id)
            .await?
            .ok_or_else(|| problems::not_found("identity", id))?;

        let state = bson::to_bson(state).expect("MfaState must be serializable to BSON");

        let result = self
            .collection::<Document>(identity.collection_name())
            .update_one(
                filter::by_id_in_tenant(id, tenant),
                doc! { "$set": { "mfa": state } },
                None,
            )
            .await
            .map_err(Problem::from)?;

        if result.matched_count == 0 {
            return Err(problems::not_found("identity", id));
        }

        Ok(())
    }
}
