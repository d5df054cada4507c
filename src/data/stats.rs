//! Teacher load projector.
//!
//! `course_load`/`classes_load`/`students` on a Teacher document are cached
//! derivations of the course aggregate, overwritten in full on every
//! recompute. Repository mutations that change teacher assignment call
//! [`StatsDbExt::recompute_teacher_loads`] with the union of teachers
//! referenced before and after the write; the projection itself is a pure
//! fold, so redundant runs cannot drift.

use std::collections::{HashMap, HashSet};

use bson::doc;
use mongodb::Database;
use uuid::Uuid;

use crate::data::course::db::CourseDbExt;
use crate::data::course::Course;
use crate::data::filter;
use crate::data::identity::TEACHER_COLLECTION_NAME;
use crate::resp::problem::Problem;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TeacherLoad {
    /// Distinct courses with at least one class taught by the teacher.
    pub course_load: u32,
    /// Distinct class names taught.
    pub classes_load: u32,
    /// Total students across the taught classes.
    pub students: u32,
}

/// Derives per-teacher loads from a tenant's courses.
///
/// With `only = Some(set)`, the result contains exactly the teachers in the
/// set, zeroed when they have no remaining assignment; passing the
/// before/after union of a mutation therefore also resets teachers that just
/// lost their last class. With `only = None` the result covers every teacher
/// with at least one assignment.
pub fn project_loads(
    courses: &[Course],
    only: Option<&HashSet<Uuid>>,
) -> HashMap<Uuid, TeacherLoad> {
    let mut courses_taught: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    let mut classes_taught: HashMap<Uuid, HashSet<&str>> = HashMap::new();
    let mut loads: HashMap<Uuid, TeacherLoad> = match only {
        Some(ids) => ids.iter().map(|id| (*id, TeacherLoad::default())).collect(),
        None => HashMap::new(),
    };

    for course in courses {
        for class in &course.classes {
            if let Some(ids) = only {
                if !ids.contains(&class.teacher) {
                    continue;
                }
            }

            let load = loads.entry(class.teacher).or_default();
            load.students += class.students.len() as u32;

            if courses_taught
                .entry(class.teacher)
                .or_default()
                .insert(course.id)
            {
                load.course_load += 1;
            }
            if classes_taught
                .entry(class.teacher)
                .or_default()
                .insert(class.name.as_str())
            {
                load.classes_load += 1;
            }
        }
    }

    loads
}

pub trait StatsDbExt {
    /// Rescans the tenant's courses and overwrites the cached load fields of
    /// the given teachers (or of every assigned teacher when `only` is None).
    async fn recompute_teacher_loads(
        &self,
        tenant: Uuid,
        only: Option<&HashSet<Uuid>>,
    ) -> Result<(), Problem>;
}

impl StatsDbExt for Database {
    async fn recompute_teacher_loads(
        &self,
        tenant: Uuid,
        only: Option<&HashSet<Uuid>>,
    ) -> Result<(), Problem> {
        let courses = self.list_courses(tenant).await?;
        let loads = project_loads(&courses, only);

        for (teacher, load) in loads {
            tracing::debug!(
                "recomputed load for teacher {}: {:?} (tenant {})",
                teacher,
                load,
                tenant
            );

            self.collection::<bson::Document>(TEACHER_COLLECTION_NAME)
                .update_one(
                    filter::by_id_in_tenant(teacher, tenant),
                    doc! { "$set": {
                        "course_load": load.course_load as i64,
                        "classes_load": load.classes_load as i64,
                        "students": load.students as i64,
                    }},
                    None,
                )
                .await
                .map_err(Problem::from)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::course::{Class, Course};
    use chrono::Utc;

    fn class(name: &str, teacher: Uuid, students: usize) -> Class {
        Class {
            id: Uuid::new_v4(),
            name: name.to_string(),
            teacher,
            students: (0..students).map(|_| Uuid::new_v4()).collect(),
            labs: vec![],
        }
    }

    fn course(tenant: Uuid, code: &str, classes: Vec<Class>) -> Course {
        Course {
            id: Uuid::new_v4(),
            tenant,
            title: code.to_string(),
            course_code: code.to_string(),
            created: Utc::now(),
            classes,
            version: 0,
        }
    }

    #[test]
    fn single_class_two_students() {
        let tenant = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let courses = vec![course(tenant, "CS101", vec![class("A", teacher, 2)])];

        let loads = project_loads(&courses, None);
        let load = loads[&teacher];

        assert_eq!(load.course_load, 1);
        assert_eq!(load.classes_load, 1);
        assert_eq!(load.students, 2);
    }

    #[test]
    fn student_removal_reflects_on_recompute() {
        let tenant = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let mut courses = vec![course(tenant, "CS101", vec![class("A", teacher, 2)])];

        courses[0].classes[0].students.pop();

        let loads = project_loads(&courses, None);
        assert_eq!(loads[&teacher].students, 1);
    }

    #[test]
    fn distinct_counting_across_courses() {
        let tenant = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        // Same class name in two courses: two courses, one distinct name.
        let courses = vec![
            course(tenant, "CS101", vec![class("A", teacher, 3)]),
            course(tenant, "CS102", vec![class("A", teacher, 2)]),
        ];

        let load = project_loads(&courses, None)[&teacher];
        assert_eq!(load.course_load, 2);
        assert_eq!(load.classes_load, 1);
        assert_eq!(load.students, 5);
    }

    #[test]
    fn filtered_teacher_without_assignment_is_zeroed() {
        // The delete-course path: project with the pre-delete teacher set
        // against the post-delete (empty) course list.
        let teacher = Uuid::new_v4();
        let only: HashSet<Uuid> = [teacher].into_iter().collect();

        let loads = project_loads(&[], Some(&only));
        assert_eq!(loads[&teacher], TeacherLoad::default());
    }

    #[test]
    fn filter_excludes_unrelated_teachers() {
        let tenant = Uuid::new_v4();
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();
        let courses = vec![course(
            tenant,
            "CS101",
            vec![class("A", wanted, 1), class("B", other, 4)],
        )];

        let only: HashSet<Uuid> = [wanted].into_iter().collect();
        let loads = project_loads(&courses, Some(&only));

        assert!(loads.contains_key(&wanted));
        assert!(!loads.contains_key(&other));
    }

    #[test]
    fn projection_is_idempotent() {
        let tenant = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let courses = vec![course(tenant, "CS101", vec![class("A", teacher, 2)])];

        let first = project_loads(&courses, None);
        let second = project_loads(&courses, None);
        assert_eq!(first, second, "recompute drifted across runs");
    }
}
