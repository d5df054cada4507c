use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Ordered so privilege checks can use comparison: students can only reach
/// their own views, teachers author courses, admins manage identities.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, ToSchema)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl From<Role> for u8 {
    fn from(value: Role) -> u8 {
        match value {
            Role::Student => 0u8,
            Role::Teacher => 1u8,
            Role::Admin => 2u8,
        }
    }
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        vec![Role::Student, Role::Teacher, Role::Admin][value as usize]
    }
}

impl Role {
    /// Indicates whether an identity with this role can author courses.
    pub fn can_author(self) -> bool {
        self >= Role::Teacher
    }
}

impl std::default::Default for Role {
    fn default() -> Self {
        Role::Student
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Student => write!(f, "student"),
            Role::Teacher => write!(f, "teacher"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl From<Role> for String {
    fn from(value: Role) -> String {
        value.to_string()
    }
}
