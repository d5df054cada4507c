use bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};

pub mod course;
pub mod identity;
pub mod payment;
pub mod stats;

/// Mongo duplicate-key write failure (code 11000) on a unique index. The
/// repositories race their pre-checks against concurrent writers; the index
/// has the final say and this classifies the loser's error.
pub fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == 11000,
        _ => false,
    }
}

fn unique_index(keys: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

/// Creates the unique indexes the repositories rely on: tenant-scoped course
/// codes and identity emails, and the payment idempotency key. Safe to call
/// on every startup.
pub async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    db.collection::<bson::Document>(course::COURSE_COLLECTION_NAME)
        .create_index(unique_index(doc! { "tenant": 1, "course_code": 1 }), None)
        .await?;

    for collection in [
        identity::TEACHER_COLLECTION_NAME,
        identity::STUDENT_COLLECTION_NAME,
        identity::USER_COLLECTION_NAME,
    ] {
        db.collection::<bson::Document>(collection)
            .create_index(unique_index(doc! { "tenant": 1, "email": 1 }), None)
            .await?;
    }

    db.collection::<bson::Document>(payment::PAYMENT_COLLECTION_NAME)
        .create_index(unique_index(doc! { "session_id": 1 }), None)
        .await?;

    Ok(())
}

/// Tenant-qualified BSON filters. Every repository read/write goes through
/// these, so a valid but foreign id can never cross a tenant boundary.
pub mod filter {
    use bson::spec::BinarySubtype;
    use bson::{doc, Bson, Document};
    use uuid::Uuid;

    pub fn uuid_bin(id: Uuid) -> Bson {
        Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Uuid,
            bytes: id.as_bytes().to_vec(),
        })
    }

    pub fn by_tenant(tenant: Uuid) -> Document {
        doc! { "tenant": uuid_bin(tenant) }
    }

    pub fn by_id_in_tenant(id: Uuid, tenant: Uuid) -> Document {
        doc! { "_id": uuid_bin(id), "tenant": uuid_bin(tenant) }
    }

    pub fn by_email_in_tenant(email: impl ToString, tenant: Uuid) -> Document {
        doc! { "email": email.to_string(), "tenant": uuid_bin(tenant) }
    }

    pub fn by_course_code(code: impl ToString, tenant: Uuid) -> Document {
        doc! { "course_code": code.to_string(), "tenant": uuid_bin(tenant) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_write_failures_are_not_duplicate_keys() {
        // Connection loss mid-insert must keep surfacing as an internal
        // error, not get swallowed as a conflict or a webhook replay.
        let error = mongodb::error::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));

        assert!(!is_duplicate_key(&error));
    }
}
