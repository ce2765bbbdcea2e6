//! S3 "object created" notification bodies as they arrive on the upload queue
//!
//! A queue message body is either an S3 event document (`{"Records": [...]}`)
//! or an SNS envelope whose `Message` field holds that document as a string.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum NotificationParseError {
    #[error("Notification body is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("Nested SNS message is not JSON: {0}")]
    NestedNotJson(#[source] serde_json::Error),
}

/// One created object referenced by a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreatedRecord {
    pub bucket: Option<String>,
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
struct EventDocument {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: Option<S3Bucket>,
    object: Option<S3Object>,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: Option<String>,
}

/// Extract the created objects from a queue message body
///
/// Records without an object key are skipped. Keys are URL-decoded the way
/// S3 encodes them in notifications (`+` for spaces, percent escapes).
pub fn parse_object_created(body: &str) -> Result<Vec<ObjectCreatedRecord>, NotificationParseError> {
    let document: EventDocument =
        serde_json::from_str(body).map_err(NotificationParseError::NotJson)?;

    let records = if document.records.is_empty() {
        match document.message {
            Some(nested) => {
                serde_json::from_str::<EventDocument>(&nested)
                    .map_err(NotificationParseError::NestedNotJson)?
                    .records
            }
            None => Vec::new(),
        }
    } else {
        document.records
    };

    Ok(records
        .into_iter()
        .filter_map(|record| {
            let s3 = record.s3?;
            let key = s3.object.and_then(|o| o.key).filter(|k| !k.is_empty())?;
            Some(ObjectCreatedRecord {
                bucket: s3.bucket.and_then(|b| b.name),
                key: decode_key(&key),
            })
        })
        .collect())
}

fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}
