/// Processed-object listing, the pollable record of finished work
use crate::error::Result;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const URL_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedObject {
    pub key: String,
    pub processed_key: String,
    /// Presigned GET URL, valid for an hour
    pub url: String,
}

pub async fn list_processed(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse> {
    let bucket = &state.config.storage.output_bucket;
    let prefix = query.prefix.as_deref().filter(|p| !p.is_empty());

    let keys = state.store.list(bucket, prefix).await?;
    let mut objects = Vec::with_capacity(keys.len());
    for key in keys {
        let url = state.store.presigned_get_url(bucket, &key, URL_EXPIRY).await?;
        objects.push(ProcessedObject {
            processed_key: format!("{bucket}/{key}"),
            url: state.config.public_url(url),
            key,
        });
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "bucket": bucket,
        "count": objects.len(),
        "objects": objects,
    })))
}
