// Google Drive v3 client: folder lookup, folder creation and multipart upload.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::service_account::{expect_success, ServiceAccountAuth};
use crate::core::requests::request_models::FileBlob;
use crate::core::requests::request_ports::{CollaboratorError, FileStore};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

pub struct GoogleDriveClient {
    client: Client,
    auth: Arc<ServiceAccountAuth>,
}

impl GoogleDriveClient {
    pub fn new(auth: Arc<ServiceAccountAuth>) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }

    async fn file_id(response: reqwest::Response) -> Result<String, CollaboratorError> {
        let response = expect_success(response, "Drive API error")
            .await
            .map_err(CollaboratorError::Files)?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Files(e.to_string()))?;
        Ok(file.id)
    }
}

/// Drive query matching live folders with exactly this name.
pub fn folder_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        escaped, FOLDER_MIME
    )
}

/// `multipart/related` upload body: JSON metadata part, then the file bytes.
pub fn multipart_related(boundary: &str, metadata: &serde_json::Value, file: &FileBlob) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: {mime}\r\n\r\n",
            b = boundary,
            meta = metadata,
            mime = file.mime_type,
        )
        .as_bytes(),
    );
    body.extend_from_slice(&file.data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[async_trait]
impl FileStore for GoogleDriveClient {
    async fn find_folders(&self, name: &str) -> Result<Vec<String>, CollaboratorError> {
        let token = self.auth.access_token().await?;
        let query = folder_query(name);

        let response = self
            .client
            .get(DRIVE_API)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id)"),
                ("spaces", "drive"),
                ("orderBy", "createdTime"),
            ])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CollaboratorError::Files(e.to_string()))?;
        let response = expect_success(response, "Drive folder lookup failed")
            .await
            .map_err(CollaboratorError::Files)?;

        let list: FileList = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Files(e.to_string()))?;
        Ok(list.files.into_iter().map(|f| f.id).collect())
    }

    async fn create_folder(&self, name: &str) -> Result<String, CollaboratorError> {
        let token = self.auth.access_token().await?;

        let response = self
            .client
            .post(DRIVE_API)
            .query(&[("fields", "id")])
            .bearer_auth(token)
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME }))
            .send()
            .await
            .map_err(|e| CollaboratorError::Files(e.to_string()))?;

        let id = Self::file_id(response).await?;
        tracing::info!(folder_id = %id, "Created Drive folder '{}'", name);
        Ok(id)
    }

    async fn create_file(
        &self,
        folder_id: &str,
        file: &FileBlob,
    ) -> Result<String, CollaboratorError> {
        let token = self.auth.access_token().await?;
        let boundary = format!("request-pdf-{:016x}", rand::random::<u64>());
        let metadata = json!({
            "name": file.name,
            "mimeType": file.mime_type,
            "parents": [folder_id],
        });

        let response = self
            .client
            .post(DRIVE_UPLOAD)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(multipart_related(&boundary, &metadata, file))
            .send()
            .await
            .map_err(|e| CollaboratorError::Files(e.to_string()))?;

        Self::file_id(response).await
    }
}
