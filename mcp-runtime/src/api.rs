//! Remote API client.
//!
//! `TaskApi` is the seam between tool dispatch and the wire: tools only see
//! the trait, `PyrusClient` carries the reqwest plumbing. A client is bound
//! to one authenticated account; construction performs the credential
//! exchange and fails when no usable access token comes back.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::accounts::Account;
use crate::error::ToolError;
use crate::model::{
    AnnouncementResponse, AuthResponse, CalendarRequest, CalendarResponse, ContactsResponse,
    CreateTaskRequest, DownloadResponse, Form, FormRegisterRequest, FormsResponse, InboxResponse,
    ListsResponse, MembersResponse, ProfileResponse, RegistryResponse, RolesResponse,
    TaskCommentRequest, TaskListResponse, TaskResponse, UploadResponse,
};

pub const DEFAULT_API_URL: &str = "https://api.pyrus.com/v4";

#[async_trait]
pub trait TaskApi: Send + Sync + std::fmt::Debug {
    async fn get_profile(&self) -> Result<ProfileResponse, ToolError>;
    async fn get_inbox(&self, item_count: u32) -> Result<InboxResponse, ToolError>;
    async fn get_task(&self, task_id: u64) -> Result<TaskResponse, ToolError>;
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskResponse, ToolError>;
    async fn comment_task(
        &self,
        task_id: u64,
        request: &TaskCommentRequest,
    ) -> Result<TaskResponse, ToolError>;
    async fn get_forms(&self) -> Result<FormsResponse, ToolError>;
    async fn get_form(&self, form_id: u64) -> Result<Form, ToolError>;
    async fn get_registry(
        &self,
        form_id: u64,
        request: &FormRegisterRequest,
    ) -> Result<RegistryResponse, ToolError>;
    async fn get_contacts(&self, include_inactive: bool) -> Result<ContactsResponse, ToolError>;
    async fn get_members(&self) -> Result<MembersResponse, ToolError>;
    async fn get_roles(&self) -> Result<RolesResponse, ToolError>;
    /// Raw server payload; the normalized wire shape is unreliable for
    /// announcements, so the caller walks this directly.
    async fn get_announcements_raw(&self, item_count: u32) -> Result<Value, ToolError>;
    async fn create_announcement(&self, text: &str) -> Result<AnnouncementResponse, ToolError>;
    async fn get_calendar_tasks(
        &self,
        request: &CalendarRequest,
    ) -> Result<CalendarResponse, ToolError>;
    async fn get_lists(&self) -> Result<ListsResponse, ToolError>;
    async fn get_task_list(
        &self,
        list_id: u64,
        item_count: u32,
    ) -> Result<TaskListResponse, ToolError>;
    async fn get_catalog(&self, catalog_id: u64) -> Result<crate::model::CatalogResponse, ToolError>;
    async fn download_file(&self, file_id: u64) -> Result<DownloadResponse, ToolError>;
    async fn upload_file(&self, path: &Path) -> Result<UploadResponse, ToolError>;
}

/// Builds and authenticates a client for one account. Injected into the
/// client cache so tests can count authentication round-trips.
#[async_trait]
pub trait ApiFactory: Send + Sync {
    async fn connect(&self, key: &str, account: &Account) -> Result<Arc<dyn TaskApi>, ToolError>;
}

pub struct PyrusFactory {
    http: reqwest::Client,
    base_url: String,
}

impl PyrusFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ApiFactory for PyrusFactory {
    async fn connect(&self, key: &str, account: &Account) -> Result<Arc<dyn TaskApi>, ToolError> {
        let client = PyrusClient::connect(
            self.http.clone(),
            &self.base_url,
            &account.login,
            &account.security_key,
        )
        .await
        .map_err(|err| ToolError {
            message: format!("Authentication failed for account '{key}': {}", err.message),
            ..err
        })?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug)]
pub struct PyrusClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl PyrusClient {
    pub async fn connect(
        http: reqwest::Client,
        base_url: &str,
        login: &str,
        security_key: &str,
    ) -> Result<Self, ToolError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let response = http
            .post(format!("{base_url}/auth"))
            .json(&json!({ "login": login, "security_key": security_key }))
            .send()
            .await
            .map_err(|err| connection_error(&base_url, err))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| response_error("/auth", err))?;
        let auth: AuthResponse = serde_json::from_slice(&bytes)
            .map_err(|err| response_error("/auth", err))?;

        match auth.access_token.filter(|token| !token.is_empty()) {
            Some(access_token) => Ok(Self {
                http,
                base_url,
                access_token,
            }),
            None => {
                let code = auth
                    .error_code
                    .unwrap_or_else(|| "unknown error".to_string());
                Err(ToolError::new(
                    "auth_failed",
                    format!("credential exchange returned no access token ({code})"),
                )
                .with_details(json!({ "error_code": code })))
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Vec<u8>, ToolError> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| connection_error(&self.base_url, err))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| response_error(path, err))?;
        Ok(bytes.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ToolError> {
        let bytes = self.send(Method::GET, path, query, None).await?;
        parse_json(path, &bytes)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ToolError> {
        let body = serde_json::to_value(body)
            .map_err(|err| ToolError::new("internal_error", format!("Failed to encode request body: {err}")))?;
        let bytes = self.send(Method::POST, path, &[], Some(&body)).await?;
        parse_json(path, &bytes)
    }
}

fn connection_error(base_url: &str, err: reqwest::Error) -> ToolError {
    ToolError::new(
        "connection_error",
        format!("Failed to reach Pyrus API at {base_url}: {err}"),
    )
    .with_docs_hint("Check network access and the configured API base URL.")
}

fn response_error(path: &str, err: impl std::fmt::Display) -> ToolError {
    ToolError::new(
        "response_error",
        format!("Failed to read API response from {path}: {err}"),
    )
}

fn parse_json<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T, ToolError> {
    serde_json::from_slice(bytes).map_err(|err| response_error(path, err))
}

fn filename_from_content_disposition(header: &str) -> Option<String> {
    // RFC 5987 `filename*=` wins over the plain parameter when both appear.
    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            let rest = rest
                .trim_start_matches("UTF-8''")
                .trim_start_matches("utf-8''");
            return Some(rest.trim_matches('"').to_string());
        }
    }
    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

#[async_trait]
impl TaskApi for PyrusClient {
    async fn get_profile(&self) -> Result<ProfileResponse, ToolError> {
        self.get_json("/profile", &[]).await
    }

    async fn get_inbox(&self, item_count: u32) -> Result<InboxResponse, ToolError> {
        self.get_json("/inbox", &[("item_count", item_count.to_string())])
            .await
    }

    async fn get_task(&self, task_id: u64) -> Result<TaskResponse, ToolError> {
        self.get_json(&format!("/tasks/{task_id}"), &[]).await
    }

    async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskResponse, ToolError> {
        self.post_json("/tasks", request).await
    }

    async fn comment_task(
        &self,
        task_id: u64,
        request: &TaskCommentRequest,
    ) -> Result<TaskResponse, ToolError> {
        self.post_json(&format!("/tasks/{task_id}/comments"), request)
            .await
    }

    async fn get_forms(&self) -> Result<FormsResponse, ToolError> {
        self.get_json("/forms", &[]).await
    }

    async fn get_form(&self, form_id: u64) -> Result<Form, ToolError> {
        self.get_json(&format!("/forms/{form_id}"), &[]).await
    }

    async fn get_registry(
        &self,
        form_id: u64,
        request: &FormRegisterRequest,
    ) -> Result<RegistryResponse, ToolError> {
        self.post_json(&format!("/forms/{form_id}/register"), request)
            .await
    }

    async fn get_contacts(&self, include_inactive: bool) -> Result<ContactsResponse, ToolError> {
        self.get_json(
            "/contacts",
            &[("include_inactive", include_inactive.to_string())],
        )
        .await
    }

    async fn get_members(&self) -> Result<MembersResponse, ToolError> {
        self.get_json("/members", &[]).await
    }

    async fn get_roles(&self) -> Result<RolesResponse, ToolError> {
        self.get_json("/roles", &[]).await
    }

    async fn get_announcements_raw(&self, item_count: u32) -> Result<Value, ToolError> {
        self.get_json("/announcements", &[("item_count", item_count.to_string())])
            .await
    }

    async fn create_announcement(&self, text: &str) -> Result<AnnouncementResponse, ToolError> {
        self.post_json("/announcements", &json!({ "text": text }))
            .await
    }

    async fn get_calendar_tasks(
        &self,
        request: &CalendarRequest,
    ) -> Result<CalendarResponse, ToolError> {
        self.get_json(
            "/calendar",
            &[
                ("start_date_utc", request.start_date_utc.to_string()),
                ("end_date_utc", request.end_date_utc.to_string()),
                ("include_meetings", request.include_meetings.to_string()),
            ],
        )
        .await
    }

    async fn get_lists(&self) -> Result<ListsResponse, ToolError> {
        self.get_json("/lists", &[]).await
    }

    async fn get_task_list(
        &self,
        list_id: u64,
        item_count: u32,
    ) -> Result<TaskListResponse, ToolError> {
        self.get_json(
            &format!("/lists/{list_id}/tasks"),
            &[("item_count", item_count.to_string())],
        )
        .await
    }

    async fn get_catalog(&self, catalog_id: u64) -> Result<crate::model::CatalogResponse, ToolError> {
        self.get_json(&format!("/catalogs/{catalog_id}"), &[]).await
    }

    async fn download_file(&self, file_id: u64) -> Result<DownloadResponse, ToolError> {
        let path = format!("/files/download/{file_id}");
        let response = self
            .http
            .get(self.url(&path))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| connection_error(&self.base_url, err))?;

        let disposition = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("json"));
        let bytes = response
            .bytes()
            .await
            .map_err(|err| response_error(&path, err))?;

        // An error report comes back as a JSON body instead of file bytes.
        if is_json {
            let body: Value = parse_json(&path, &bytes)?;
            let error_code = body
                .get("error_code")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(DownloadResponse {
                filename: None,
                raw_file: None,
                error_code,
            });
        }

        Ok(DownloadResponse {
            filename: disposition
                .as_deref()
                .and_then(filename_from_content_disposition),
            raw_file: Some(bytes.to_vec()),
            error_code: None,
        })
    }

    async fn upload_file(&self, path: &Path) -> Result<UploadResponse, ToolError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            ToolError::new(
                "io_error",
                format!("Failed to read '{}': {err}", path.display()),
            )
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(self.url("/files/upload"))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| connection_error(&self.base_url, err))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| response_error("/files/upload", err))?;

        serde_json::from_slice(&bytes).map_err(|err| {
            ToolError::new(
                "upload_failed",
                format!(
                    "Upload returned an unparseable response; this may indicate a server-side issue: {err}"
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_prefers_extended_filename() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="plan.pdf""#).as_deref(),
            Some("plan.pdf")
        );
        assert_eq!(
            filename_from_content_disposition(
                r#"attachment; filename="fallback.pdf"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"#
            )
            .as_deref(),
            Some("r%C3%A9sum%C3%A9.pdf")
        );
        assert_eq!(filename_from_content_disposition("attachment"), None);
    }

    #[tokio::test]
    async fn connect_surfaces_connection_errors() {
        let err = PyrusClient::connect(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "bot@example.com",
            "secret",
        )
        .await
        .expect_err("nothing listens on the discard port");
        assert_eq!(err.code, "connection_error");
    }
}
