//! Typed views of the remote API surface.
//!
//! Response shapes are deliberately forgiving: every field the server may
//! omit is an `Option`, and whole structs are `#[serde(default)]` so an
//! error-only body (`{"error_code": "..."}`) still deserializes into the
//! typed response with `error_code` populated.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Person {
    pub id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct File {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub url: Option<String>,
    pub version: Option<i64>,
    pub root_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormField {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
    pub value: Option<Value>,
    pub info: Option<FormFieldInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormFieldInfo {
    pub required_step: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub id: Option<i64>,
    pub text: Option<String>,
    pub author: Option<Person>,
    pub create_date: Option<DateTime<Utc>>,
    pub action: Option<String>,
    pub attachments: Option<Vec<File>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: Option<i64>,
    pub text: Option<String>,
    pub subject: Option<String>,
    pub author: Option<Person>,
    pub responsible: Option<Person>,
    pub create_date: Option<DateTime<Utc>>,
    pub due_date: Option<NaiveDate>,
    pub close_date: Option<DateTime<Utc>>,
    pub scheduled_date: Option<NaiveDate>,
    pub form_id: Option<i64>,
    pub fields: Option<Vec<FormField>>,
    pub attachments: Option<Vec<File>>,
    pub comments: Option<Vec<Comment>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskGroup {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub tasks: Option<Vec<Task>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Form {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub steps: Option<Value>,
    pub fields: Option<Vec<FormField>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Organization {
    pub organization_id: Option<i64>,
    pub name: Option<String>,
    pub persons: Option<Vec<Person>>,
    pub roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub member_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Announcement {
    pub id: Option<i64>,
    pub text: Option<String>,
    pub author: Option<Person>,
    pub create_date: Option<DateTime<Utc>>,
    pub comments: Option<Vec<AnnouncementComment>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnnouncementComment {
    pub id: Option<i64>,
    pub text: Option<String>,
    pub author: Option<Person>,
    pub create_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskList {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub children: Option<Vec<TaskList>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogItem {
    pub item_id: Option<i64>,
    pub values: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub access_token: Option<String>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileResponse {
    pub person_id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub organization_id: Option<i64>,
    pub organization: Option<Organization>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InboxResponse {
    pub tasks: Option<Vec<Task>>,
    pub task_groups: Option<Vec<TaskGroup>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskResponse {
    pub task: Option<Task>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormsResponse {
    pub forms: Option<Vec<Form>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryResponse {
    pub tasks: Option<Vec<Task>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContactsResponse {
    pub organizations: Option<Vec<Organization>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MembersResponse {
    pub members: Option<Vec<Person>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RolesResponse {
    pub roles: Option<Vec<Role>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnnouncementResponse {
    pub announcement: Option<Announcement>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalendarResponse {
    pub tasks: Option<Vec<Task>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListsResponse {
    pub lists: Option<Vec<TaskList>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskListResponse {
    pub tasks: Option<Vec<Task>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogResponse {
    pub catalog_id: Option<i64>,
    pub name: Option<String>,
    pub catalog_headers: Option<Value>,
    pub items: Option<Vec<CatalogItem>>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadResponse {
    pub guid: Option<String>,
    pub md5_hash: Option<String>,
    pub error_code: Option<String>,
}

/// Assembled by the client from a binary download response; not a wire shape.
#[derive(Debug, Clone, Default)]
pub struct DownloadResponse {
    pub filename: Option<String>,
    pub raw_file: Option<Vec<u8>>,
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Attachment descriptor for create/comment requests. Any subset of the
/// fields may be present: a fresh upload guid, a version root, an existing
/// attachment id, an external URL, or a display name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<NewFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_defaults: Option<bool>,
}

/// One comment event carrying any subset of task mutations; the remote side
/// applies the whole request atomically.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCommentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reassign_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_list_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_list_ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_schedule: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_due: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers_added: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers_removed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants_added: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants_removed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_updates: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<NewFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_notification: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FormRegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_archived: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarRequest {
    pub start_date_utc: NaiveDate,
    pub end_date_utc: NaiveDate,
    pub include_meetings: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_only_body_deserializes_into_typed_response() {
        let resp: TaskResponse = serde_json::from_str(r#"{"error_code": "access_denied"}"#).unwrap();
        assert_eq!(resp.error_code.as_deref(), Some("access_denied"));
        assert!(resp.task.is_none());
    }

    #[test]
    fn task_dates_parse_from_wire_shapes() {
        let task: Task = serde_json::from_str(
            r#"{
                "id": 10,
                "text": "Review contract",
                "create_date": "2024-01-10T08:30:00Z",
                "due_date": "2024-01-15"
            }"#,
        )
        .unwrap();
        assert_eq!(task.due_date.unwrap().to_string(), "2024-01-15");
        assert!(task.close_date.is_none());
    }

    #[test]
    fn comment_request_serializes_only_populated_fields() {
        let request = TaskCommentRequest {
            text: Some("done".to_string()),
            action: Some("finished".to_string()),
            ..Default::default()
        };
        let body = serde_json::to_value(&request).unwrap();
        let obj = body.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(body["action"], "finished");
    }
}
