use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

pub mod accounts;
pub mod api;
pub mod error;
pub mod model;
pub mod normalize;
mod util;

use accounts::{AccountRegistry, ClientCache};
use api::{ApiFactory, PyrusFactory, TaskApi};
use error::ToolError;
use model::{CalendarRequest, CreateTaskRequest, FormRegisterRequest, NewFile, TaskCommentRequest};

pub use api::DEFAULT_API_URL;
pub use error::ConfigError;
pub use util::{default_accounts_path, default_log_path};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "pyrus-mcp";

const DEFAULT_INBOX_LIMIT: u64 = 50;
const DEFAULT_REGISTRY_LIMIT: u64 = 100;
const DEFAULT_ANNOUNCEMENTS_LIMIT: u64 = 100;
const DEFAULT_LIST_TASKS_LIMIT: u64 = 200;

const TASK_ACTIONS: [&str; 2] = ["finished", "reopened"];
const APPROVAL_CHOICES: [&str; 3] = ["approved", "rejected", "acknowledged"];

/// Settings the binary resolves from flags/env before handing control over.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub accounts_path: PathBuf,
    pub api_url: String,
}

/// Entry point for the server binary. Loads accounts (fatal on failure) and
/// serves MCP over stdio until EOF. Returns the process exit code.
pub async fn run(config: RuntimeConfig) -> i32 {
    let registry = match AccountRegistry::load(&config.accounts_path) {
        Ok(registry) => registry,
        Err(err) => {
            tracing::error!("failed to load accounts: {err}");
            let payload = json!({
                "error": "config_error",
                "message": err.to_string(),
            });
            eprintln!("{}", to_pretty_json(&payload));
            return 1;
        }
    };

    let server = McpServer::new(registry, &config.api_url);
    tracing::info!(session = %server.session_id, "starting Pyrus MCP server");
    match server.serve_stdio().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("server error: {err}");
            let payload = json!({
                "error": "mcp_server_error",
                "message": err,
            });
            eprintln!("{}", to_pretty_json(&payload));
            1
        }
    }
}

struct McpServer {
    session_id: String,
    registry: Arc<AccountRegistry>,
    cache: ClientCache,
}

impl McpServer {
    fn new(registry: AccountRegistry, api_url: &str) -> Self {
        Self::with_factory(Arc::new(registry), Arc::new(PyrusFactory::new(api_url)))
    }

    fn with_factory(registry: Arc<AccountRegistry>, factory: Arc<dyn ApiFactory>) -> Self {
        Self {
            session_id: format!("stdio-{}", Uuid::now_v7()),
            registry: registry.clone(),
            cache: ClientCache::new(registry, factory),
        }
    }

    async fn serve_stdio(&self) -> Result<(), String> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; this server issues no outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Tools for the Pyrus task-management API with multi-account support. \
                Every tool accepts an optional 'account' key (see list_accounts); omitting it uses \
                the configured default account. comment_task is the main mutation tool: text, \
                lifecycle actions, reassignment, scheduling, due dates, approvals and attachments \
                all ride in one comment. To attach files, call upload_file or upload_file_content \
                first and pass the returned guid, or use attach_file_to_task to do both steps."
        })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        tracing::debug!(tool = name, "dispatching tool call");
        Ok(match self.execute_tool(name, &args).await {
            Ok(payload) => build_tool_call_response(
                json!({
                    "status": "ok",
                    "tool": name,
                    "data": payload
                }),
                false,
            ),
            Err(err) => {
                tracing::warn!(tool = name, code = %err.code, "tool failed: {}", err.message);
                build_tool_call_response(
                    json!({
                        "status": "error",
                        "tool": name,
                        "error": err.to_value()
                    }),
                    true,
                )
            }
        })
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "list_accounts" => self.tool_list_accounts(args).await,
            "get_profile" => self.tool_get_profile(args).await,
            "get_inbox" => self.tool_get_inbox(args).await,
            "get_task" => self.tool_get_task(args).await,
            "create_task" => self.tool_create_task(args).await,
            "comment_task" => self.tool_comment_task(args).await,
            "complete_task" => self.tool_complete_task(args).await,
            "reopen_task" => self.tool_reopen_task(args).await,
            "get_forms" => self.tool_get_forms(args).await,
            "get_form" => self.tool_get_form(args).await,
            "get_registry" => self.tool_get_registry(args).await,
            "create_form_task" => self.tool_create_form_task(args).await,
            "get_contacts" => self.tool_get_contacts(args).await,
            "get_members" => self.tool_get_members(args).await,
            "get_roles" => self.tool_get_roles(args).await,
            "get_announcements" => self.tool_get_announcements(args).await,
            "create_announcement" => self.tool_create_announcement(args).await,
            "get_calendar" => self.tool_get_calendar(args).await,
            "get_lists" => self.tool_get_lists(args).await,
            "get_list_tasks" => self.tool_get_list_tasks(args).await,
            "get_catalog" => self.tool_get_catalog(args).await,
            "download_file" => self.tool_download_file(args).await,
            "upload_file" => self.tool_upload_file(args).await,
            "upload_file_content" => self.tool_upload_file_content(args).await,
            "attach_file_to_task" => self.tool_attach_file_to_task(args).await,
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{tool_name}'"),
            )),
        }
    }

    async fn client(&self, args: &Map<String, Value>) -> Result<Arc<dyn TaskApi>, ToolError> {
        let account = arg_optional_string(args, "account")?;
        self.cache.get(account.as_deref()).await
    }

    // -- Accounts ----------------------------------------------------------

    async fn tool_list_accounts(&self, _args: &Map<String, Value>) -> Result<Value, ToolError> {
        Ok(self.registry.list())
    }

    async fn tool_get_profile(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.get_profile().await?;
        ensure_api_ok(&response.error_code)?;

        let organization = response
            .organization
            .as_ref()
            .map(|org| {
                json!({
                    "id": org.organization_id,
                    "name": org.name,
                })
            })
            .unwrap_or(Value::Null);

        Ok(json!({
            "person_id": response.person_id,
            "first_name": response.first_name,
            "last_name": response.last_name,
            "email": response.email,
            "organization_id": response.organization_id,
            "organization": organization,
        }))
    }

    // -- Inbox & tasks -----------------------------------------------------

    async fn tool_get_inbox(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limit = arg_u64_or(args, "limit", DEFAULT_INBOX_LIMIT)? as u32;
        let client = self.client(args).await?;
        let response = client.get_inbox(limit).await?;
        ensure_api_ok(&response.error_code)?;

        let tasks: Vec<Value> = response
            .tasks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::task_header)
            .collect();
        let groups: Vec<Value> = response
            .task_groups
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|group| {
                json!({
                    "id": group.id,
                    "name": group.name,
                    "tasks": group
                        .tasks
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(normalize::task_header)
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        Ok(json!({ "tasks": tasks, "groups": groups }))
    }

    async fn tool_get_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task_id = required_u64(args, "task_id")?;
        let client = self.client(args).await?;
        let response = client.get_task(task_id).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(response
            .task
            .as_ref()
            .map(normalize::task)
            .unwrap_or(Value::Null))
    }

    async fn tool_create_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let text = required_string(args, "text")?;
        let request = CreateTaskRequest {
            text: Some(text),
            subject: arg_optional_string(args, "subject")?,
            responsible: arg_optional_string(args, "responsible")?,
            due_date: parse_date_arg(args, "due_date")?,
            participants: arg_optional_string_array(args, "participants")?,
            attachments: parse_attachments(args, "attachments")?,
            ..Default::default()
        };

        let client = self.client(args).await?;
        let response = client.create_task(&request).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(response
            .task
            .as_ref()
            .map(normalize::task)
            .unwrap_or(Value::Null))
    }

    async fn tool_comment_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task_id = required_u64(args, "task_id")?;
        let request = comment_request_from_args(args)?;
        self.send_comment(task_id, &request, args).await
    }

    async fn tool_complete_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task_id = required_u64(args, "task_id")?;
        let request = TaskCommentRequest {
            action: Some("finished".to_string()),
            ..Default::default()
        };
        self.send_comment(task_id, &request, args).await
    }

    async fn tool_reopen_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task_id = required_u64(args, "task_id")?;
        let request = TaskCommentRequest {
            action: Some("reopened".to_string()),
            ..Default::default()
        };
        self.send_comment(task_id, &request, args).await
    }

    async fn send_comment(
        &self,
        task_id: u64,
        request: &TaskCommentRequest,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.comment_task(task_id, request).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(response
            .task
            .as_ref()
            .map(normalize::task)
            .unwrap_or(Value::Null))
    }

    // -- Forms & registry --------------------------------------------------

    async fn tool_get_forms(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.get_forms().await?;
        ensure_api_ok(&response.error_code)?;
        let forms: Vec<Value> = response
            .forms
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|form| json!({ "id": form.id, "name": form.name }))
            .collect();
        Ok(Value::Array(forms))
    }

    async fn tool_get_form(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let form_id = required_u64(args, "form_id")?;
        let client = self.client(args).await?;
        let form = client.get_form(form_id).await?;
        ensure_api_ok(&form.error_code)?;
        Ok(normalize::form(&form))
    }

    async fn tool_get_registry(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let form_id = required_u64(args, "form_id")?;
        let limit = arg_u64_or(args, "limit", DEFAULT_REGISTRY_LIMIT)? as u32;
        let include_archived = arg_bool_or(args, "include_archived", false)?;

        let request = FormRegisterRequest {
            item_count: Some(limit),
            include_archived: Some(include_archived),
        };
        let client = self.client(args).await?;
        let response = client.get_registry(form_id, &request).await?;
        ensure_api_ok(&response.error_code)?;
        let tasks: Vec<Value> = response
            .tasks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::task)
            .collect();
        Ok(Value::Array(tasks))
    }

    async fn tool_create_form_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let form_id = required_u64(args, "form_id")?;
        let fields = match args.get("fields") {
            None | Some(Value::Null) => None,
            Some(value @ Value::Array(_)) => Some(value.clone()),
            Some(_) => {
                return Err(ToolError::validation(
                    "'fields' must be an array of {id|name, value} objects",
                    "fields",
                ));
            }
        };
        let fill_defaults = arg_bool_or(args, "fill_defaults", true)?;

        let request = CreateTaskRequest {
            form_id: Some(form_id as i64),
            fields,
            fill_defaults: Some(fill_defaults),
            ..Default::default()
        };
        let client = self.client(args).await?;
        let response = client.create_task(&request).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(response
            .task
            .as_ref()
            .map(normalize::task)
            .unwrap_or(Value::Null))
    }

    // -- Contacts & organization -------------------------------------------

    async fn tool_get_contacts(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let include_inactive = arg_bool_or(args, "include_inactive", false)?;
        let client = self.client(args).await?;
        let response = client.get_contacts(include_inactive).await?;
        ensure_api_ok(&response.error_code)?;
        let organizations: Vec<Value> = response
            .organizations
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::organization)
            .collect();
        Ok(Value::Array(organizations))
    }

    async fn tool_get_members(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.get_members().await?;
        ensure_api_ok(&response.error_code)?;
        let members: Vec<Value> = response
            .members
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|member| normalize::person(Some(member)))
            .collect();
        Ok(Value::Array(members))
    }

    async fn tool_get_roles(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.get_roles().await?;
        ensure_api_ok(&response.error_code)?;
        let roles: Vec<Value> = response
            .roles
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::role)
            .collect();
        Ok(Value::Array(roles))
    }

    // -- Announcements -----------------------------------------------------

    async fn tool_get_announcements(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limit = arg_u64_or(args, "limit", DEFAULT_ANNOUNCEMENTS_LIMIT)? as u32;
        let client = self.client(args).await?;

        // The typed announcement shape is unreliable on the wire, so the raw
        // payload is walked directly with null-safe field extraction.
        let raw = client.get_announcements_raw(limit).await?;
        if let Some(code) = raw
            .get("error_code")
            .and_then(Value::as_str)
            .filter(|code| !code.is_empty())
        {
            return Err(
                ToolError::new("api_error", format!("API error: {code}"))
                    .with_details(json!({ "error_code": code })),
            );
        }

        let Some(items) = raw.get("announcements").and_then(Value::as_array) else {
            return Ok(json!([]));
        };

        let announcements: Vec<Value> = items
            .iter()
            .map(|ann| {
                let author = ann
                    .get("author")
                    .and_then(Value::as_object)
                    .map(|author| {
                        let first = author
                            .get("first_name")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let last = author
                            .get("last_name")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        json!({
                            "id": author.get("id"),
                            "name": format!("{first} {last}").trim(),
                            "email": author.get("email"),
                        })
                    })
                    .unwrap_or(Value::Null);
                json!({
                    "id": ann.get("id"),
                    "text": ann.get("text"),
                    "create_date": ann.get("create_date"),
                    "author": author,
                    "comments_count": ann
                        .get("comments")
                        .and_then(Value::as_array)
                        .map(Vec::len)
                        .unwrap_or(0),
                })
            })
            .collect();
        Ok(Value::Array(announcements))
    }

    async fn tool_create_announcement(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let text = required_string(args, "text")?;
        let client = self.client(args).await?;
        let response = client.create_announcement(&text).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(response
            .announcement
            .as_ref()
            .map(normalize::announcement)
            .unwrap_or(Value::Null))
    }

    // -- Calendar & lists --------------------------------------------------

    async fn tool_get_calendar(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let request = CalendarRequest {
            start_date_utc: required_date(args, "start_date")?,
            end_date_utc: required_date(args, "end_date")?,
            include_meetings: arg_bool_or(args, "include_meetings", true)?,
        };
        let client = self.client(args).await?;
        let response = client.get_calendar_tasks(&request).await?;
        ensure_api_ok(&response.error_code)?;
        let tasks: Vec<Value> = response
            .tasks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::task)
            .collect();
        Ok(Value::Array(tasks))
    }

    async fn tool_get_lists(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let client = self.client(args).await?;
        let response = client.get_lists().await?;
        ensure_api_ok(&response.error_code)?;
        let lists: Vec<Value> = response
            .lists
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::task_list)
            .collect();
        Ok(Value::Array(lists))
    }

    async fn tool_get_list_tasks(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let list_id = required_u64(args, "list_id")?;
        let limit = arg_u64_or(args, "limit", DEFAULT_LIST_TASKS_LIMIT)? as u32;
        let client = self.client(args).await?;
        let response = client.get_task_list(list_id, limit).await?;
        ensure_api_ok(&response.error_code)?;
        let tasks: Vec<Value> = response
            .tasks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::task_header)
            .collect();
        Ok(Value::Array(tasks))
    }

    // -- Catalogs ----------------------------------------------------------

    async fn tool_get_catalog(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let catalog_id = required_u64(args, "catalog_id")?;
        let client = self.client(args).await?;
        let response = client.get_catalog(catalog_id).await?;
        ensure_api_ok(&response.error_code)?;
        let items: Vec<Value> = response
            .items
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize::catalog_item)
            .collect();
        Ok(json!({
            "catalog_id": response.catalog_id,
            "name": response.name,
            "headers": response.catalog_headers,
            "items": items,
        }))
    }

    // -- Files -------------------------------------------------------------

    async fn tool_download_file(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let file_id = required_u64(args, "file_id")?;
        let save_dir = match arg_optional_string(args, "save_dir")? {
            Some(dir) => util::expand_user(&dir),
            None => util::default_download_dir(),
        };
        util::ensure_download_dir(&save_dir)?;

        let client = self.client(args).await?;
        let response = client.download_file(file_id).await?;
        ensure_api_ok(&response.error_code)?;
        let Some(raw) = response.raw_file else {
            return Err(ToolError::new(
                "api_error",
                format!("API returned no file data for file_id {file_id}"),
            ));
        };

        let mut warnings: Vec<String> = Vec::new();
        if raw.is_empty() {
            tracing::warn!(file_id, "downloaded file has 0 bytes");
            warnings.push("File has 0 bytes - may be empty or corrupted on server".to_string());
        }

        let (filename, name_warning) = util::safe_filename(response.filename.as_deref(), file_id);
        if let Some(warning) = name_warning {
            tracing::warn!(file_id, "{warning}");
            warnings.push(warning);
        }

        let target = save_dir.join(&filename);
        if let Err(err) = tokio::fs::write(&target, &raw).await {
            if err.kind() == std::io::ErrorKind::PermissionDenied {
                return Err(ToolError::new(
                    "permission_denied",
                    format!("Cannot write file '{}': permission denied", target.display()),
                ));
            }
            let mut message = format!("Failed to write file to '{}': {err}", target.display());
            if target.exists() {
                if let Err(cleanup) = std::fs::remove_file(&target) {
                    tracing::warn!(
                        "failed to clean up partial file '{}': {cleanup}",
                        target.display()
                    );
                    message.push_str(&format!(" (warning: partial file may remain: {cleanup})"));
                }
            }
            return Err(ToolError::new("io_error", message));
        }

        tracing::info!(
            file_id,
            bytes = raw.len(),
            "downloaded file to {}",
            target.display()
        );
        let mut result = json!({
            "status": "downloaded",
            "filename": filename,
            "saved_to": target.display().to_string(),
            "size": raw.len(),
        });
        if !warnings.is_empty() {
            result["warning"] = Value::String(warnings.join("; "));
        }
        Ok(result)
    }

    async fn tool_upload_file(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let raw_path = required_string(args, "file_path")?;
        let root_id = arg_optional_i64(args, "root_id")?;
        let path = util::expand_user(&raw_path);
        if !path.exists() {
            return Err(
                ToolError::new("not_found", format!("File not found: {raw_path}"))
                    .with_field("file_path"),
            );
        }

        let client = self.client(args).await?;
        let response = client.upload_file(&path).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(json!({
            "guid": response.guid,
            "md5_hash": response.md5_hash,
            "root_id": root_id,
        }))
    }

    async fn tool_upload_file_content(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let content_base64 = required_string(args, "content_base64")?;
        let filename = required_string(args, "filename")?;
        let content = BASE64.decode(content_base64.as_bytes()).map_err(|err| {
            ToolError::validation(format!("Invalid base64 content: {err}"), "content_base64")
        })?;

        // The temp file is removed on drop, covering every exit path below.
        let tmp = write_upload_temp(&content, &filename)?;
        let client = self.client(args).await?;
        let response = client.upload_file(tmp.path()).await?;
        ensure_api_ok(&response.error_code)?;
        Ok(json!({
            "guid": response.guid,
            "md5_hash": response.md5_hash,
        }))
    }

    async fn tool_attach_file_to_task(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task_id = required_u64(args, "task_id")?;
        let file_path = arg_optional_string(args, "file_path")?;
        let content_base64 = arg_optional_string(args, "content_base64")?;
        let filename = arg_optional_string(args, "filename")?;
        let text = arg_optional_string(args, "text")?;
        let root_id = arg_optional_i64(args, "root_id")?;

        match (&file_path, &content_base64) {
            (Some(_), Some(_)) => {
                return Err(ToolError::validation(
                    "Provide either file_path or content_base64, not both",
                    "file_path",
                ));
            }
            (None, None) => {
                return Err(ToolError::validation(
                    "Must provide either file_path or content_base64",
                    "file_path",
                ));
            }
            _ => {}
        }
        if content_base64.is_some() && filename.is_none() {
            return Err(ToolError::validation(
                "filename is required when using content_base64",
                "filename",
            ));
        }

        let client = self.client(args).await?;
        let upload = if let Some(raw_path) = &file_path {
            let path = util::expand_user(raw_path);
            if !path.exists() {
                return Err(
                    ToolError::new("not_found", format!("File not found: {raw_path}"))
                        .with_field("file_path"),
                );
            }
            let response = client.upload_file(&path).await?;
            ensure_api_ok(&response.error_code)?;
            response
        } else {
            let content_base64 = content_base64.as_deref().unwrap_or_default();
            let content = BASE64.decode(content_base64.as_bytes()).map_err(|err| {
                ToolError::validation(format!("Invalid base64 content: {err}"), "content_base64")
            })?;
            let tmp = write_upload_temp(&content, filename.as_deref().unwrap_or("upload"))?;
            let response = client.upload_file(tmp.path()).await?;
            ensure_api_ok(&response.error_code)?;
            response
        };

        let guid = upload.guid.clone().ok_or_else(|| {
            ToolError::new("upload_failed", "Upload response did not include a file guid")
        })?;

        // No rollback: the upload is durable. If the attach step fails, the
        // guid rides along in the error so the caller can retry just that step.
        let request = TaskCommentRequest {
            text,
            attachments: Some(vec![NewFile {
                guid: Some(guid.clone()),
                root_id,
                ..Default::default()
            }]),
            ..Default::default()
        };
        let response = client
            .comment_task(task_id, &request)
            .await
            .map_err(|err| with_uploaded_guid(err, &guid))?;
        ensure_api_ok(&response.error_code).map_err(|err| with_uploaded_guid(err, &guid))?;
        Ok(response
            .task
            .as_ref()
            .map(normalize::task)
            .unwrap_or(Value::Null))
    }
}

fn write_upload_temp(content: &[u8], filename: &str) -> Result<tempfile::NamedTempFile, ToolError> {
    let safe_name = std::path::Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let tmp = tempfile::Builder::new()
        .prefix("pyrus_upload_")
        .suffix(&format!("_{safe_name}"))
        .tempfile()
        .map_err(|err| ToolError::new("io_error", format!("Failed to create temp file: {err}")))?;
    std::fs::write(tmp.path(), content)
        .map_err(|err| ToolError::new("io_error", format!("Failed to write temp file: {err}")))?;
    Ok(tmp)
}

fn ensure_api_ok(error_code: &Option<String>) -> Result<(), ToolError> {
    match error_code.as_deref().filter(|code| !code.is_empty()) {
        Some(code) => Err(ToolError::new("api_error", format!("API error: {code}"))
            .with_details(json!({ "error_code": code }))),
        None => Ok(()),
    }
}

fn with_uploaded_guid(mut err: ToolError, guid: &str) -> ToolError {
    let details = match err.details.take() {
        Some(existing) => json!({ "uploaded_guid": guid, "error_details": existing }),
        None => json!({ "uploaded_guid": guid }),
    };
    err.details = Some(details);
    err
}

fn comment_request_from_args(args: &Map<String, Value>) -> Result<TaskCommentRequest, ToolError> {
    let field_updates = match args.get("field_updates") {
        None | Some(Value::Null) => None,
        Some(value @ Value::Array(_)) => Some(value.clone()),
        Some(_) => {
            return Err(ToolError::validation(
                "'field_updates' must be an array of {id, value} objects",
                "field_updates",
            ));
        }
    };

    Ok(TaskCommentRequest {
        text: arg_optional_string(args, "text")?,
        action: arg_optional_enum(args, "action", &TASK_ACTIONS)?,
        reassign_to: arg_optional_string(args, "reassign_to")?,
        added_list_ids: arg_optional_i64_array(args, "added_list_ids")?,
        removed_list_ids: arg_optional_i64_array(args, "removed_list_ids")?,
        scheduled_date: parse_date_arg(args, "scheduled_date")?,
        cancel_schedule: arg_optional_bool(args, "cancel_schedule")?,
        due_date: parse_date_arg(args, "due_date")?,
        due: parse_datetime_arg(args, "due")?,
        duration: arg_optional_i64(args, "duration")?,
        cancel_due: arg_optional_bool(args, "cancel_due")?,
        subject: arg_optional_string(args, "subject")?,
        spent_minutes: arg_optional_i64(args, "spent_minutes")?,
        subscribers_added: arg_optional_string_array(args, "subscribers_added")?,
        subscribers_removed: arg_optional_string_array(args, "subscribers_removed")?,
        participants_added: arg_optional_string_array(args, "participants_added")?,
        participants_removed: arg_optional_string_array(args, "participants_removed")?,
        approval_choice: arg_optional_enum(args, "approval_choice", &APPROVAL_CHOICES)?,
        field_updates,
        attachments: parse_attachments(args, "attachments")?,
        skip_notification: arg_optional_bool(args, "skip_notification")?,
    })
}

// ---------------------------------------------------------------------------
// Tool surface
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn account_schema() -> Value {
    json!({
        "type": "string",
        "description": "Account key from the accounts configuration (see list_accounts); defaults to the configured default account"
    })
}

fn attachments_schema() -> Value {
    json!({
        "type": "array",
        "description": "Attachment descriptors. Each entry may carry any subset of: 'guid' (from upload_file), 'root_id' (versioning), 'attachment_id' (existing file), 'url', 'name'.",
        "items": {
            "type": "object",
            "properties": {
                "guid": { "type": "string" },
                "root_id": { "type": "integer" },
                "attachment_id": { "type": "integer" },
                "url": { "type": "string" },
                "name": { "type": "string" }
            },
            "additionalProperties": false
        }
    })
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_accounts",
            description: "List all configured Pyrus accounts with their names and descriptions. No remote call.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_profile",
            description: "Get the current user's profile for the account: identity plus organization summary.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_inbox",
            description: "Get inbox tasks, flat plus any server-side groupings.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": 50, "description": "Maximum number of tasks to return" },
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_task",
            description: "Get one task with all its comments and details.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "create_task",
            description: "Create a new simple task.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Task description/content" },
                    "subject": { "type": "string" },
                    "responsible": { "type": "string", "description": "Email or person id of the responsible" },
                    "due_date": { "type": "string", "description": "Due date, YYYY-MM-DD" },
                    "participants": { "type": "array", "items": { "type": "string" } },
                    "attachments": attachments_schema(),
                    "account": account_schema()
                },
                "required": ["text"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "comment_task",
            description: "Comment on a task or perform an action; the main mutation tool. Any subset of the fields is applied as one atomic comment event.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "text": { "type": "string" },
                    "action": { "type": "string", "enum": ["finished", "reopened"] },
                    "reassign_to": { "type": "string", "description": "Email or person id to reassign to" },
                    "added_list_ids": { "type": "array", "items": { "type": "integer" }, "description": "List ids to add the task to (see get_lists)" },
                    "removed_list_ids": { "type": "array", "items": { "type": "integer" } },
                    "scheduled_date": { "type": "string", "description": "Schedule date, YYYY-MM-DD; moves the task to the calendar" },
                    "cancel_schedule": { "type": "boolean", "description": "Cancel the schedule and move the task back to the inbox" },
                    "due_date": { "type": "string", "description": "Due date, YYYY-MM-DD (date only)" },
                    "due": { "type": "string", "description": "Due datetime, YYYY-MM-DDTHH:MM" },
                    "duration": { "type": "integer", "description": "Duration in minutes, only with 'due'" },
                    "cancel_due": { "type": "boolean" },
                    "subject": { "type": "string", "description": "Rename the task subject/title" },
                    "spent_minutes": { "type": "integer", "description": "Log time spent in minutes" },
                    "subscribers_added": { "type": "array", "items": { "type": "string" } },
                    "subscribers_removed": { "type": "array", "items": { "type": "string" } },
                    "participants_added": { "type": "array", "items": { "type": "string" } },
                    "participants_removed": { "type": "array", "items": { "type": "string" } },
                    "approval_choice": { "type": "string", "enum": ["approved", "rejected", "acknowledged"] },
                    "field_updates": { "type": "array", "items": { "type": "object" }, "description": "Form field updates, e.g. [{\"id\": 123, \"value\": \"new value\"}]" },
                    "attachments": attachments_schema(),
                    "skip_notification": { "type": "boolean" },
                    "account": account_schema()
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "complete_task",
            description: "Mark a task as finished. Same remote path as comment_task with action=finished.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "reopen_task",
            description: "Reopen a closed task. Same remote path as comment_task with action=reopened.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_forms",
            description: "Get all available form templates (id and name).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_form",
            description: "Get one form template with its field definitions.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "form_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["form_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_registry",
            description: "Get tasks created from a specific form template.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "form_id": { "type": "integer" },
                    "limit": { "type": "integer", "minimum": 1, "default": 100 },
                    "include_archived": { "type": "boolean", "default": false },
                    "account": account_schema()
                },
                "required": ["form_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "create_form_task",
            description: "Create a new task from a form template.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "form_id": { "type": "integer" },
                    "fields": { "type": "array", "items": { "type": "object" }, "description": "Field values, each with 'id' or 'name' plus 'value'" },
                    "fill_defaults": { "type": "boolean", "default": true },
                    "account": account_schema()
                },
                "required": ["form_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_contacts",
            description: "Get all contacts grouped by organization.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "include_inactive": { "type": "boolean", "default": false },
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_members",
            description: "Get all members of the organization.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_roles",
            description: "Get all roles in the organization with their member ids.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_announcements",
            description: "Get announcements with author and comment counts.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": 100 },
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "create_announcement",
            description: "Create a new announcement.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "account": account_schema()
                },
                "required": ["text"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_calendar",
            description: "Get calendar tasks for a date range.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "start_date": { "type": "string", "description": "Start date, YYYY-MM-DD" },
                    "end_date": { "type": "string", "description": "End date, YYYY-MM-DD" },
                    "include_meetings": { "type": "boolean", "default": true },
                    "account": account_schema()
                },
                "required": ["start_date", "end_date"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_lists",
            description: "Get all task lists available to the user (hierarchical).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account": account_schema()
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_list_tasks",
            description: "Get the tasks in a specific list.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "list_id": { "type": "integer" },
                    "limit": { "type": "integer", "minimum": 1, "default": 200 },
                    "account": account_schema()
                },
                "required": ["list_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_catalog",
            description: "Get a catalog with its headers and items.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "catalog_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["catalog_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "download_file",
            description: "Download a file attachment to disk. Creates the directory if needed, sanitizes the filename, and overwrites files of the same name.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_id": { "type": "integer" },
                    "save_dir": { "type": "string", "description": "Destination directory; defaults to the user's Downloads folder" },
                    "account": account_schema()
                },
                "required": ["file_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "upload_file",
            description: "Upload a file from disk for later attachment; returns a guid for the attachments parameter.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string" },
                    "root_id": { "type": "integer", "description": "Creates a new version of an existing file" },
                    "account": account_schema()
                },
                "required": ["file_path"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "upload_file_content",
            description: "Upload base64-encoded content as a file; returns a guid for the attachments parameter.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "content_base64": { "type": "string" },
                    "filename": { "type": "string", "description": "Name for the uploaded file, e.g. 'report.pdf'" },
                    "account": account_schema()
                },
                "required": ["content_base64", "filename"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "attach_file_to_task",
            description: "Upload a file (path or inline content, exactly one) and attach it to a task in one action. The upload is durable: if attaching fails, the returned guid can be reused.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "integer" },
                    "file_path": { "type": "string", "description": "Path to a file; mutually exclusive with content_base64" },
                    "content_base64": { "type": "string", "description": "Inline file content; requires filename" },
                    "filename": { "type": "string" },
                    "text": { "type": "string", "description": "Optional comment text" },
                    "root_id": { "type": "integer" },
                    "account": account_schema()
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(ToolError::validation(format!("'{key}' must be a string"), key)),
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args
        .get(key)
        .ok_or_else(|| ToolError::validation(format!("Missing required field '{key}'"), key))?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::validation(
            format!("'{key}' must not be empty"),
            key,
        )),
        _ => Err(ToolError::validation(format!("'{key}' must be a string"), key)),
    }
}

fn arg_optional_bool(args: &Map<String, Value>, key: &str) -> Result<Option<bool>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(v)) => Ok(Some(*v)),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be a boolean"),
            key,
        )),
    }
}

fn arg_bool_or(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    Ok(arg_optional_bool(args, key)?.unwrap_or(default))
}

fn required_u64(args: &Map<String, Value>, key: &str) -> Result<u64, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolError::validation(
            format!("Missing required field '{key}'"),
            key,
        )),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            ToolError::validation(format!("'{key}' must be a positive integer"), key)
        }),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be an integer"),
            key,
        )),
    }
}

fn arg_u64_or(args: &Map<String, Value>, key: &str, default: u64) -> Result<u64, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            ToolError::validation(format!("'{key}' must be a positive integer"), key)
        }),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be an integer"),
            key,
        )),
    }
}

fn arg_optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ToolError::validation(format!("'{key}' must be an integer"), key))
            .map(Some),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be an integer"),
            key,
        )),
    }
}

fn arg_optional_string_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value.as_array().ok_or_else(|| {
        ToolError::validation(format!("'{key}' must be an array of strings"), key)
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let text = item.as_str().ok_or_else(|| {
            ToolError::validation(format!("'{key}' items must be strings"), key)
        })?;
        let normalized = text.trim();
        if !normalized.is_empty() {
            out.push(normalized.to_string());
        }
    }
    Ok(Some(out))
}

fn arg_optional_i64_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<i64>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value.as_array().ok_or_else(|| {
        ToolError::validation(format!("'{key}' must be an array of integers"), key)
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let id = item.as_i64().ok_or_else(|| {
            ToolError::validation(format!("'{key}' items must be integers"), key)
        })?;
        out.push(id);
    }
    Ok(Some(out))
}

fn arg_optional_enum(
    args: &Map<String, Value>,
    key: &str,
    allowed: &[&str],
) -> Result<Option<String>, ToolError> {
    match arg_optional_string(args, key)? {
        None => Ok(None),
        Some(value) if allowed.contains(&value.as_str()) => Ok(Some(value)),
        Some(value) => Err(ToolError::validation(
            format!("'{key}' must be one of: {}", allowed.join(", ")),
            key,
        )
        .with_details(json!({ "received": value }))),
    }
}

fn parse_date_arg(args: &Map<String, Value>, key: &str) -> Result<Option<NaiveDate>, ToolError> {
    match arg_optional_string(args, key)? {
        None => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                ToolError::validation(
                    format!("'{key}' must be a date in YYYY-MM-DD format"),
                    key,
                )
                .with_details(json!({ "received": raw }))
            }),
    }
}

fn required_date(args: &Map<String, Value>, key: &str) -> Result<NaiveDate, ToolError> {
    parse_date_arg(args, key)?
        .ok_or_else(|| ToolError::validation(format!("Missing required field '{key}'"), key))
}

fn parse_datetime_arg(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<NaiveDateTime>, ToolError> {
    match arg_optional_string(args, key)? {
        None => Ok(None),
        Some(raw) => NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M")
            .map(Some)
            .map_err(|_| {
                ToolError::validation(
                    format!("'{key}' must be a datetime in YYYY-MM-DDTHH:MM format"),
                    key,
                )
                .with_details(json!({ "received": raw }))
            }),
    }
}

fn optional_string_in(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<String>, ToolError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(ToolError::validation(
            format!("'{field}' must be a string"),
            field,
        )),
    }
}

fn optional_i64_in(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<i64>, ToolError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ToolError::validation(format!("'{field}' must be an integer"), field))
            .map(Some),
        Some(_) => Err(ToolError::validation(
            format!("'{field}' must be an integer"),
            field,
        )),
    }
}

fn parse_attachments(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<NewFile>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value.as_array().ok_or_else(|| {
        ToolError::validation(
            format!("'{key}' must be an array of attachment descriptors"),
            key,
        )
    })?;
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let obj = item.as_object().ok_or_else(|| {
            ToolError::validation(format!("{key}[{index}] must be an object"), key)
        })?;
        out.push(NewFile {
            guid: optional_string_in(obj, "guid", &format!("{key}[{index}].guid"))?,
            root_id: optional_i64_in(obj, "root_id", &format!("{key}[{index}].root_id"))?,
            attachment_id: optional_i64_in(
                obj,
                "attachment_id",
                &format!("{key}[{index}].attachment_id"),
            )?,
            url: optional_string_in(obj, "url", &format!("{key}[{index}].url"))?,
            name: optional_string_in(obj, "name", &format!("{key}[{index}].name"))?,
        });
    }
    Ok(Some(out))
}

// ---------------------------------------------------------------------------
// JSON-RPC plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<Value>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::accounts::Account;
    use crate::model::*;

    const ACCOUNTS_JSON: &str = r#"{
        "accounts": {
            "work": {"login": "bot@example.com", "security_key": "sk"}
        },
        "default_account": "work"
    }"#;

    #[derive(Default, Debug)]
    struct StubApi {
        comment_calls: AtomicUsize,
        upload_calls: AtomicUsize,
        last_comment: StdMutex<Option<TaskCommentRequest>>,
        uploaded_paths: StdMutex<Vec<PathBuf>>,
        fail_uploads: bool,
        comment_error_code: Option<String>,
        download: StdMutex<Option<DownloadResponse>>,
        announcements_raw: StdMutex<Option<Value>>,
    }

    #[async_trait]
    impl TaskApi for StubApi {
        async fn get_profile(&self) -> Result<ProfileResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_inbox(&self, _item_count: u32) -> Result<InboxResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_task(&self, task_id: u64) -> Result<TaskResponse, ToolError> {
            Ok(TaskResponse {
                task: Some(Task {
                    id: Some(task_id as i64),
                    ..Default::default()
                }),
                error_code: None,
            })
        }
        async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskResponse, ToolError> {
            // Echoes the request back the way the remote side would.
            Ok(TaskResponse {
                task: Some(Task {
                    id: Some(1),
                    text: request.text.clone(),
                    subject: request.subject.clone(),
                    due_date: request.due_date,
                    ..Default::default()
                }),
                error_code: None,
            })
        }
        async fn comment_task(
            &self,
            task_id: u64,
            request: &TaskCommentRequest,
        ) -> Result<TaskResponse, ToolError> {
            self.comment_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_comment.lock().unwrap() = Some(request.clone());
            Ok(TaskResponse {
                task: Some(Task {
                    id: Some(task_id as i64),
                    ..Default::default()
                }),
                error_code: self.comment_error_code.clone(),
            })
        }
        async fn get_forms(&self) -> Result<FormsResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_form(&self, _form_id: u64) -> Result<Form, ToolError> {
            Ok(Default::default())
        }
        async fn get_registry(
            &self,
            _form_id: u64,
            _request: &FormRegisterRequest,
        ) -> Result<RegistryResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_contacts(&self, _include_inactive: bool) -> Result<ContactsResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_members(&self) -> Result<MembersResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_roles(&self) -> Result<RolesResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_announcements_raw(&self, _item_count: u32) -> Result<Value, ToolError> {
            Ok(self
                .announcements_raw
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Value::Null))
        }
        async fn create_announcement(&self, _text: &str) -> Result<AnnouncementResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_calendar_tasks(
            &self,
            _request: &CalendarRequest,
        ) -> Result<CalendarResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_lists(&self) -> Result<ListsResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_task_list(
            &self,
            _list_id: u64,
            _item_count: u32,
        ) -> Result<TaskListResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_catalog(&self, _catalog_id: u64) -> Result<CatalogResponse, ToolError> {
            Ok(Default::default())
        }
        async fn download_file(&self, _file_id: u64) -> Result<DownloadResponse, ToolError> {
            Ok(self.download.lock().unwrap().clone().unwrap_or_default())
        }
        async fn upload_file(&self, path: &Path) -> Result<UploadResponse, ToolError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.uploaded_paths.lock().unwrap().push(path.to_path_buf());
            if self.fail_uploads {
                return Err(ToolError::new("api_error", "API error: 500"));
            }
            Ok(UploadResponse {
                guid: Some("guid-123".to_string()),
                md5_hash: Some("0cc175b9c0f1b6a831c399e269772661".to_string()),
                error_code: None,
            })
        }
    }

    struct StubFactory {
        api: Arc<StubApi>,
    }

    #[async_trait]
    impl ApiFactory for StubFactory {
        async fn connect(
            &self,
            _key: &str,
            _account: &Account,
        ) -> Result<Arc<dyn TaskApi>, ToolError> {
            Ok(self.api.clone())
        }
    }

    fn test_server(api: Arc<StubApi>) -> McpServer {
        let registry = Arc::new(
            AccountRegistry::from_json(ACCOUNTS_JSON, Path::new("accounts.json")).unwrap(),
        );
        McpServer::with_factory(registry, Arc::new(StubFactory { api }))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn tool_definitions_are_unique_object_schemas() {
        let tools = tool_definitions();
        let names: HashSet<&str> = tools.iter().map(|tool| tool.name).collect();
        assert_eq!(names.len(), tools.len());
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(!tool.description.is_empty(), "{}", tool.name);
        }
    }

    #[test]
    fn comment_task_schema_requires_only_task_id() {
        let tool = tool_definitions()
            .into_iter()
            .find(|tool| tool.name == "comment_task")
            .unwrap();
        assert_eq!(tool.input_schema["required"], json!(["task_id"]));
        assert_eq!(
            tool.input_schema["properties"]["action"]["enum"],
            json!(["finished", "reopened"])
        );
    }

    #[tokio::test]
    async fn initialize_reports_server_identity() {
        let server = test_server(Arc::new(StubApi::default()));
        let payload = server.initialize_payload();
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn unknown_method_and_unknown_tool_are_rejected() {
        let server = test_server(Arc::new(StubApi::default()));
        let err = server
            .handle_request("bogus/method", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32601);

        let err = server
            .execute_tool("explode", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "unknown_tool");
    }

    #[tokio::test]
    async fn tools_call_wraps_errors_in_error_envelope() {
        let server = test_server(Arc::new(StubApi::default()));
        let response = server
            .handle_tools_call(json!({ "name": "get_task", "arguments": {} }))
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        assert_eq!(response["structuredContent"]["status"], "error");
        assert_eq!(
            response["structuredContent"]["error"]["error"],
            "validation_failed"
        );

        let response = server
            .handle_tools_call(json!({ "name": "list_accounts" }))
            .await
            .unwrap();
        assert!(response.get("isError").is_none());
        assert_eq!(response["structuredContent"]["status"], "ok");
        assert_eq!(
            response["structuredContent"]["data"][0]["key"],
            "work"
        );
    }

    #[tokio::test]
    async fn create_task_echoes_due_date_and_derives_open_status() {
        let server = test_server(Arc::new(StubApi::default()));
        let payload = server
            .execute_tool(
                "create_task",
                &args(json!({ "text": "Buy milk", "due_date": "2024-01-15" })),
            )
            .await
            .unwrap();
        assert_eq!(payload["text"], "Buy milk");
        assert_eq!(payload["due_date"], "2024-01-15");
        assert_eq!(payload["status"], "open");
    }

    #[tokio::test]
    async fn create_task_validates_before_any_remote_work() {
        let server = test_server(Arc::new(StubApi::default()));
        let err = server
            .execute_tool("create_task", &args(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("text"));

        let err = server
            .execute_tool(
                "create_task",
                &args(json!({ "text": "x", "due_date": "15-01-2024" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("due_date"));
    }

    #[tokio::test]
    async fn comment_task_rejects_malformed_due_before_any_remote_call() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());
        let err = server
            .execute_tool(
                "comment_task",
                &args(json!({ "task_id": 123, "due": "2024-13-40T99:99" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("due"));
        assert_eq!(api.comment_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn comment_task_forwards_the_full_mutation_set() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());
        server
            .execute_tool(
                "comment_task",
                &args(json!({
                    "task_id": 123,
                    "text": "Fixed the bug",
                    "due": "2024-01-15T14:00",
                    "duration": 30,
                    "added_list_ids": [456],
                    "spent_minutes": 30,
                    "approval_choice": "approved",
                    "skip_notification": true
                })),
            )
            .await
            .unwrap();

        let request = api.last_comment.lock().unwrap().clone().unwrap();
        assert_eq!(request.text.as_deref(), Some("Fixed the bug"));
        assert_eq!(request.due.unwrap().to_string(), "2024-01-15 14:00:00");
        assert_eq!(request.duration, Some(30));
        assert_eq!(request.added_list_ids, Some(vec![456]));
        assert_eq!(request.spent_minutes, Some(30));
        assert_eq!(request.approval_choice.as_deref(), Some("approved"));
        assert_eq!(request.skip_notification, Some(true));
    }

    #[tokio::test]
    async fn comment_task_rejects_unknown_action() {
        let server = test_server(Arc::new(StubApi::default()));
        let err = server
            .execute_tool(
                "comment_task",
                &args(json!({ "task_id": 1, "action": "snoozed" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("action"));
    }

    #[tokio::test]
    async fn complete_and_reopen_ride_the_comment_path() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());

        server
            .execute_tool("complete_task", &args(json!({ "task_id": 7 })))
            .await
            .unwrap();
        let request = api.last_comment.lock().unwrap().clone().unwrap();
        assert_eq!(request.action.as_deref(), Some("finished"));

        server
            .execute_tool("reopen_task", &args(json!({ "task_id": 7 })))
            .await
            .unwrap();
        let request = api.last_comment.lock().unwrap().clone().unwrap();
        assert_eq!(request.action.as_deref(), Some("reopened"));
        assert_eq!(api.comment_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn calendar_requires_both_boundary_dates() {
        let server = test_server(Arc::new(StubApi::default()));
        let err = server
            .execute_tool("get_calendar", &args(json!({ "start_date": "2024-01-01" })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("end_date"));
    }

    #[tokio::test]
    async fn get_announcements_walks_the_raw_payload() {
        let api = Arc::new(StubApi::default());
        *api.announcements_raw.lock().unwrap() = Some(json!({
            "announcements": [
                {
                    "id": 1,
                    "text": "Office closed Friday",
                    "create_date": "2024-01-10T08:00:00Z",
                    "author": {"id": 7, "first_name": "Ada", "last_name": "Lovelace", "email": "ada@example.com"},
                    "comments": [{"id": 10}, {"id": 11}]
                },
                { "id": 2, "text": "No author on this one" }
            ]
        }));
        let server = test_server(api);
        let payload = server
            .execute_tool("get_announcements", &args(json!({})))
            .await
            .unwrap();
        assert_eq!(payload[0]["comments_count"], 2);
        assert_eq!(payload[0]["author"]["name"], "Ada Lovelace");
        assert_eq!(payload[1]["author"], Value::Null);
        assert_eq!(payload[1]["comments_count"], 0);
    }

    #[tokio::test]
    async fn download_file_sanitizes_traversal_filenames() {
        let api = Arc::new(StubApi::default());
        *api.download.lock().unwrap() = Some(DownloadResponse {
            filename: Some("../../etc/evil.txt".to_string()),
            raw_file: Some(b"hello".to_vec()),
            error_code: None,
        });
        let server = test_server(api);

        let dir = tempfile::tempdir().unwrap();
        let payload = server
            .execute_tool(
                "download_file",
                &args(json!({ "file_id": 42, "save_dir": dir.path().to_str().unwrap() })),
            )
            .await
            .unwrap();

        assert_eq!(payload["filename"], "evil.txt");
        let saved_to = PathBuf::from(payload["saved_to"].as_str().unwrap());
        assert_eq!(saved_to, dir.path().join("evil.txt"));
        assert_eq!(std::fs::read(&saved_to).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn download_file_flags_zero_byte_payloads_without_failing() {
        let api = Arc::new(StubApi::default());
        *api.download.lock().unwrap() = Some(DownloadResponse {
            filename: None,
            raw_file: Some(Vec::new()),
            error_code: None,
        });
        let server = test_server(api);

        let dir = tempfile::tempdir().unwrap();
        let payload = server
            .execute_tool(
                "download_file",
                &args(json!({ "file_id": 9, "save_dir": dir.path().to_str().unwrap() })),
            )
            .await
            .unwrap();

        assert_eq!(payload["status"], "downloaded");
        assert_eq!(payload["size"], 0);
        assert_eq!(payload["filename"], "file_9");
        assert!(payload["warning"].as_str().unwrap().contains("0 bytes"));
    }

    #[tokio::test]
    async fn download_file_rejects_non_directory_destination() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api);

        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("occupied");
        std::fs::write(&occupied, b"x").unwrap();
        let err = server
            .execute_tool(
                "download_file",
                &args(json!({ "file_id": 9, "save_dir": occupied.to_str().unwrap() })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "not_a_directory");
    }

    #[tokio::test]
    async fn attach_file_rejects_ambiguous_sources_without_uploading() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());

        let err = server
            .execute_tool(
                "attach_file_to_task",
                &args(json!({
                    "task_id": 1,
                    "file_path": "/tmp/report.pdf",
                    "content_base64": "aGVsbG8="
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");

        let err = server
            .execute_tool("attach_file_to_task", &args(json!({ "task_id": 1 })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");

        let err = server
            .execute_tool(
                "attach_file_to_task",
                &args(json!({ "task_id": 1, "content_base64": "aGVsbG8=" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("filename"));

        assert_eq!(api.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attach_file_uploads_then_comments_with_the_guid() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());

        let payload = server
            .execute_tool(
                "attach_file_to_task",
                &args(json!({
                    "task_id": 55,
                    "content_base64": "aGVsbG8=",
                    "filename": "notes.txt",
                    "text": "see attached"
                })),
            )
            .await
            .unwrap();

        assert_eq!(payload["id"], 55);
        assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.comment_calls.load(Ordering::SeqCst), 1);
        let request = api.last_comment.lock().unwrap().clone().unwrap();
        assert_eq!(request.text.as_deref(), Some("see attached"));
        let attachments = request.attachments.unwrap();
        assert_eq!(attachments[0].guid.as_deref(), Some("guid-123"));
    }

    #[tokio::test]
    async fn attach_failure_surfaces_the_uploaded_guid() {
        let api = Arc::new(StubApi {
            comment_error_code: Some("task_not_found".to_string()),
            ..Default::default()
        });
        let server = test_server(api.clone());

        let err = server
            .execute_tool(
                "attach_file_to_task",
                &args(json!({
                    "task_id": 55,
                    "content_base64": "aGVsbG8=",
                    "filename": "notes.txt"
                })),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, "api_error");
        assert_eq!(err.details.unwrap()["uploaded_guid"], "guid-123");
        assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upload_file_content_removes_the_temp_file_on_every_path() {
        // Failure path: the remote call errors after the temp file is written.
        let api = Arc::new(StubApi {
            fail_uploads: true,
            ..Default::default()
        });
        let server = test_server(api.clone());
        let err = server
            .execute_tool(
                "upload_file_content",
                &args(json!({ "content_base64": "aGVsbG8=", "filename": "notes.txt" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "api_error");
        let uploaded = api.uploaded_paths.lock().unwrap().clone();
        assert_eq!(uploaded.len(), 1);
        assert!(!uploaded[0].exists(), "temp file must be removed on failure");

        // Success path: the temp file is gone once the tool returns.
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());
        let payload = server
            .execute_tool(
                "upload_file_content",
                &args(json!({ "content_base64": "aGVsbG8=", "filename": "notes.txt" })),
            )
            .await
            .unwrap();
        assert_eq!(payload["guid"], "guid-123");
        let uploaded = api.uploaded_paths.lock().unwrap().clone();
        assert!(!uploaded[0].exists(), "temp file must be removed on success");
    }

    #[tokio::test]
    async fn upload_file_content_rejects_malformed_base64_before_upload() {
        let api = Arc::new(StubApi::default());
        let server = test_server(api.clone());
        let err = server
            .execute_tool(
                "upload_file_content",
                &args(json!({ "content_base64": "!!not-base64!!", "filename": "x.bin" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("content_base64"));
        assert_eq!(api.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_file_requires_an_existing_path() {
        let server = test_server(Arc::new(StubApi::default()));
        let err = server
            .execute_tool(
                "upload_file",
                &args(json!({ "file_path": "/nonexistent/never.bin" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[tokio::test]
    async fn framed_json_round_trips() {
        let value = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });
        let mut buffer = std::io::Cursor::new(Vec::new());
        write_framed_json(&mut buffer, &value).await.unwrap();

        let encoded = buffer.into_inner();
        let mut reader = BufReader::new(encoded.as_slice());
        let read_back = read_framed_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(read_back, value);

        // A clean EOF between messages means the peer closed the stream.
        assert!(read_framed_json(&mut reader).await.unwrap().is_none());
    }
}
