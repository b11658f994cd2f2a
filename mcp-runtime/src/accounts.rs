//! Account configuration and the per-process client cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::{MapAccess, Visitor};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::api::{ApiFactory, TaskApi};
use crate::error::{ConfigError, ToolError};

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
    pub security_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Accounts in document order. `serde_json` maps sort their keys, and
/// `resolve(None)` without a configured default must fall back to the
/// first *configured* account, so the entries are collected through a
/// map visitor instead.
struct OrderedAccounts(Vec<(String, Account)>);

impl<'de> Deserialize<'de> for OrderedAccounts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedAccounts;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of account key to account settings")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, account)) = map.next_entry::<String, Account>()? {
                    entries.push((key, account));
                }
                Ok(OrderedAccounts(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[derive(Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Option<OrderedAccounts>,
    #[serde(default)]
    default_account: Option<String>,
}

pub struct AccountRegistry {
    accounts: Vec<(String, Account)>,
    default_account: Option<String>,
}

impl AccountRegistry {
    /// Reads the accounts document once at startup. Every failure here is
    /// fatal: the server cannot dispatch a single tool without accounts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let registry = Self::from_json(&data, path)?;
        tracing::info!(count = registry.accounts.len(), "loaded account(s)");
        Ok(registry)
    }

    pub(crate) fn from_json(data: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: AccountsFile = serde_json::from_str(data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let accounts = file.accounts.ok_or(ConfigError::MissingAccounts)?.0;
        if accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        Ok(Self {
            accounts,
            default_account: file.default_account,
        })
    }

    /// Maps an optional account key to a configured account. `None` means
    /// the configured default, or the first configured account when no
    /// default is set.
    pub fn resolve(&self, requested: Option<&str>) -> Result<(&str, &Account), ToolError> {
        let key = match requested {
            Some(key) => key,
            None => self
                .default_account
                .as_deref()
                .unwrap_or_else(|| self.accounts[0].0.as_str()),
        };
        match self
            .accounts
            .iter()
            .find(|(candidate, _)| candidate.as_str() == key)
        {
            Some((key, account)) => Ok((key.as_str(), account)),
            None => {
                let available: Vec<&str> =
                    self.accounts.iter().map(|(key, _)| key.as_str()).collect();
                Err(ToolError::new(
                    "account_not_found",
                    format!(
                        "Account '{key}' not found. Available: {}",
                        available.join(", ")
                    ),
                )
                .with_field("account"))
            }
        }
    }

    /// Flat account records for the `list_accounts` tool. Secrets stay out.
    pub fn list(&self) -> Value {
        let accounts: Vec<Value> = self
            .accounts
            .iter()
            .map(|(key, account)| {
                json!({
                    "key": key,
                    "name": account.name.clone().unwrap_or_else(|| key.clone()),
                    "description": account.description.clone().unwrap_or_default(),
                    "login": account.login,
                    "is_default": Some(key.as_str()) == self.default_account.as_deref(),
                })
            })
            .collect();
        Value::Array(accounts)
    }
}

/// Lazily authenticated remote clients, one per account key, kept for the
/// life of the process. The map lock is held across the authentication
/// round-trip so concurrent first use of one account cannot race into a
/// second credential exchange.
pub struct ClientCache {
    registry: Arc<AccountRegistry>,
    factory: Arc<dyn ApiFactory>,
    clients: Mutex<HashMap<String, Arc<dyn TaskApi>>>,
}

impl ClientCache {
    pub fn new(registry: Arc<AccountRegistry>, factory: Arc<dyn ApiFactory>) -> Self {
        Self {
            registry,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, requested: Option<&str>) -> Result<Arc<dyn TaskApi>, ToolError> {
        let (key, account) = self.registry.resolve(requested)?;

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }

        let client = self.factory.connect(key, account).await?;
        tracing::info!(account = key, "authenticated account");
        clients.insert(key.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::model::*;

    const TWO_ACCOUNTS: &str = r#"{
        "accounts": {
            "zeta": {"login": "zeta@example.com", "security_key": "zk", "name": "Zeta Ops"},
            "alpha": {"login": "alpha@example.com", "security_key": "ak"}
        }
    }"#;

    fn registry(data: &str) -> AccountRegistry {
        AccountRegistry::from_json(data, Path::new("accounts.json")).unwrap()
    }

    /// No-op remote client; the cache tests only care about how often the
    /// factory authenticates.
    #[derive(Debug)]
    struct NullApi;

    #[async_trait]
    impl TaskApi for NullApi {
        async fn get_profile(&self) -> Result<ProfileResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_inbox(&self, _item_count: u32) -> Result<InboxResponse, ToolError> {
            Ok(Default::default())
        }
        async fn get_task(&self, _task_id: u64) -> Result<TaskResponse, ToolError> {
            Ok(Default::default())
        }
        async fn create_task(&self, _request: &CreateTaskRequest) -> Result<TaskResponse, ToolError> {
            Ok(Default::default())
        }
        async fn comment_task(
            &self,
            _task_id: u64,
            _request: &TaskCommentRequest,
        ) -> Result<TaskResponse, ToolError> {
            Ok(Default::default())
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
            Ok(Value::Null)
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
            Ok(Default::default())
        }
        async fn upload_file(&self, _path: &Path) -> Result<UploadResponse, ToolError> {
            Ok(Default::default())
        }
    }

    struct CountingFactory {
        connects: AtomicUsize,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ApiFactory for CountingFactory {
        async fn connect(
            &self,
            _key: &str,
            _account: &Account,
        ) -> Result<Arc<dyn TaskApi>, ToolError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullApi))
        }
    }

    #[test]
    fn load_failures_are_distinct() {
        let missing = AccountRegistry::load(&PathBuf::from("/nonexistent/accounts.json"));
        assert!(matches!(missing, Err(ConfigError::NotFound { .. })));

        let malformed = AccountRegistry::from_json("{not json", Path::new("accounts.json"));
        assert!(matches!(malformed, Err(ConfigError::Parse { .. })));

        let no_key = AccountRegistry::from_json(r#"{"default_account": "x"}"#, Path::new("a"));
        assert!(matches!(no_key, Err(ConfigError::MissingAccounts)));

        let empty = AccountRegistry::from_json(r#"{"accounts": {}}"#, Path::new("a"));
        assert!(matches!(empty, Err(ConfigError::NoAccounts)));
    }

    #[test]
    fn resolve_returns_each_configured_account_by_key() {
        let registry = registry(TWO_ACCOUNTS);
        let (key, account) = registry.resolve(Some("alpha")).unwrap();
        assert_eq!(key, "alpha");
        assert_eq!(account.login, "alpha@example.com");
        let (key, _) = registry.resolve(Some("zeta")).unwrap();
        assert_eq!(key, "zeta");
    }

    #[test]
    fn resolve_none_prefers_default_then_first_configured() {
        let with_default = registry(
            r#"{
                "accounts": {
                    "zeta": {"login": "z@example.com", "security_key": "zk"},
                    "alpha": {"login": "a@example.com", "security_key": "ak"}
                },
                "default_account": "alpha"
            }"#,
        );
        assert_eq!(with_default.resolve(None).unwrap().0, "alpha");

        // Without a default, document order wins, not lexicographic order.
        let without_default = registry(TWO_ACCOUNTS);
        assert_eq!(without_default.resolve(None).unwrap().0, "zeta");
    }

    #[test]
    fn resolve_unknown_key_enumerates_every_configured_key() {
        let registry = registry(TWO_ACCOUNTS);
        let err = registry.resolve(Some("nonexistent")).unwrap_err();
        assert_eq!(err.code, "account_not_found");
        assert!(err.message.contains("nonexistent"));
        assert!(err.message.contains("zeta"));
        assert!(err.message.contains("alpha"));
    }

    #[test]
    fn list_flags_only_the_configured_default() {
        let registry = registry(
            r#"{
                "accounts": {
                    "work": {"login": "w@example.com", "security_key": "wk", "description": "Main org"},
                    "personal": {"login": "p@example.com", "security_key": "pk"}
                },
                "default_account": "work"
            }"#,
        );
        let listed = registry.list();
        assert_eq!(listed[0]["key"], "work");
        assert_eq!(listed[0]["is_default"], true);
        assert_eq!(listed[0]["description"], "Main org");
        assert_eq!(listed[1]["name"], "personal");
        assert_eq!(listed[1]["is_default"], false);
    }

    #[tokio::test]
    async fn cache_authenticates_each_account_at_most_once() {
        let registry = Arc::new(registry(TWO_ACCOUNTS));
        let factory = Arc::new(CountingFactory::new());
        let cache = ClientCache::new(registry, factory.clone());

        cache.get(Some("zeta")).await.unwrap();
        cache.get(Some("zeta")).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        cache.get(Some("alpha")).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);

        // None resolves to the first configured account, already cached.
        cache.get(None).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_propagates_resolution_errors() {
        let registry = Arc::new(registry(TWO_ACCOUNTS));
        let cache = ClientCache::new(registry, Arc::new(CountingFactory::new()));
        let err = cache.get(Some("ghost")).await.unwrap_err();
        assert_eq!(err.code, "account_not_found");
    }
}
