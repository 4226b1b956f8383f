//! In-memory view of a sing-box configuration document and the logic that
//! maps users onto per-inbound account lists.
//!
//! The document is held as a JSON tree; each inbound keeps its own lock so
//! account churn on one entry point never blocks another. Account records are
//! a closed enum per credential family and are only converted back to JSON
//! when the document is serialized for the supervisor.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};

use relay_node_error::NodeError;

use crate::user::{ensure_base64_key, ProxyCredential, User};

#[derive(Debug)]
pub struct SingBoxConfig {
    raw: Map<String, Value>,
    entries: Vec<Entry>,
}

/// Non-object entries in the inbounds array are carried through untouched.
#[derive(Debug)]
enum Entry {
    Inbound(Inbound),
    Other(Value),
}

#[derive(Debug)]
pub struct Inbound {
    tag: String,
    protocol: String,
    exclude: bool,
    state: Mutex<InboundState>,
}

#[derive(Debug)]
struct InboundState {
    raw: Map<String, Value>,
    /// `None` until the synchronizer first touches this inbound; from then
    /// on this list is authoritative and overwrites the tree's `users`
    /// array at serialization time.
    accounts: Option<Vec<Account>>,
}

/// Protocol-specific credential record attached to an inbound for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    Id {
        name: String,
        uuid: String,
        flow: Option<String>,
    },
    Secret {
        name: String,
        password: String,
    },
    KeyedSecret {
        name: String,
        password: String,
        method: String,
    },
}

impl Account {
    pub fn name(&self) -> &str {
        match self {
            Self::Id { name, .. } | Self::Secret { name, .. } | Self::KeyedSecret { name, .. } => {
                name
            }
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            Self::Id { name, uuid, flow } => {
                map.insert("name".to_string(), Value::String(name.clone()));
                map.insert("uuid".to_string(), Value::String(uuid.clone()));
                if let Some(flow) = flow {
                    map.insert("flow".to_string(), Value::String(flow.clone()));
                }
            }
            Self::Secret { name, password } => {
                map.insert("name".to_string(), Value::String(name.clone()));
                map.insert("password".to_string(), Value::String(password.clone()));
            }
            Self::KeyedSecret {
                name,
                password,
                method,
            } => {
                map.insert("name".to_string(), Value::String(name.clone()));
                map.insert("password".to_string(), Value::String(password.clone()));
                map.insert("method".to_string(), Value::String(method.clone()));
            }
        }
        Value::Object(map)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let name = map.get("name")?.as_str()?.to_string();
        if let Some(uuid) = map.get("uuid").and_then(Value::as_str) {
            let flow = map
                .get("flow")
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|flow| !flow.is_empty());
            return Some(Self::Id {
                name,
                uuid: uuid.to_string(),
                flow,
            });
        }
        let password = map.get("password")?.as_str()?.to_string();
        if let Some(method) = map.get("method").and_then(Value::as_str) {
            return Some(Self::KeyedSecret {
                name,
                password,
                method: method.to_string(),
            });
        }
        Some(Self::Secret { name, password })
    }
}

impl SingBoxConfig {
    pub fn new(config: &str, exclude: &[String]) -> Result<Self, NodeError> {
        if config.trim().is_empty() {
            return Err(NodeError::ConfigInvalid {
                message: "sing-box config is empty".to_string(),
            });
        }

        let raw: Value = serde_json::from_str(config)?;
        let Value::Object(raw) = raw else {
            return Err(NodeError::ConfigInvalid {
                message: "sing-box config is not a JSON object".to_string(),
            });
        };

        let Some(Value::Array(inbounds)) = raw.get("inbounds") else {
            return Err(NodeError::ConfigInvalid {
                message: "sing-box config has no inbounds section".to_string(),
            });
        };

        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        let entries = inbounds
            .iter()
            .map(|entry| match entry {
                Value::Object(map) => Entry::Inbound(Inbound::new(map.clone(), &exclude)),
                other => Entry::Other(other.clone()),
            })
            .collect();

        Ok(Self { raw, entries })
    }

    /// Full resync: every non-excluded inbound's account list is recomputed
    /// from scratch. Excluded inbounds are left untouched.
    pub fn sync_users(&self, users: &[User]) {
        for inbound in self.inbounds() {
            if inbound.exclude {
                continue;
            }
            inbound.sync_users(users);
        }
    }

    /// Incremental upsert: the user's stale account is removed from every
    /// inbound (excluded ones included), then a fresh account is appended
    /// wherever membership and protocol family both match.
    pub fn upsert_user(&self, user: &User) {
        for inbound in self.inbounds() {
            inbound.upsert_user(user);
        }
    }

    pub fn inbounds(&self) -> impl Iterator<Item = &Inbound> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Inbound(inbound) => Some(inbound),
            Entry::Other(_) => None,
        })
    }

    pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds().find(|inbound| inbound.tag == tag)
    }

    /// Canonical indented JSON of the whole document, with the live account
    /// lists merged back into the tree.
    pub fn to_pretty_json(&self) -> Result<String, NodeError> {
        let mut raw = self.raw.clone();
        let inbounds: Vec<Value> = self
            .entries
            .iter()
            .map(|entry| match entry {
                Entry::Inbound(inbound) => inbound.to_value(),
                Entry::Other(value) => value.clone(),
            })
            .collect();
        raw.insert("inbounds".to_string(), Value::Array(inbounds));
        Ok(serde_json::to_string_pretty(&Value::Object(raw))?)
    }
}

impl Inbound {
    fn new(mut raw: Map<String, Value>, exclude: &HashSet<&str>) -> Self {
        let tag = raw
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let protocol = raw
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| raw.get("protocol").and_then(Value::as_str))
            .unwrap_or_default()
            .to_lowercase();

        sanitize_inbound(&mut raw);

        if !raw.contains_key("users") {
            raw.insert("users".to_string(), Value::Array(Vec::new()));
        }

        Self {
            exclude: exclude.contains(tag.as_str()),
            tag,
            protocol,
            state: Mutex::new(InboundState {
                raw,
                accounts: None,
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn excluded(&self) -> bool {
        self.exclude
    }

    /// Current account list. Untouched inbounds report whatever the supplied
    /// document carried.
    pub fn accounts(&self) -> Vec<Account> {
        let state = self.state();
        match &state.accounts {
            Some(accounts) => accounts.clone(),
            None => parse_accounts(&state.raw),
        }
    }

    fn sync_users(&self, users: &[User]) {
        let accounts = users
            .iter()
            .filter(|user| user.should_attach(&self.tag))
            .filter_map(|user| build_account(&self.protocol, user))
            .collect();
        self.state().accounts = Some(accounts);
    }

    fn upsert_user(&self, user: &User) {
        let mut state = self.state();

        if self.exclude {
            // Stale entries must not survive a membership change, but the
            // synchronizer never takes ownership of an excluded list.
            remove_raw_account(&mut state.raw, &user.email);
            return;
        }

        let accounts = state.materialize_accounts();
        accounts.retain(|account| account.name() != user.email);
        if user.should_attach(&self.tag) {
            if let Some(account) = build_account(&self.protocol, user) {
                accounts.push(account);
            }
        }
    }

    fn to_value(&self) -> Value {
        let state = self.state();
        let mut raw = state.raw.clone();
        if let Some(accounts) = &state.accounts {
            raw.insert(
                "users".to_string(),
                Value::Array(accounts.iter().map(Account::to_value).collect()),
            );
        }
        Value::Object(raw)
    }

    fn state(&self) -> MutexGuard<'_, InboundState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl InboundState {
    fn materialize_accounts(&mut self) -> &mut Vec<Account> {
        if self.accounts.is_none() {
            self.accounts = Some(parse_accounts(&self.raw));
        }
        self.accounts
            .get_or_insert_with(Vec::new)
    }
}

fn parse_accounts(raw: &Map<String, Value>) -> Vec<Account> {
    let Some(Value::Array(users)) = raw.get("users") else {
        return Vec::new();
    };
    users
        .iter()
        .filter_map(|entry| {
            let account = Account::from_value(entry);
            if account.is_none() {
                tracing::warn!(entry = %entry, "dropping unrecognized account entry");
            }
            account
        })
        .collect()
}

/// Field renames the upstream document format needs: a generic
/// `server`/`server_port` pair becomes `listen`/`listen_port` unless the
/// target names are already present; `packet_encoding` is dropped outright.
fn sanitize_inbound(raw: &mut Map<String, Value>) {
    if let Some(server) = raw.remove("server") {
        raw.entry("listen").or_insert(server);
    }
    if let Some(port) = raw.remove("server_port") {
        raw.entry("listen_port").or_insert(port);
    }
    raw.remove("packet_encoding");
}

fn build_account(protocol: &str, user: &User) -> Option<Account> {
    let name = user.email.clone();
    match (protocol, &user.proxy) {
        ("vmess", ProxyCredential::Vmess { id }) => Some(Account::Id {
            name,
            uuid: id.clone(),
            flow: None,
        }),
        ("vless", ProxyCredential::Vless { id, flow }) => Some(Account::Id {
            name,
            uuid: id.clone(),
            flow: flow.clone().filter(|flow| !flow.is_empty()),
        }),
        ("trojan", ProxyCredential::Trojan { password }) => Some(Account::Secret {
            name,
            password: password.clone(),
        }),
        ("shadowsocks", ProxyCredential::Shadowsocks { password, method }) => {
            Some(Account::KeyedSecret {
                name,
                password: ensure_base64_key(password, method),
                method: method.clone(),
            })
        }
        _ => None,
    }
}

fn remove_raw_account(raw: &mut Map<String, Value>, email: &str) {
    if let Some(Value::Array(users)) = raw.get_mut("users") {
        users.retain(|entry| {
            entry
                .get("name")
                .and_then(Value::as_str)
                .map_or(true, |name| name != email)
        });
    }
}
