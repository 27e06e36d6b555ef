use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use url::Url;

use crate::error::{AuthError, AuthResult};
use crate::http::{GetJsonClient, ProbeClient};
use crate::storage::KeyValueStore;
use crate::urls::{
    ensure_trailing_slash, is_absolute_url, join_path, strip_trailing_slash, ServerUrls,
};

pub const INSTANCE_CACHE_KEY: &str = "instanceinfo";

/// A resolved instance, as cached under `instanceinfo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub api: String,
    pub cdn: String,
    pub gateway: String,
    pub wellknown: String,
    pub login: String,
    /// What the user typed, used to re-populate the instance input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl InstanceInfo {
    pub fn server_urls(&self) -> ServerUrls {
        ServerUrls {
            api: self.api.clone(),
            cdn: self.cdn.clone(),
            gateway: self.gateway.clone(),
            wellknown: self.wellknown.clone(),
            login: self.login.clone(),
        }
    }

    pub fn input_value(&self) -> &str {
        self.value.as_deref().unwrap_or(&self.wellknown)
    }
}

/// Pre-resolved endpoints carried by the instance feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceUrls {
    pub api: String,
    pub cdn: String,
    pub gateway: String,
    pub wellknown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
}

impl InstanceUrls {
    fn into_info(self) -> InstanceInfo {
        let login = self.login.unwrap_or_else(|| self.api.clone());
        InstanceInfo {
            api: self.api,
            cdn: self.cdn,
            gateway: self.gateway,
            wellknown: self.wellknown,
            login,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
    #[serde(rename = "URLs", default)]
    pub urls: Option<InstanceUrls>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceListing {
    pub name: String,
    pub label: String,
    pub enabled: bool,
}

/// Lookup tables built from the instance feed.
#[derive(Debug, Default)]
pub struct InstanceDirectory {
    shortcuts: HashMap<String, String>,
    candidates: HashMap<String, InstanceUrls>,
    listings: Vec<InstanceListing>,
}

impl InstanceDirectory {
    pub fn from_feed(entries: Vec<FeedEntry>) -> Self {
        let mut directory = Self::default();
        for entry in entries {
            let enabled = entry.url.is_some() || entry.urls.is_some();
            match (entry.url, entry.urls) {
                (Some(url), urls) => {
                    directory.shortcuts.insert(entry.name.clone(), url.clone());
                    if let Some(urls) = urls {
                        directory.candidates.insert(url, urls);
                    }
                }
                (None, Some(urls)) => {
                    directory.candidates.insert(entry.name.clone(), urls);
                }
                (None, None) => {}
            }
            let label = entry.description.unwrap_or_else(|| entry.name.clone());
            directory.listings.push(InstanceListing {
                name: entry.name,
                label,
                enabled,
            });
        }
        directory
    }

    pub fn shortcut(&self, name: &str) -> Option<&str> {
        self.shortcuts.get(name).map(String::as_str)
    }

    pub fn candidate(&self, name: &str) -> Option<&InstanceUrls> {
        self.candidates.get(name)
    }

    pub fn listings(&self) -> &[InstanceListing] {
        &self.listings
    }

    /// Suggested instance when the user has not typed anything yet.
    pub fn default_instance(&self) -> Option<&str> {
        self.listings.first().map(|listing| listing.name.as_str())
    }
}

/// Reads the feed from a local file or an `http(s)` URL.
pub fn load_instance_feed(source: &str, get_json: &GetJsonClient) -> AuthResult<Vec<FeedEntry>> {
    let root = if source.starts_with("http://") || source.starts_with("https://") {
        get_json(source)?
    } else {
        let data = fs::read_to_string(source).map_err(|err| {
            AuthError::storage(format!("failed to read instance feed {}: {}", source, err))
        })?;
        serde_json::from_str::<Value>(&data).map_err(|err| {
            AuthError::storage(format!("failed to parse instance feed {}: {}", source, err))
        })?
    };
    serde_json::from_value::<Vec<FeedEntry>>(root)
        .map_err(|err| AuthError::storage(format!("invalid instance feed {}: {}", source, err)))
}

pub struct InstanceResolver {
    directory: Arc<InstanceDirectory>,
    protocol: String,
    get_json: GetJsonClient,
    probe: ProbeClient,
}

impl InstanceResolver {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        protocol: impl Into<String>,
        get_json: GetJsonClient,
        probe: ProbeClient,
    ) -> Self {
        Self {
            directory,
            protocol: protocol.into(),
            get_json,
            probe,
        }
    }

    pub fn directory(&self) -> &InstanceDirectory {
        &self.directory
    }

    pub fn resolve(&self, input: &str) -> AuthResult<InstanceInfo> {
        let input = input.trim();
        let mut target = input.to_string();
        let mut probed: Option<&str> = None;

        if !is_absolute_url(input) {
            if let Some(url) = self.directory.shortcut(input) {
                tracing::debug!(input, url, "instance shortcut");
                target = url.to_string();
            } else if self.directory.candidate(input).is_some() {
                probed = Some(input);
                if let Some(info) = self.probe_candidate(input) {
                    return Ok(info);
                }
            }
        }

        let base = discovery_base(&target)?;
        match self.discover(&base) {
            Ok(info) => Ok(info),
            Err(err) => {
                tracing::warn!(input, base = %base, error = %err, "instance discovery failed");
                let mut tried: Vec<&str> = probed.into_iter().collect();
                [base.as_str(), strip_trailing_slash(&base), input]
                    .into_iter()
                    .filter(|key| {
                        if tried.contains(key) {
                            return false;
                        }
                        tried.push(*key);
                        true
                    })
                    .find_map(|key| self.probe_candidate(key))
                    .ok_or_else(|| AuthError::NotFound(input.to_string()))
            }
        }
    }

    fn discover(&self, base: &str) -> AuthResult<InstanceInfo> {
        let discovery_url = format!("{}.well-known/{}", base, self.protocol);
        let discovered = (self.get_json)(&discovery_url)
            .map_err(|err| AuthError::DiscoveryUnreachable(err.to_string()))?;
        let api = string_field(&discovered, "api", &discovery_url)?;

        let policy_url = policy_url(&api)?;
        let policy = (self.get_json)(&policy_url)
            .map_err(|err| AuthError::DiscoveryUnreachable(err.to_string()))?;

        let login = Url::parse(base)
            .map_err(|err| AuthError::invalid_url(base, err))?
            .to_string();
        Ok(InstanceInfo {
            api: string_field(&policy, "apiEndpoint", &policy_url)?,
            gateway: string_field(&policy, "gateway", &policy_url)?,
            cdn: string_field(&policy, "cdn", &policy_url)?,
            wellknown: base.to_string(),
            login,
            value: None,
        })
    }

    fn probe_candidate(&self, key: &str) -> Option<InstanceInfo> {
        let candidate = self.directory.candidate(key)?;
        let ping_url = join_path(&candidate.api, "ping");
        if (self.probe)(&ping_url) {
            tracing::debug!(key, ping_url = %ping_url, "cached instance is alive");
            Some(candidate.clone().into_info())
        } else {
            tracing::debug!(key, ping_url = %ping_url, "cached instance did not answer");
            None
        }
    }
}

/// Absolute, slash-terminated base URL discovery is run against.
fn discovery_base(target: &str) -> AuthResult<String> {
    let with_scheme = if target.contains("://") {
        target.to_string()
    } else {
        format!("https://{}", target)
    };
    let base = ensure_trailing_slash(&with_scheme);
    Url::parse(&base).map_err(|err| AuthError::invalid_url(target, err))?;
    Ok(base)
}

fn policy_url(api: &str) -> AuthResult<String> {
    let parsed = Url::parse(api).map_err(|err| {
        AuthError::DiscoveryUnreachable(format!("bad api URL {}: {}", api, err))
    })?;
    let mut base = strip_trailing_slash(api).to_string();
    if !parsed.path().contains("api") {
        base.push_str("/api");
    }
    Ok(format!("{}/policies/instance/domains", base))
}

fn string_field(root: &Value, name: &str, source: &str) -> AuthResult<String> {
    root.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AuthError::DiscoveryUnreachable(format!("{} has no {}", source, name)))
}

/// Single-slot cache of the last instance that checked out.
pub struct InstanceCache {
    store: Arc<dyn KeyValueStore>,
}

impl InstanceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> AuthResult<Option<InstanceInfo>> {
        let Some(raw) = self.store.get(INSTANCE_CACHE_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str::<InstanceInfo>(&raw).map(Some).map_err(|err| {
            AuthError::storage(format!("failed to parse {}: {}", INSTANCE_CACHE_KEY, err))
        })
    }

    pub fn save(&self, info: &InstanceInfo) -> AuthResult<()> {
        let data = serde_json::to_string(info).map_err(|err| {
            AuthError::storage(format!("failed to encode {}: {}", INSTANCE_CACHE_KEY, err))
        })?;
        self.store.set(INSTANCE_CACHE_KEY, &data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Waiting,
    Checking,
    Valid,
    Invalid,
}

impl CheckStatus {
    pub fn message(self) -> &'static str {
        match self {
            Self::Waiting => "Waiting to check Instance",
            Self::Checking => "Checking Instance",
            Self::Valid => "Instance is all good",
            Self::Invalid => "Invalid Instance, try again",
        }
    }
}

/// Resolves `input` and, on success, makes it the cached instance.
pub fn check_instance(
    resolver: &InstanceResolver,
    cache: &InstanceCache,
    input: &str,
) -> AuthResult<InstanceInfo> {
    let mut info = resolver.resolve(input)?;
    info.value = Some(input.to_string());
    cache.save(&info)?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeNetwork {
        responses: Arc<Mutex<HashMap<String, Value>>>,
        alive: Arc<Mutex<HashSet<String>>>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl FakeNetwork {
        fn respond(&self, url: &str, body: Value) -> &Self {
            self.responses
                .lock()
                .expect("responses")
                .insert(url.to_string(), body);
            self
        }

        fn alive(&self, url: &str) -> &Self {
            self.alive.lock().expect("alive").insert(url.to_string());
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("requests").clone()
        }

        fn resolver(&self, feed: Value) -> InstanceResolver {
            let entries: Vec<FeedEntry> = serde_json::from_value(feed).expect("feed");
            let get_network = self.clone();
            let probe_network = self.clone();
            InstanceResolver::new(
                Arc::new(InstanceDirectory::from_feed(entries)),
                "spacebar",
                Arc::new(move |url| {
                    get_network
                        .requests
                        .lock()
                        .expect("requests")
                        .push(format!("GET {}", url));
                    get_network
                        .responses
                        .lock()
                        .expect("responses")
                        .get(url)
                        .cloned()
                        .ok_or_else(|| AuthError::Http(format!("GET {} returned 404", url)))
                }),
                Arc::new(move |url| {
                    probe_network
                        .requests
                        .lock()
                        .expect("requests")
                        .push(format!("PING {}", url));
                    probe_network.alive.lock().expect("alive").contains(url)
                }),
            )
        }
    }

    fn local_urls() -> Value {
        json!({
            "api": "http://localhost:3001/api",
            "cdn": "http://localhost:3001",
            "gateway": "ws://localhost:3001",
            "wellknown": "http://localhost:3001/"
        })
    }

    #[test]
    fn bare_domain_runs_well_known_and_policy_discovery() {
        let network = FakeNetwork::default();
        network
            .respond(
                "https://example.org/.well-known/spacebar",
                json!({"api": "https://example.org/api"}),
            )
            .respond(
                "https://example.org/api/policies/instance/domains",
                json!({
                    "apiEndpoint": "https://example.org/api",
                    "gateway": "wss://example.org",
                    "cdn": "https://cdn.example.org"
                }),
            );

        let info = network
            .resolver(json!([]))
            .resolve("example.org")
            .expect("resolve");

        assert_eq!(
            info,
            InstanceInfo {
                api: "https://example.org/api".to_string(),
                cdn: "https://cdn.example.org".to_string(),
                gateway: "wss://example.org".to_string(),
                wellknown: "https://example.org/".to_string(),
                login: "https://example.org/".to_string(),
                value: None,
            }
        );
    }

    #[test]
    fn policy_lookup_inserts_api_segment_when_missing() {
        let network = FakeNetwork::default();
        network
            .respond(
                "https://chat.example/.well-known/spacebar",
                json!({"api": "https://backend.chat.example"}),
            )
            .respond(
                "https://backend.chat.example/api/policies/instance/domains",
                json!({
                    "apiEndpoint": "https://backend.chat.example/api",
                    "gateway": "wss://gw.chat.example",
                    "cdn": "https://cdn.chat.example"
                }),
            );

        let info = network
            .resolver(json!([]))
            .resolve("https://chat.example")
            .expect("resolve");
        assert_eq!(info.api, "https://backend.chat.example/api");
        assert_eq!(info.wellknown, "https://chat.example/");
    }

    #[test]
    fn shortcut_name_is_replaced_by_its_url_before_discovery() {
        let network = FakeNetwork::default();
        network
            .respond(
                "https://spacebar.chat/.well-known/spacebar",
                json!({"api": "https://old.server.spacebar.chat/api"}),
            )
            .respond(
                "https://old.server.spacebar.chat/api/policies/instance/domains",
                json!({
                    "apiEndpoint": "https://old.server.spacebar.chat/api",
                    "gateway": "wss://gateway.old.server.spacebar.chat",
                    "cdn": "https://cdn.old.server.spacebar.chat"
                }),
            );

        let resolver =
            network.resolver(json!([{"name": "Spacebar", "URL": "https://spacebar.chat"}]));
        let info = resolver.resolve("Spacebar").expect("resolve");

        assert_eq!(info.wellknown, "https://spacebar.chat/");
        assert_eq!(
            network.requests()[0],
            "GET https://spacebar.chat/.well-known/spacebar"
        );
    }

    #[test]
    fn live_candidate_skips_discovery_and_fills_login_from_api() {
        let network = FakeNetwork::default();
        network.alive("http://localhost:3001/api/ping");

        let resolver = network.resolver(json!([{"name": "Local", "URLs": local_urls()}]));
        let info = resolver.resolve("Local").expect("resolve");

        assert_eq!(info.api, "http://localhost:3001/api");
        assert_eq!(info.login, "http://localhost:3001/api");
        assert_eq!(network.requests(), vec!["PING http://localhost:3001/api/ping"]);
    }

    #[test]
    fn dead_candidate_falls_through_and_reports_not_found() {
        let network = FakeNetwork::default();
        let resolver = network.resolver(json!([{"name": "Local", "URLs": local_urls()}]));

        let err = resolver.resolve("Local").expect_err("should not resolve");

        assert!(matches!(err, AuthError::NotFound(ref input) if input == "Local"));
        let requests = network.requests();
        assert_eq!(requests[0], "PING http://localhost:3001/api/ping");
        assert_eq!(requests[1], "GET https://Local/.well-known/spacebar");
        let pings = requests
            .iter()
            .filter(|request| request.starts_with("PING"))
            .count();
        assert_eq!(pings, 1);
    }

    #[test]
    fn policy_failure_falls_back_to_candidate_keyed_by_url() {
        let network = FakeNetwork::default();
        network
            .respond(
                "https://main.example/.well-known/spacebar",
                json!({"api": "https://main.example/api"}),
            )
            .alive("https://main.example/api/ping");

        let resolver = network.resolver(json!([{
            "name": "Main",
            "URL": "https://main.example/",
            "URLs": {
                "api": "https://main.example/api/",
                "cdn": "https://cdn.main.example",
                "gateway": "wss://gateway.main.example",
                "wellknown": "https://main.example/",
                "login": "https://main.example/"
            }
        }]));
        let info = resolver.resolve("Main").expect("resolve");

        assert_eq!(info.login, "https://main.example/");
        assert_eq!(info.gateway, "wss://gateway.main.example");
        assert!(network
            .requests()
            .contains(&"PING https://main.example/api/ping".to_string()));
    }

    #[test]
    fn unreachable_well_known_falls_back_to_live_candidate() {
        let network = FakeNetwork::default();
        network.alive("https://main.example/api/ping");

        let resolver = network.resolver(json!([{
            "name": "Main",
            "URL": "https://main.example/",
            "URLs": {
                "api": "https://main.example/api",
                "cdn": "https://cdn.main.example",
                "gateway": "wss://gateway.main.example",
                "wellknown": "https://main.example/"
            }
        }]));
        let info = resolver.resolve("https://main.example").expect("resolve");

        assert_eq!(info.gateway, "wss://gateway.main.example");
        assert_eq!(info.login, "https://main.example/api");
        assert_eq!(
            network.requests(),
            vec![
                "GET https://main.example/.well-known/spacebar",
                "PING https://main.example/api/ping"
            ]
        );
    }

    #[test]
    fn dead_candidate_is_pinged_once_when_keys_repeat() {
        let network = FakeNetwork::default();
        let resolver = network.resolver(json!([{
            "name": "https://h/",
            "URLs": {
                "api": "https://h/api",
                "cdn": "https://cdn.h",
                "gateway": "wss://h",
                "wellknown": "https://h/"
            }
        }]));

        let err = resolver.resolve("https://h/").expect_err("dead candidate");

        assert!(matches!(err, AuthError::NotFound(_)));
        let pings: Vec<String> = network
            .requests()
            .into_iter()
            .filter(|request| request.starts_with("PING"))
            .collect();
        assert_eq!(pings, vec!["PING https://h/api/ping"]);
    }

    #[test]
    fn unreachable_unknown_instance_is_not_found() {
        let network = FakeNetwork::default();
        let err = network
            .resolver(json!([]))
            .resolve("nowhere.invalid")
            .expect_err("not found");
        assert!(matches!(err, AuthError::NotFound(_)));
    }

    #[test]
    fn feed_builds_shortcuts_candidates_and_labels() {
        let entries: Vec<FeedEntry> = serde_json::from_value(json!([
            {
                "name": "Spacebar",
                "description": "The official instance",
                "URL": "https://spacebar.chat"
            },
            {"name": "Local", "URLs": local_urls()},
            {"name": "Retired"}
        ]))
        .expect("feed");
        let directory = InstanceDirectory::from_feed(entries);

        assert_eq!(directory.default_instance(), Some("Spacebar"));
        assert_eq!(directory.shortcut("Spacebar"), Some("https://spacebar.chat"));
        assert!(directory.candidate("Local").is_some());
        assert!(directory.shortcut("Retired").is_none());
        let labels: Vec<(&str, bool)> = directory
            .listings()
            .iter()
            .map(|listing| (listing.label.as_str(), listing.enabled))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("The official instance", true),
                ("Local", true),
                ("Retired", false)
            ]
        );
    }

    #[test]
    fn check_instance_caches_result_with_typed_value() {
        let network = FakeNetwork::default();
        network.alive("http://localhost:3001/api/ping");
        let resolver = network.resolver(json!([{"name": "Local", "URLs": local_urls()}]));
        let cache = InstanceCache::new(Arc::new(MemoryKeyValueStore::default()));

        check_instance(&resolver, &cache, "Local").expect("check");

        let cached = cache.load().expect("load").expect("cached info");
        assert_eq!(cached.value.as_deref(), Some("Local"));
        assert_eq!(cached.input_value(), "Local");
        assert_eq!(cached.api, "http://localhost:3001/api");
    }

    #[test]
    fn failed_check_leaves_cache_untouched() {
        let network = FakeNetwork::default();
        let resolver = network.resolver(json!([]));
        let cache = InstanceCache::new(Arc::new(MemoryKeyValueStore::default()));

        assert!(check_instance(&resolver, &cache, "nowhere.invalid").is_err());
        assert!(cache.load().expect("load").is_none());
        assert_eq!(CheckStatus::Invalid.message(), "Invalid Instance, try again");
    }

    #[test]
    fn feed_is_read_from_file() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let path = temp.path().join("instances.json");
        fs::write(&path, r#"[{"name": "Spacebar", "URL": "https://spacebar.chat"}]"#)
            .expect("write feed");
        let never: GetJsonClient =
            Arc::new(|url| Err(AuthError::Http(format!("no network: {}", url))));

        let entries =
            load_instance_feed(path.to_str().expect("utf8 path"), &never).expect("load feed");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url.as_deref(), Some("https://spacebar.chat"));
    }
}
