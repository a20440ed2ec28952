//! Settings - Configuration and Change Listeners
//!
//! ## Responsibilities
//!
//! - Layered configuration: defaults, then the `home_controller` config
//!   file, then environment variables (highest priority)
//! - Typed getters with zero-value semantics for missing keys
//! - Named change-listener registry, fired sequentially on reload
//! - File watcher that reloads and fires listeners when the config file
//!   changes on disk

use config::{Config, Environment, File};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Directories searched for the `home_controller` config file, in order.
const CONFIG_SEARCH_PATHS: &[&str] = &[
    "/",
    "./",
    "./config",
    "/etc",
    "/home_controller",
    "/home_controller/config",
];

const CONFIG_BASE_NAME: &str = "home_controller";
const CONFIG_EXTENSIONS: &[&str] = &["json", "toml", "yaml", "yml"];

/// Poll period for the config-file watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// A registered change listener. Listeners run sequentially in
/// registration order on the dispatcher task, never in parallel.
pub type Listener = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Settings {
    inner: RwLock<Config>,
    listeners: Mutex<Vec<(String, Listener)>>,
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load configuration from defaults, the first `home_controller` file
    /// found in the search paths, and the environment. A missing or
    /// unreadable file is logged and the process continues with defaults.
    pub fn load() -> Self {
        let config_path = find_config_file();
        match &config_path {
            Some(path) => tracing::info!(path = %path.display(), "config file loaded"),
            None => tracing::error!("unable to read config file: not found in search paths"),
        }
        let inner = build_config(config_path.as_deref());
        Self {
            inner: RwLock::new(inner),
            listeners: Mutex::new(Vec::new()),
            config_path,
        }
    }

    /// Re-read the configuration sources, replacing the current snapshot.
    pub fn reload(&self) {
        let fresh = build_config(self.config_path.as_deref());
        *self.inner.write().expect("settings lock poisoned") = fresh;
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.config().get_bool(key).unwrap_or_default()
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.config().get_int(key).unwrap_or_default()
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.config().get_float(key).unwrap_or_default()
    }

    pub fn get_string(&self, key: &str) -> String {
        self.config().get_string(key).unwrap_or_default()
    }

    pub fn get_string_vec(&self, key: &str) -> Vec<String> {
        self.config().get(key).unwrap_or_default()
    }

    /// Deserialize a config subsection into a typed value.
    pub fn unmarshal_key<T: DeserializeOwned>(&self, key: &str) -> crate::error::Result<T> {
        Ok(self.config().get::<T>(key)?)
    }

    /// Register a named change listener. Re-registering an existing name is
    /// a no-op, which keeps startup wiring idempotent.
    pub async fn register_listener<F>(&self, name: &str, listener: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().await;
        if listeners.iter().any(|(n, _)| n == name) {
            tracing::warn!(name = %name, "config listener already registered");
            return;
        }
        listeners.push((name.to_string(), Arc::new(listener)));
    }

    /// Remove a listener by name. Used by tests and teardown paths.
    pub async fn remove_listener(&self, name: &str) {
        self.listeners.lock().await.retain(|(n, _)| n != name);
    }

    /// Invoke every listener sequentially in registration order. The
    /// registry lock is released first so listeners may themselves consult
    /// settings.
    pub async fn fire_all(&self) {
        let entries: Vec<(String, Listener)> = self.listeners.lock().await.clone();
        for (name, listener) in entries {
            tracing::debug!(listener = %name, "firing config listener");
            listener().await;
        }
    }

    /// Spawn the file watcher: poll the config file's mtime and reload +
    /// fire listeners when it changes.
    pub fn spawn_watcher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let settings = self;
        tokio::spawn(async move {
            let Some(path) = settings.config_path.clone() else {
                tracing::debug!("no config file found, watcher idle");
                return;
            };
            let mut last_modified = file_mtime(&path);
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            loop {
                ticker.tick().await;
                let modified = file_mtime(&path);
                if modified != last_modified {
                    last_modified = modified;
                    tracing::info!(path = %path.display(), "config file changed");
                    settings.reload();
                    settings.fire_all().await;
                }
            }
        })
    }

    fn config(&self) -> std::sync::RwLockReadGuard<'_, Config> {
        self.inner.read().expect("settings lock poisoned")
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn find_config_file() -> Option<PathBuf> {
    for dir in CONFIG_SEARCH_PATHS {
        for ext in CONFIG_EXTENSIONS {
            let candidate = PathBuf::from(dir).join(format!("{}.{}", CONFIG_BASE_NAME, ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn build_config(path: Option<&std::path::Path>) -> Config {
    let mut builder = Config::builder()
        .set_default("broker_uri", "tcp://mqtt")
        .expect("default")
        .set_default("id_base", "home_controller")
        .expect("default")
        .set_default("username", "")
        .expect("default")
        .set_default("password", "")
        .expect("default")
        .set_default("cleansess", false)
        .expect("default")
        .set_default("frequency", 30)
        .expect("default")
        .set_default("occupancy_period_default", 150)
        .expect("default")
        .set_default("min_confidence", 0.5)
        .expect("default")
        .set_default("log_level", "info")
        .expect("default");

    if let Some(path) = path {
        builder = builder.add_source(File::from(path.to_path_buf()).required(false));
    }

    builder = builder.add_source(Environment::default());

    match builder.build() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "unable to build configuration, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bare_settings() -> Settings {
        Settings {
            inner: RwLock::new(build_config(None)),
            listeners: Mutex::new(Vec::new()),
            config_path: None,
        }
    }

    #[test]
    fn defaults_cover_required_keys() {
        let settings = bare_settings();
        assert_eq!(settings.get_string("broker_uri"), "tcp://mqtt");
        assert_eq!(settings.get_i64("frequency"), 30);
        assert_eq!(settings.get_i64("occupancy_period_default"), 150);
        assert!((settings.get_f64("min_confidence") - 0.5).abs() < f64::EPSILON);
        assert!(!settings.get_bool("cleansess"));
    }

    #[test]
    fn missing_keys_resolve_to_zero_values() {
        let settings = bare_settings();
        assert_eq!(settings.get_i64("details_port"), 0);
        assert_eq!(settings.get_string("detection_url"), "");
        assert!(!settings.get_bool("insecure_tls"));
        assert!(settings.get_string_vec("no_such_list").is_empty());
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order_and_dedupe_by_name() {
        let settings = Arc::new(bare_settings());
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let order_a = order.clone();
        settings
            .register_listener("first", move || {
                let order = order_a.clone();
                Box::pin(async move { order.lock().await.push("first") })
            })
            .await;

        let order_b = order.clone();
        settings
            .register_listener("second", move || {
                let order = order_b.clone();
                Box::pin(async move { order.lock().await.push("second") })
            })
            .await;

        // duplicate registration must be a no-op
        let dup_calls = calls.clone();
        settings
            .register_listener("first", move || {
                dup_calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            })
            .await;

        settings.fire_all().await;
        assert_eq!(*order.lock().await, vec!["first", "second"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        settings.remove_listener("first").await;
        settings.fire_all().await;
        assert_eq!(
            *order.lock().await,
            vec!["first", "second", "second"]
        );
    }
}
