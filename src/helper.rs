//! Store factory.
//!
//! [`DatabaseHelper`] builds correctly scoped local and remote [`Database`]s.  It receives
//! the adapters that open physical stores once, at construction, and is otherwise pure
//! construction: it does not keep the stores it builds.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    auth::Profile,
    backend::{AdapterOptions, StoreAdapter, http::HttpAdapter},
    config::{Config, ConfigError, Environment},
    database::{Database, DatabaseOptions, StoreKind},
    error::Result,
    replication::ReplicationOptions,
};

/// Builds local and remote stores.
#[derive(Debug, Clone)]
pub struct DatabaseHelper {
    config: Arc<Config>,
    local: Arc<dyn StoreAdapter>,
    remote: Arc<dyn StoreAdapter>,
}

impl DatabaseHelper {
    /// Creates a factory opening local stores with `local` and remote stores with `remote`.
    pub fn new(
        config: Config,
        local: impl StoreAdapter,
        remote: impl StoreAdapter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            local: Arc::new(local),
            remote: Arc::new(remote),
        }
    }

    /// Creates a factory whose remote stores live on the server at
    /// [`Config::remote_url`].
    pub fn with_http_remote(
        config: Config,
        local: impl StoreAdapter,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let remote = HttpAdapter::new(config.require_remote_url()?.clone());
        Ok(Self::new(config, local, remote))
    }

    /// The configuration stores are built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Name of the local store of a user: `{database}-{username}`, with a `-dev` suffix in
    /// development builds.
    pub fn local_name(&self, profile: &Profile) -> String {
        let name = format!("{}-{}", profile.database, profile.name);
        match self.config.environment {
            Environment::Production => name,
            Environment::Development => format!("{name}-dev"),
        }
    }

    /// Opens the local store `name`.
    ///
    /// With [`Config::wipe_local_database`] set, the store is destroyed first.
    pub async fn local(&self, name: &str) -> Result<Database> {
        if self.config.wipe_local_database {
            warn!(%name, "wiping local store");
            self.local.destroy(name).await?;
        }
        let backend = self.local.open(name, &AdapterOptions::default()).await?;
        debug!(%name, "built local store");
        Ok(Database::new(backend, self.options(StoreKind::Local)))
    }

    /// Opens the remote store `name`, without the setup handshake.
    pub async fn remote(&self, name: &str) -> Result<Database> {
        let backend = self
            .remote
            .open(name, &AdapterOptions { skip_setup: true })
            .await?;
        debug!(%name, "built remote store");
        Ok(Database::new(backend, self.options(StoreKind::Remote)))
    }

    /// Options for a store of the given kind.
    pub fn options(&self, kind: StoreKind) -> DatabaseOptions {
        let config = &self.config;
        let restricted = kind == StoreKind::Remote && config.remote_only;
        DatabaseOptions {
            kind,
            implicit_limit: restricted.then_some(config.remote_find_limit),
            session_timeout: config.session_timeout(),
            debug: config.debug,
            replication: ReplicationOptions {
                batch_size: config.replication_batch_size,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{backend::mem::MemAdapter, document::Document};

    fn profile() -> Profile {
        Profile {
            name: "alice".into(),
            roles: vec![],
            display_name: None,
            database: "assoc".into(),
        }
    }

    #[test]
    fn local_names() {
        let helper = DatabaseHelper::new(Config::default(), MemAdapter::new(), MemAdapter::new());
        assert_eq!(helper.local_name(&profile()), "assoc-alice");

        let config = Config {
            environment: Environment::Development,
            ..Default::default()
        };
        let helper = DatabaseHelper::new(config, MemAdapter::new(), MemAdapter::new());
        assert_eq!(helper.local_name(&profile()), "assoc-alice-dev");
    }

    #[test]
    fn implicit_limit_only_for_remote_only_remotes() {
        let helper = DatabaseHelper::new(Config::default(), MemAdapter::new(), MemAdapter::new());
        assert_eq!(helper.options(StoreKind::Remote).implicit_limit, None);

        let config = Config {
            remote_only: true,
            ..Default::default()
        };
        let helper = DatabaseHelper::new(config, MemAdapter::new(), MemAdapter::new());
        assert_eq!(
            helper.options(StoreKind::Remote).implicit_limit,
            Some(100_000)
        );
        assert_eq!(helper.options(StoreKind::Local).implicit_limit, None);
    }

    #[tokio::test]
    async fn wipes_local_store_when_configured() -> n0_snafu::Result {
        let local = MemAdapter::new();
        let helper = DatabaseHelper::new(Config::default(), local.clone(), MemAdapter::new());
        let db = helper.local("assoc-alice").await?;
        db.put(&mut Document::new("m1").with_type("member")).await?;
        let db = helper.local("assoc-alice").await?;
        assert!(db.get("m1").await.is_ok());

        let config = Config {
            wipe_local_database: true,
            ..Default::default()
        };
        let helper = DatabaseHelper::new(config, local, MemAdapter::new());
        let db = helper.local("assoc-alice").await?;
        assert!(db.get("m1").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn remote_skips_setup() -> n0_snafu::Result {
        let remote = MemAdapter::new();
        let helper = DatabaseHelper::new(Config::default(), MemAdapter::new(), remote.clone());
        assert!(helper.remote("assoc").await.unwrap_err().is_not_found());

        remote.insert(crate::backend::mem::MemBackend::new("assoc"));
        let db = helper.remote("assoc").await?;
        assert_eq!(db.kind(), StoreKind::Remote);
        Ok(())
    }

    #[test]
    fn http_remote_needs_url() {
        let err = DatabaseHelper::with_http_remote(Config::default(), MemAdapter::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let config = Config {
            remote_url: Some("http://127.0.0.1:5984/".parse().unwrap()),
            ..Default::default()
        };
        assert!(DatabaseHelper::with_http_remote(config, MemAdapter::new()).is_ok());
    }
}
