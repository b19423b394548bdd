use std::sync::Arc;

use anyhow::Error;
use tracing::info;

use crate::{
    config::Config,
    datastore::{Datastore, OpenSearchGateway},
    error::ToUserError,
    ingest::Ingestor,
    lifecycle::IndexLifecycleManager,
    registry::{PgRegistrationStore, RegistrationStore},
};

/// Everything a command needs, wired from the environment config.
pub struct AppContext {
    pub config: Config,
    pub datastore: Arc<dyn Datastore>,
    pub store: Arc<dyn RegistrationStore>,
    pub lifecycle: Arc<IndexLifecycleManager>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let store = PgRegistrationStore::connect(&config.database_url, config.max_pg_connections)
            .await
            .user_error("Could not connect to the registry database, check DATABASE_URL")?;
        store
            .migrate()
            .await
            .user_error("Could not apply registry migrations")?;

        let datastore = OpenSearchGateway::new(
            config.datastore_url.clone(),
            config.datastore_timeout(),
            config.datastore_scroll_size,
        )
        .user_error("Could not build the datastore client")?;
        info!(datastore = %config.datastore_url, "Context ready");

        Ok(Self::from_parts(
            config.clone(),
            Arc::new(datastore),
            Arc::new(store),
        ))
    }

    pub fn from_parts(
        config: Config,
        datastore: Arc<dyn Datastore>,
        store: Arc<dyn RegistrationStore>,
    ) -> Self {
        let lifecycle = Arc::new(IndexLifecycleManager::new(store.clone(), datastore.clone()));
        Self {
            config,
            datastore,
            store,
            lifecycle,
        }
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.datastore.clone(),
            self.lifecycle.clone(),
            self.config.ingest_options(),
        )
    }
}
