use crate::client::Client;
use crate::cluster::LocalCluster;
use crate::config::Config;
use crate::db::Db;
use crate::errors::SurveyError;
use std::path::PathBuf;
use std::sync::Arc;
use survey_zk::groth16::{deserialize_keys, serialize_pk, setup_keys, RangeKeys};
use tokio::sync::OnceCell;

use rand::rngs::OsRng;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub cluster: Arc<LocalCluster>,
    pub client: Arc<Client>,
}

impl AppState {
    pub fn new(db: Db, config: Config, cluster: LocalCluster, client: Client) -> Self {
        Self {
            db,
            config: Arc::new(config),
            cluster: Arc::new(cluster),
            client: Arc::new(client),
        }
    }
}

/// Lazily initialised Groth16 keys for the range circuit, shared by provers and verifiers.
#[derive(Clone, Default)]
pub struct ProofKeys {
    data_dir: Option<PathBuf>,
    keys: Arc<OnceCell<Arc<RangeKeys>>>,
}

impl ProofKeys {
    /// Keys are persisted under `data_dir/keys` when a directory is given.
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            keys: Arc::new(OnceCell::new()),
        }
    }

    /// Already generated keys.
    pub fn with_keys(keys: RangeKeys) -> Self {
        Self {
            data_dir: None,
            keys: Arc::new(OnceCell::new_with(Some(Arc::new(keys)))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.keys.initialized()
    }

    /// Load or generate the keys.
    ///
    /// This runs the trusted setup (prototype) on first use.
    pub async fn ensure(&self) -> Result<Arc<RangeKeys>, SurveyError> {
        let data_dir = self.data_dir.clone();

        self.keys
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || load_or_setup(data_dir)).await?
            })
            .await
            .cloned()
    }
}

fn load_or_setup(data_dir: Option<PathBuf>) -> Result<Arc<RangeKeys>, SurveyError> {
    let pk_path = match &data_dir {
        Some(dir) => {
            let keys_dir = dir.join("keys");
            std::fs::create_dir_all(&keys_dir).map_err(|e| SurveyError::Internal(e.to_string()))?;
            Some(keys_dir.join("range_pk.bin"))
        }
        None => None,
    };

    if let Some(path) = pk_path.as_ref().filter(|p| p.exists()) {
        let bytes = std::fs::read(path).map_err(|e| SurveyError::Internal(e.to_string()))?;
        tracing::info!(path = %path.display(), "range keys loaded");
        return Ok(Arc::new(deserialize_keys(&bytes)?));
    }

    // Trusted setup randomness (prototype).
    //
    // IMPORTANT: In production, use MPC setup or a transparent proof system.
    let mut rng = OsRng;
    let keys = setup_keys(&mut rng)?;

    if let Some(path) = pk_path {
        std::fs::write(&path, serialize_pk(&keys.pk)?).map_err(|e| SurveyError::Internal(e.to_string()))?;
        tracing::info!(path = %path.display(), "range keys generated");
    }
    Ok(Arc::new(keys))
}
