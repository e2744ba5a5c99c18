use std::sync::Arc;

use tracing::{info, instrument};

use super::{BlockStore, DiskBackend};
use crate::config::{BackendConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::remote::{HttpPeerReader, RemoteBackend, S3ObjectStore, S3Settings, bounded};

/// Build the backend `config` describes and check that it is usable.
///
/// Any failure, including the bounded access probe, is reported as
/// [`Error::Config`]. Must be called inside a tokio runtime.
#[instrument(skip_all)]
pub async fn open_backend(config: &StoreConfig) -> Result<Arc<dyn BlockStore>> {
    config.validate()?;

    let backend: Arc<dyn BlockStore> = match &config.backend {
        BackendConfig::Disk { id, path } => Arc::new(DiskBackend::open(id.clone(), path.clone())?),
        BackendConfig::S3 {
            id,
            endpoint,
            region,
            bucket,
            prefix,
            access_key,
            secret_key,
            path_style,
        } => {
            let store = S3ObjectStore::new(S3Settings {
                endpoint,
                region,
                bucket,
                access_key,
                secret_key,
                path_style: *path_style,
                op_timeout: config.coalesce.op_timeout,
                connect_timeout: config.coalesce.connect_timeout,
            })?;
            let mut remote =
                RemoteBackend::new(id.clone(), prefix.clone(), Arc::new(store), config.coalesce.clone());
            if let Some(peer) = &config.peer {
                let reader = HttpPeerReader::new(peer.timeout)?;
                remote = remote.with_peer(Arc::new(reader), peer.local_node.clone());
            }
            Arc::new(remote)
        }
    };

    let probe = bounded(
        "storage access check",
        config.coalesce.connect_timeout,
        backend.verify_access(),
    )
    .await;
    if let Err(err) = probe {
        backend.shutdown().await;
        return Err(Error::Config(format!(
            "{} storage {:?} is not usable: {err}",
            backend.store_type(),
            backend.id()
        )));
    }

    info!(
        store_type = backend.store_type(),
        id = backend.id(),
        "opened block storage"
    );
    Ok(backend)
}
