use super::Output;
use crate::{Error, Payload};
use std::{
    io::ErrorKind,
    marker::PhantomData,
    path::PathBuf,
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

/// Suffix of the sibling file written before it is renamed over the target.
const TEMPORARY_SUFFIX: &str = ".tmp";

/// A JSON array stored in a single file.
///
/// Rewrites go to a temporary sibling that is synced and then renamed over the target, so a crash
/// mid-write leaves either the previous contents or the new contents (never a mix).
pub struct Json<P> {
    path: PathBuf,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Json<P> {
    /// Store payloads at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _payload: PhantomData,
        }
    }

    fn temporary(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(TEMPORARY_SUFFIX);
        PathBuf::from(name)
    }

    fn io(&self, source: std::io::Error) -> Error {
        Error::Io {
            target: self.target_name(),
            source,
        }
    }

    fn target_name(&self) -> String {
        self.path.display().to_string()
    }
}

impl<P> Clone for Json<P> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<P: Payload> Output<P> for Json<P> {
    fn target(&self) -> String {
        self.target_name()
    }

    async fn load(&self) -> Result<Vec<P>, Error> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "output missing, treating as empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.io(err)),
        };
        serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt {
            target: self.target_name(),
            source,
        })
    }

    async fn replace(&self, payloads: Vec<P>) -> Result<(), Error> {
        let bytes = serde_json::to_vec(&payloads).map_err(|source| Error::Corrupt {
            target: self.target_name(),
            source,
        })?;

        // Write and sync the replacement before swapping it in
        let temporary = self.temporary();
        let mut file = fs::File::create(&temporary)
            .await
            .map_err(|err| self.io(err))?;
        file.write_all(&bytes).await.map_err(|err| self.io(err))?;
        file.sync_all().await.map_err(|err| self.io(err))?;
        drop(file);
        fs::rename(&temporary, &self.path)
            .await
            .map_err(|err| self.io(err))?;
        debug!(path = ?self.path, payloads = payloads.len(), "replaced output");
        Ok(())
    }
}
