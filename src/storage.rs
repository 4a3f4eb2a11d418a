//! Durable storage for Iceberg warehouses.
//!
//! All table files (data, manifests, manifest lists and metadata) are written
//! exactly once: [`IcebergStorage::write_once`] never replaces an existing object.
use std::sync::Arc;
use std::str::FromStr;
use std::collections::HashMap;

use url::Url;
use bytes::Bytes;
use object_store::{
    ObjectStore,
    PutMode,
    Error as ObjectStoreError,
    local::LocalFileSystem,
    memory::InMemory,
    aws::{AmazonS3Builder, AmazonS3ConfigKey, S3ConditionalPut},
    azure::{AzureConfigKey, MicrosoftAzureBuilder},
    path::{Path, PathPart},
};
use futures::StreamExt;
use tracing::debug;

use crate::{IcebergResult, IcebergError};

/// Object storage for a warehouse, rooted at the warehouse location.
///
/// Paths handed to and returned from `IcebergStorage` are [`IcebergPath`]s relative
/// to the warehouse root. Files referenced from table metadata use absolute URIs,
/// see [`IcebergStorage::to_uri`] and [`IcebergStorage::create_path_from_url`].
#[derive(Debug)]
pub struct IcebergStorage {
    // URI of the warehouse root without a trailing slash, e.g.
    // file:///path/to/warehouse or s3://bucket-name/warehouse
    location: String,
    // Prefix of the warehouse root inside the object store.
    prefix: Option<Path>,
    object_store: Arc<dyn ObjectStore>,
}

impl IcebergStorage {
    /// Ensures a url to a local directory is valid, normalizes it
    /// and creates missing directories.
    fn setup_local_path(location: &Url) -> IcebergResult<std::path::PathBuf> {
        let path = location.to_file_path().map_err(|_| {
            IcebergError::InvalidTableLocation(format!(
                "Invalid local warehouse location: {}", location
            ))
        })?;

        if path.exists() {
            if !path.is_dir() {
                return Err(IcebergError::InvalidTableLocation(format!(
                    "Warehouse location exists, but is not a directory: {}", location
                )));
            }
        } else {
            std::fs::create_dir_all(&path).map_err(|_| {
                IcebergError::InvalidTableLocation(format!(
                    "Could not create local directory: {}", path.display()
                ))
            })?;
        }

        std::fs::canonicalize(path).map_err(|_| {
            IcebergError::InvalidTableLocation(format!(
                "Failed to canonicalize location: {}", location
            ))
        })
    }

    /// Initializes storage from a warehouse URL and storage options.
    ///
    /// The URL scheme selects the backing object store:
    /// * `file:///path/to/warehouse` - the local file system,
    /// * `s3://bucket/warehouse` - Amazon S3, configured from `storage_options`
    ///   (e.g. `"aws_access_key_id"`, `"aws_secret_access_key"`, `"aws_region"`),
    /// * `abfss://container@account.dfs.core.windows.net/warehouse` or
    ///   `az://container/warehouse` - Azure Data Lake Storage Gen2, configured from
    ///   `storage_options` (e.g. `"azure_storage_account_name"`,
    ///   `"azure_storage_account_key"`),
    /// * `memory://name` - a process-local in-memory store, for tests.
    pub fn from_url(
        location: &str,
        storage_options: &HashMap<String, String>
    ) -> IcebergResult<Self> {
        let url = Url::parse(location).map_err(|e| {
            IcebergError::InvalidTableLocation(format!(
                "Invalid warehouse url {}: {}", location, e
            ))
        })?;

        match url.scheme() {
            "file" => {
                let path = Self::setup_local_path(&url)?;
                let object_store = LocalFileSystem::new_with_prefix(&path)?;
                let url = Url::from_directory_path(&path).map_err(|_| {
                    IcebergError::InvalidTableLocation(format!(
                        "Directory path must be absolute: {}", path.display()
                    ))
                })?;

                Ok(Self {
                    location: url.as_str().trim_end_matches('/').to_string(),
                    prefix: None,
                    object_store: Arc::new(object_store),
                })
            },
            "s3" => {
                let bucket = url.host_str()
                    .ok_or_else(|| {
                        IcebergError::InvalidTableLocation(format!(
                            "Missing S3 bucket name: {}", location
                        ))
                    })?;

                // Create-only puts need a conditional put mechanism on S3.
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch);
                for (key, value) in storage_options {
                    let key = AmazonS3ConfigKey::from_str(key).map_err(|e| {
                        IcebergError::ConfigError(format!("invalid S3 option {key}: {e}"))
                    })?;
                    builder = builder.with_config(key, value);
                }

                Ok(Self {
                    location: format!("s3://{}{}", bucket, url.path().trim_end_matches('/')),
                    prefix: Self::path_prefix(url.path()),
                    object_store: Arc::new(builder.build()?),
                })
            },
            "abfss" | "az" => {
                let container = match url.scheme() {
                    "az" => url.host_str(),
                    _ => Some(url.username()).filter(|name| !name.is_empty()),
                };
                let container = container.ok_or_else(|| {
                    IcebergError::InvalidTableLocation(format!(
                        "Missing Azure container name: {}", location
                    ))
                })?;
                let authority = match url.scheme() {
                    "az" => container.to_string(),
                    _ => format!("{}@{}", container, url.host_str().unwrap_or_default()),
                };

                let mut builder = MicrosoftAzureBuilder::new().with_url(location);
                for (key, value) in storage_options {
                    let key = AzureConfigKey::from_str(key).map_err(|e| {
                        IcebergError::ConfigError(format!("invalid Azure option {key}: {e}"))
                    })?;
                    builder = builder.with_config(key, value);
                }

                Ok(Self {
                    location: format!(
                        "{}://{}{}",
                        url.scheme(),
                        authority,
                        url.path().trim_end_matches('/')
                    ),
                    prefix: Self::path_prefix(url.path()),
                    object_store: Arc::new(builder.build()?),
                })
            },
            "memory" => {
                let name = url.host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| {
                        IcebergError::InvalidTableLocation(format!(
                            "Missing in-memory warehouse name: {}", location
                        ))
                    })?;

                Ok(Self {
                    location: format!("memory://{}{}", name, url.path().trim_end_matches('/')),
                    prefix: Self::path_prefix(url.path()),
                    object_store: Arc::new(InMemory::new()),
                })
            },
            scheme => {
                Err(IcebergError::InvalidTableLocation(format!(
                    "URL scheme {} not supported for Iceberg warehouses", scheme
                )))
            }
        }
    }

    /// Wraps an existing object store holding the warehouse at `location`.
    ///
    /// The store must support create-only puts (`PutMode::Create`), see
    /// [`write_once`](Self::write_once).
    pub fn from_object_store(
        location: &str,
        object_store: Arc<dyn ObjectStore>
    ) -> IcebergResult<Self> {
        let url = Url::parse(location).map_err(|e| {
            IcebergError::InvalidTableLocation(format!(
                "Invalid warehouse url {}: {}", location, e
            ))
        })?;

        Ok(Self {
            location: location.trim_end_matches('/').to_string(),
            prefix: Self::path_prefix(url.path()),
            object_store,
        })
    }

    fn path_prefix(url_path: &str) -> Option<Path> {
        let trimmed = url_path.trim_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(Path::from(trimmed))
        }
    }

    /// URI of the warehouse root, without a trailing slash.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Converts a warehouse path to the object store path.
    fn to_object_store_path(&self, path: &IcebergPath) -> Path {
        match &self.prefix {
            Some(prefix) => prefix.parts().chain(path.inner.parts()).collect(),
            None => path.inner.clone(),
        }
    }

    /// Converts an object store path to a warehouse path.
    fn to_iceberg_path(&self, path: Path) -> IcebergResult<IcebergPath> {
        match &self.prefix {
            Some(prefix) => {
                path.prefix_match(prefix)
                    .map(|parts| IcebergPath { inner: Path::from_iter(parts) })
                    .ok_or_else(|| IcebergError::InvalidPath {
                        source: object_store::path::Error::PrefixMismatch {
                            path: path.to_string(),
                            prefix: prefix.to_string(),
                        }
                    })
            },
            None => Ok(IcebergPath { inner: path }),
        }
    }

    /// Writes a new object.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::FileAlreadyExists`] if an object already exists at `path`.
    ///   The existing object is left untouched.
    /// * [`IcebergError::Unsupported`] if the object store can't put objects
    ///   conditionally. Nothing is written.
    pub async fn write_once(&self, path: &IcebergPath, bytes: Bytes) -> IcebergResult<()> {
        let location = self.to_object_store_path(path);
        let size = bytes.len();

        let result = self.object_store
            .put_opts(&location, bytes.into(), PutMode::Create.into())
            .await;

        match result {
            Ok(_) => {},
            Err(ObjectStoreError::AlreadyExists { .. }) => {
                return Err(IcebergError::FileAlreadyExists { path: self.to_uri(path) });
            },
            Err(ObjectStoreError::NotImplemented) => {
                return Err(IcebergError::Unsupported(format!(
                    "object store {} lacks create-only puts", self.object_store
                )));
            },
            Err(e) => return Err(e.into()),
        }

        debug!(path = %self.to_uri(path), size, "wrote file");
        Ok(())
    }

    /// Reads a whole object.
    pub async fn read(&self, path: &IcebergPath) -> IcebergResult<Bytes> {
        let result = self.object_store
            .get(&self.to_object_store_path(path))
            .await?;

        Ok(result.bytes().await?)
    }

    pub async fn exists(&self, path: &IcebergPath) -> IcebergResult<bool> {
        match self.object_store.head(&self.to_object_store_path(path)).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all objects under `prefix`, recursively.
    pub async fn list(
        &self,
        prefix: &IcebergPath
    ) -> IcebergResult<Vec<IcebergObjectMeta>> {
        let prefix = self.to_object_store_path(prefix);
        let mut stream = self.object_store.list(Some(&prefix));

        let mut objects: Vec<IcebergObjectMeta> = Vec::new();

        while let Some(obj_meta) = stream.next().await {
            // Objects removed while listing are skipped.
            let obj_meta = match obj_meta {
                Ok(meta) => meta,
                Err(ObjectStoreError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };

            objects.push(IcebergObjectMeta {
                location: self.to_iceberg_path(obj_meta.location)?,
                last_modified: obj_meta.last_modified,
                size: obj_meta.size
            });
        }

        Ok(objects)
    }

    /// Creates the warehouse path of an object from its absolute URI.
    pub fn create_path_from_url(&self, url: &str) -> IcebergResult<IcebergPath> {
        let relative = url.strip_prefix(&self.location)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                IcebergError::InvalidTableLocation(format!(
                    "Object {} is not in the warehouse at {}", url, self.location
                ))
            })?;

        Ok(IcebergPath { inner: Path::parse(relative)? })
    }

    /// Returns the absolute URI of a warehouse path.
    pub fn to_uri(&self, path: &IcebergPath) -> String {
        format!("{}/{}", self.location, path.as_ref())
    }
}

/// Represents a path to a file in the warehouse, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IcebergPath {
    inner: Path,
}

impl IcebergPath {
    /// Returns a new path with `part` appended. A part never contains the
    /// delimiter: slashes are escaped.
    pub fn child(&self, part: impl Into<String>) -> Self {
        Self { inner: self.inner.child(PathPart::from(part.into())) }
    }

    /// Appends a relative path that may contain several parts.
    pub fn join(&self, relative: &str) -> Self {
        Self {
            inner: self.inner.parts()
                .chain(Path::from(relative).parts())
                .collect()
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.inner.filename()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.as_ref().is_empty()
    }
}

impl AsRef<str> for IcebergPath {
    fn as_ref(&self) -> &str {
        self.inner.as_ref()
    }
}

impl From<&str> for IcebergPath {
    fn from(value: &str) -> Self {
        Self { inner: Path::from(value) }
    }
}

impl From<String> for IcebergPath {
    fn from(value: String) -> Self {
        Self { inner: Path::from(value) }
    }
}

impl<I> FromIterator<I> for IcebergPath
where
    I: Into<String>
{
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Self {
            inner: Path::from_iter(
                iter.into_iter().map(|s| PathPart::from(s.into()))
            )
        }
    }
}

impl std::fmt::Display for IcebergPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

/// Contains metadata about an object in the warehouse.
#[derive(Debug, Clone)]
pub struct IcebergObjectMeta {
    /// Location of the object relative to the warehouse root.
    pub location: IcebergPath,
    pub last_modified: chrono::DateTime<chrono::offset::Utc>,
    pub size: usize,
}

/// Object stores with injected faults.
#[cfg(test)]
pub(crate) mod testing {
    use std::fmt;

    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts,
        PutOptions, PutPayload, PutResult, Result,
    };

    use super::*;

    /// An in-memory store that can refuse create-only puts, or fail every put
    /// to a path containing a given pattern.
    #[derive(Debug, Default)]
    pub(crate) struct FaultyStore {
        inner: InMemory,
        no_create_puts: bool,
        failing_pattern: Option<&'static str>,
    }

    impl FaultyStore {
        /// A store answering `PutMode::Create` with `NotImplemented`, like S3
        /// without a conditional put mechanism.
        pub(crate) fn without_create_puts() -> Self {
            Self { no_create_puts: true, ..Default::default() }
        }

        /// A store failing every put to a path containing `pattern`.
        pub(crate) fn failing_puts(pattern: &'static str) -> Self {
            Self { failing_pattern: Some(pattern), ..Default::default() }
        }

        pub(crate) fn into_storage(self, location: &str) -> IcebergStorage {
            IcebergStorage::from_object_store(location, Arc::new(self)).unwrap()
        }
    }

    impl fmt::Display for FaultyStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FaultyStore")
        }
    }

    #[async_trait]
    impl ObjectStore for FaultyStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> Result<PutResult> {
            if self.no_create_puts && matches!(opts.mode, PutMode::Create) {
                return Err(ObjectStoreError::NotImplemented);
            }
            if self.failing_pattern.is_some_and(|pattern| location.as_ref().contains(pattern)) {
                return Err(ObjectStoreError::Generic {
                    store: "FaultyStore",
                    source: "disk full".into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::FaultyStore;

    fn memory() -> IcebergStorage {
        IcebergStorage::from_url("memory://warehouse", &HashMap::new()).unwrap()
    }

    #[tokio::test]
    async fn write_once_never_overwrites() {
        let storage = memory();
        let path = IcebergPath::from("raw/users/metadata/00000.metadata.json");

        storage.write_once(&path, Bytes::from("first")).await.unwrap();
        let err = storage.write_once(&path, Bytes::from("second")).await.unwrap_err();

        assert!(matches!(err, IcebergError::FileAlreadyExists { .. }));
        assert_eq!(storage.read(&path).await.unwrap(), Bytes::from("first"));
        assert!(storage.exists(&path).await.unwrap());
        assert!(!storage.exists(&IcebergPath::from("raw/none")).await.unwrap());
    }

    #[tokio::test]
    async fn uris_and_listing() {
        let storage = IcebergStorage::from_url("memory://warehouse/prod/", &HashMap::new()).unwrap();
        assert_eq!(storage.location(), "memory://warehouse/prod");

        let path = IcebergPath::from_iter(["raw", "users", "data", "a.parquet"]);
        let uri = storage.to_uri(&path);
        assert_eq!(uri, "memory://warehouse/prod/raw/users/data/a.parquet");
        assert_eq!(storage.create_path_from_url(&uri).unwrap(), path);
        assert!(storage.create_path_from_url("memory://other/raw/a.parquet").is_err());

        storage.write_once(&path, Bytes::from("x")).await.unwrap();
        let manifest = IcebergPath::from("raw/users").join("metadata/m0.avro");
        storage.write_once(&manifest, Bytes::from("y")).await.unwrap();
        storage.write_once(&IcebergPath::from("raw/orders/m1.avro"), Bytes::from("z")).await.unwrap();

        let listed = storage.list(&IcebergPath::from("raw/users")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|meta| meta.location == path));
        assert!(listed.iter().any(|meta| meta.location == manifest));
    }

    #[tokio::test]
    async fn local_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(dir.path()).unwrap();
        let storage = IcebergStorage::from_url(url.as_str(), &HashMap::new()).unwrap();

        let path = IcebergPath::from("ns/table/metadata/v1.json");
        storage.write_once(&path, Bytes::from("{}")).await.unwrap();
        assert!(storage.write_once(&path, Bytes::from("{}")).await.is_err());

        let uri = storage.to_uri(&path);
        assert!(uri.starts_with("file://"));
        assert_eq!(storage.read(&storage.create_path_from_url(&uri).unwrap()).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn stores_without_create_only_puts_are_refused() {
        let storage = FaultyStore::without_create_puts().into_storage("memory://warehouse");
        let path = IcebergPath::from("raw/users/metadata/00000.metadata.json");

        let err = storage.write_once(&path, Bytes::from("first")).await.unwrap_err();
        assert!(matches!(err, IcebergError::Unsupported(_)));
        assert!(!storage.exists(&path).await.unwrap());
    }

    #[test]
    fn azure_locations() {
        let options = HashMap::from([
            ("azure_storage_account_name".to_string(), "account".to_string()),
            ("azure_storage_account_key".to_string(), "a2V5".to_string()),
        ]);

        let storage = IcebergStorage::from_url(
            "abfss://lake@account.dfs.core.windows.net/warehouse/",
            &options
        ).unwrap();
        assert_eq!(storage.location(), "abfss://lake@account.dfs.core.windows.net/warehouse");
        let path = IcebergPath::from("raw/users/data/a.parquet");
        assert_eq!(storage.create_path_from_url(&storage.to_uri(&path)).unwrap(), path);

        let storage = IcebergStorage::from_url("az://lake/warehouse", &options).unwrap();
        assert_eq!(storage.location(), "az://lake/warehouse");

        assert!(matches!(
            IcebergStorage::from_url("az://lake/warehouse", &HashMap::from([
                ("aws_region".to_string(), "eu-west-1".to_string()),
            ])),
            Err(IcebergError::ConfigError(_))
        ));
    }

    #[test]
    fn unsupported_scheme() {
        assert!(matches!(
            IcebergStorage::from_url("ftp://host/warehouse", &HashMap::new()),
            Err(IcebergError::InvalidTableLocation(_))
        ));
    }
}
