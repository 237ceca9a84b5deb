use super::{
    BlockCache, CloudDataSource, DataSource, FileDataSource, NullDataSource, ObjectStore, OpenMode, SourceOpener,
};
use crate::config::CloudConfig;
use crate::Status;

use pointstream_core::SmallKeyHashMap;
use std::sync::Arc;

pub type SourceFactory = Arc<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

/// Splits `scheme://rest`. URLs without a scheme are treated as `file` paths.
pub fn split_url(url: &str) -> Result<(&str, &str), Status> {
    let (scheme, rest) = url.split_once("://").unwrap_or(("file", url));
    if scheme.is_empty() || (rest.is_empty() && scheme != "null") {
        return Err(Status::InvalidUrl(url.to_owned()));
    }
    Ok((scheme, rest))
}

/// Maps URL schemes to data source backends.
pub struct SourceRegistry {
    factories: SmallKeyHashMap<String, SourceFactory>,
}

impl Default for SourceRegistry {
    /// Registers the `file` and `null` backends.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("file", || Box::new(FileDataSource::default()));
        registry.register("null", || Box::new(NullDataSource::default()));
        registry
    }
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            factories: SmallKeyHashMap::default(),
        }
    }

    /// Registers (or replaces) the backend for `scheme`.
    pub fn register(
        &mut self,
        scheme: &str,
        factory: impl Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    ) {
        self.factories.insert(scheme.to_owned(), Arc::new(factory));
    }

    /// Registers the `cloud` scheme over `store`.
    pub fn register_cloud(
        &mut self,
        store: Arc<dyn ObjectStore>,
        config: CloudConfig,
        block_cache: Option<BlockCache>,
    ) {
        self.register("cloud", move || {
            Box::new(CloudDataSource::new(
                store.clone(),
                config,
                block_cache.clone(),
            ))
        });
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    /// Creates the backend for `url`'s scheme and opens it.
    pub fn open(&self, url: &str, mode: OpenMode) -> Result<Box<dyn DataSource>, Status> {
        self.opener(url, mode)?.open()
    }

    /// Resolves `url`'s backend once, so more sources over the same target can be opened later without the registry.
    pub fn opener(&self, url: &str, mode: OpenMode) -> Result<SourceOpener, Status> {
        let (scheme, _) = split_url(url)?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Status::UnknownScheme(scheme.to_owned()))?;
        Ok(SourceOpener::new(url, mode, factory.clone()))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    use crate::source::{MemoryObjectStore, SourceForm};

    #[test]
    fn urls_split_on_scheme() {
        assert_eq!(split_url("cloud://a/b").unwrap(), ("cloud", "a/b"));
        assert_eq!(split_url("/tmp/x.ptsv").unwrap(), ("file", "/tmp/x.ptsv"));
        assert_eq!(split_url("null://").unwrap(), ("null", ""));
        assert!(matches!(split_url("://x"), Err(Status::InvalidUrl(_))));
        assert!(matches!(split_url("cloud://"), Err(Status::InvalidUrl(_))));
    }

    #[test]
    fn schemes_resolve_to_backends() {
        let mut registry = SourceRegistry::default();
        assert!(matches!(
            registry.open("s3://bucket/x", OpenMode::Read),
            Err(Status::UnknownScheme(s)) if s == "s3"
        ));

        let null = registry.open("null://", OpenMode::Read).unwrap();
        assert!(null.is_open());

        let store = Arc::new(MemoryObjectStore::default());
        store.insert("scan", vec![7; 100]);
        registry.register_cloud(store, CloudConfig::default(), None);
        let mut cloud = registry.open("cloud://scan", OpenMode::Read).unwrap();
        assert_eq!(cloud.form(), SourceForm::Remote);
        assert_eq!(cloud.size().unwrap(), 100);
        let mut buf = [0u8; 10];
        cloud.read_exact_at(90, &mut buf).unwrap();
        assert_eq!(buf, [7; 10]);
    }
}
