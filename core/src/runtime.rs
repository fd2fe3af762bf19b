//! The content-delivery runtime factory.
//!
//! Caches a per-profile delivery config builder and a per-builder reader
//! pool; `create` produces a lightweight runtime per request that
//! references (does not own) the cached config and pooled readers.
//!
//! Both caches use a compute-if-absent idiom under a lock, so concurrent
//! callers observe exactly one builder and one pool per key, and the
//! computed values are `Arc`-published.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ConfigError, FilterError};
use crate::filter::{ExecutionContext, Filter};
use crate::interceptor::InterceptorChainFactory;
use crate::param::ParameterMap;
use crate::planner::{ContentDeliveryConfig, FilterProvider, StreamFilterProvider};
use crate::profile::ProfileSet;
use crate::reader::{ReaderPool, ReaderSettings};
use crate::resource::{GLOBAL_PARAMETERS, READER_SELECTOR};
use crate::seq::ResourceConfigSeq;
use crate::visitor::{ContentHandlerBinding, VisitorRegistry};

/// Global parameter naming the reader pool capacity.
pub const PARAM_READER_POOL_SIZE: &str = "reader-pool-size";

/// Global parameter naming the reader acquire timeout, in milliseconds.
pub const PARAM_READER_POOL_TIMEOUT_MS: &str = "reader-pool-timeout-ms";

const DEFAULT_POOL_SIZE: i64 = 1;
const DEFAULT_POOL_TIMEOUT_MS: i64 = 10_000;

/// Builds (and caches) the delivery config for one profile.
///
/// The provider list is consulted in order; the first provider accepting
/// the bindings plans them. Indices built with no extended bindings are
/// cached and shared by every runtime for the profile; a request carrying
/// extended bindings plans a fresh config from the same base bindings.
pub struct ContentDeliveryConfigBuilder {
    profile_set: ProfileSet,
    seqs: Vec<Arc<ResourceConfigSeq>>,
    visitors: Arc<VisitorRegistry>,
    providers: Vec<Arc<dyn FilterProvider>>,
    interceptors: InterceptorChainFactory,
    cached: Mutex<Option<Arc<ContentDeliveryConfig>>>,
}

impl ContentDeliveryConfigBuilder {
    /// Create a builder over the digested sequences.
    #[must_use]
    pub fn new(
        profile_set: ProfileSet,
        seqs: Vec<Arc<ResourceConfigSeq>>,
        visitors: Arc<VisitorRegistry>,
    ) -> Self {
        Self {
            profile_set,
            seqs,
            visitors,
            providers: vec![Arc::new(StreamFilterProvider)],
            interceptors: InterceptorChainFactory::new(),
            cached: Mutex::new(None),
        }
    }

    /// The profile this builder serves.
    #[must_use]
    pub fn profile_set(&self) -> &ProfileSet {
        &self.profile_set
    }

    /// Resolve the profile-filtered visitor bindings from the sequences.
    fn base_bindings(&self) -> Result<Vec<ContentHandlerBinding>, ConfigError> {
        let mut bindings = Vec::new();
        for seq in &self.seqs {
            for config in seq.resource_configs() {
                if !config.applies_to(&self.profile_set) {
                    continue;
                }
                if let Some(binding) = self.visitors.create_binding(config)? {
                    bindings.push(binding);
                }
            }
        }
        Ok(bindings)
    }

    /// Build the delivery config, reusing the cached no-extension build.
    pub fn build(
        &self,
        extended_bindings: &[ContentHandlerBinding],
    ) -> Result<Arc<ContentDeliveryConfig>, ConfigError> {
        if extended_bindings.is_empty() {
            if let Some(cached) = self.cached.lock().clone() {
                return Ok(cached);
            }
            let built = Arc::new(self.build_uncached(&self.base_bindings()?)?);
            let mut cached = self.cached.lock();
            if let Some(raced) = cached.clone() {
                return Ok(raced);
            }
            *cached = Some(Arc::clone(&built));
            return Ok(built);
        }

        let mut bindings = self.base_bindings()?;
        bindings.extend(extended_bindings.iter().cloned());
        Ok(Arc::new(self.build_uncached(&bindings)?))
    }

    fn build_uncached(
        &self,
        bindings: &[ContentHandlerBinding],
    ) -> Result<ContentDeliveryConfig, ConfigError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.is_provider(bindings))
            .ok_or_else(|| ConfigError::SchemaInvalid {
                reason: format!(
                    "no filter provider accepts the {} configured bindings",
                    bindings.len()
                ),
            })?;
        debug!(
            provider = provider.name(),
            profile = self.profile_set.base_profile(),
            bindings = bindings.len(),
            "building content delivery config"
        );
        provider.create_content_delivery_config(
            bindings,
            &std::collections::BTreeMap::new(),
            &self.interceptors,
        )
    }

    /// The merged global parameters visible to this profile.
    #[must_use]
    pub fn global_params(&self) -> ParameterMap {
        let mut params = ParameterMap::new();
        for seq in &self.seqs {
            for config in seq.resource_configs() {
                if config.selector_path().selector() == GLOBAL_PARAMETERS
                    && config.applies_to(&self.profile_set)
                {
                    params.extend_from(config.params());
                }
            }
        }
        params
    }

    /// Reader settings from the profile's reader resource (the last one
    /// wins), or defaults when none is configured.
    #[must_use]
    pub fn reader_settings(&self) -> ReaderSettings {
        let mut settings = ReaderSettings::default();
        for seq in &self.seqs {
            for config in seq.resource_configs() {
                if config.selector_path().selector() == READER_SELECTOR
                    && config.applies_to(&self.profile_set)
                {
                    settings = ReaderSettings::from_params(config.params());
                }
            }
        }
        settings
    }
}

impl std::fmt::Debug for ContentDeliveryConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDeliveryConfigBuilder")
            .field("profile", &self.profile_set.base_profile())
            .field("seqs", &self.seqs.len())
            .finish()
    }
}

/// A per-request execution runtime: the cached delivery config plus the
/// pooled readers serving it.
#[derive(Debug)]
pub struct ContentDeliveryRuntime {
    delivery: Arc<ContentDeliveryConfig>,
    pool: Arc<ReaderPool>,
    global_params: ParameterMap,
}

impl ContentDeliveryRuntime {
    /// The delivery config this runtime dispatches through.
    #[must_use]
    pub fn delivery_config(&self) -> &Arc<ContentDeliveryConfig> {
        &self.delivery
    }

    /// The reader pool backing this runtime.
    #[must_use]
    pub fn reader_pool(&self) -> &Arc<ReaderPool> {
        &self.pool
    }

    /// Create an execution context seeded with the global parameters as
    /// condition variables.
    #[must_use]
    pub fn new_execution_context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        for param in self.global_params.iter() {
            ctx.set_variable(&param.name, &param.value);
        }
        ctx
    }

    /// Filter a source document using a pooled reader.
    ///
    /// The reader returns to the pool when it reached a consistent
    /// document boundary, and is discarded otherwise.
    pub fn filter_source(
        &self,
        source: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        let mut reader = self.pool.acquire()?;
        let result = Filter::new(&self.delivery).filter_with_reader(&mut reader, source, ctx);
        if reader.at_document_boundary() {
            self.pool.release(reader);
        } else {
            self.pool.discard(reader);
        }
        result
    }
}

/// Caches delivery config builders per base profile and reader pools per
/// builder identity, handing out runtimes that reference both.
pub struct ContentDeliveryRuntimeFactory {
    seqs: Vec<Arc<ResourceConfigSeq>>,
    visitors: Arc<VisitorRegistry>,
    builders: Mutex<HashMap<String, Arc<ContentDeliveryConfigBuilder>>>,
    pools: Mutex<HashMap<usize, Arc<ReaderPool>>>,
}

impl ContentDeliveryRuntimeFactory {
    /// Create a factory over the digested sequences and visitor registry.
    #[must_use]
    pub fn new(seqs: Vec<Arc<ResourceConfigSeq>>, visitors: Arc<VisitorRegistry>) -> Self {
        Self {
            seqs,
            visitors,
            builders: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Produce a runtime for the profile, planning any extended bindings
    /// on top of the cached base config.
    pub fn create(
        &self,
        profile_set: &ProfileSet,
        extended_bindings: &[ContentHandlerBinding],
    ) -> Result<ContentDeliveryRuntime, ConfigError> {
        let builder = {
            let mut builders = self.builders.lock();
            Arc::clone(
                builders
                    .entry(profile_set.base_profile().to_string())
                    .or_insert_with(|| {
                        Arc::new(ContentDeliveryConfigBuilder::new(
                            profile_set.clone(),
                            self.seqs.clone(),
                            Arc::clone(&self.visitors),
                        ))
                    }),
            )
        };

        let delivery = builder.build(extended_bindings)?;

        let global_params = builder.global_params();
        let pool_size = global_params.int(PARAM_READER_POOL_SIZE, DEFAULT_POOL_SIZE)?;
        let timeout_ms = global_params.int(PARAM_READER_POOL_TIMEOUT_MS, DEFAULT_POOL_TIMEOUT_MS)?;

        let pool = {
            let mut pools = self.pools.lock();
            let key = Arc::as_ptr(&builder) as usize;
            Arc::clone(pools.entry(key).or_insert_with(|| {
                Arc::new(ReaderPool::new(
                    builder.reader_settings(),
                    pool_size.max(1) as usize,
                    Duration::from_millis(timeout_ms.max(0) as u64),
                ))
            }))
        };

        Ok(ContentDeliveryRuntime {
            delivery,
            pool,
            global_params,
        })
    }
}

impl std::fmt::Debug for ContentDeliveryRuntimeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDeliveryRuntimeFactory")
            .field("seqs", &self.seqs.len())
            .field("builders", &self.builders.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::digester::{digest_config, ExtensionDigesters, InMemoryResourceLocator};
    use crate::error::FilterError;
    use crate::selector::PathElement;
    use crate::visitor::{BeforeVisitor, Visitor};
    use crate::NS_CDRL_20;

    #[derive(Debug)]
    struct CountingBefore {
        hits: Arc<StdMutex<Vec<String>>>,
    }

    impl Visitor for CountingBefore {
        fn as_before(&self) -> Option<&dyn BeforeVisitor> {
            Some(self)
        }
    }

    impl BeforeVisitor for CountingBefore {
        fn visit_before(
            &self,
            element: &PathElement,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FilterError> {
            self.hits.lock().unwrap().push(element.local.clone());
            Ok(())
        }
    }

    fn fixture(hits: &Arc<StdMutex<Vec<String>>>) -> ContentDeliveryRuntimeFactory {
        let source = format!(
            r#"<cedra-resource-list xmlns="{NS_CDRL_20}">
                 <params>
                   <param name="reader-pool-size" type="int">2</param>
                 </params>
                 <resource-config selector="order/item">
                   <resource>com.acme.ItemVisitor</resource>
                 </resource-config>
                 <resource-config selector="audit" target-profile="mobile">
                   <resource>com.acme.ItemVisitor</resource>
                 </resource-config>
               </cedra-resource-list>"#
        );

        let hits = Arc::clone(hits);
        let visitors = Arc::new(
            crate::visitor::VisitorRegistry::builder()
                .visitor("com.acme.ItemVisitor", move |_| {
                    Ok(Arc::new(CountingBefore {
                        hits: Arc::clone(&hits),
                    }) as Arc<dyn Visitor>)
                })
                .build(),
        );

        let locator = InMemoryResourceLocator::new();
        let mut extensions = ExtensionDigesters::new();
        let seq = digest_config(
            &source,
            "root",
            &locator,
            &visitors,
            &mut extensions,
        )
        .unwrap();

        ContentDeliveryRuntimeFactory::new(vec![Arc::new(seq)], visitors)
    }

    #[test]
    fn runtime_filters_through_pooled_readers() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = fixture(&hits);
        let runtime = factory
            .create(&ProfileSet::new("default"), &[])
            .unwrap();

        let mut ctx = runtime.new_execution_context();
        runtime
            .filter_source("<order><item/><item/></order>", &mut ctx)
            .unwrap();

        assert_eq!(*hits.lock().unwrap(), ["item", "item"]);
        assert_eq!(runtime.reader_pool().capacity(), 2);
    }

    #[test]
    fn builders_and_pools_are_cached_per_profile() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = fixture(&hits);

        let first = factory.create(&ProfileSet::new("default"), &[]).unwrap();
        let second = factory.create(&ProfileSet::new("default"), &[]).unwrap();
        assert!(Arc::ptr_eq(first.reader_pool(), second.reader_pool()));
        assert!(Arc::ptr_eq(
            first.delivery_config(),
            second.delivery_config()
        ));

        let other = factory.create(&ProfileSet::new("mobile"), &[]).unwrap();
        assert!(!Arc::ptr_eq(first.reader_pool(), other.reader_pool()));
    }

    #[test]
    fn profile_targeting_filters_bindings() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = fixture(&hits);

        let default = factory.create(&ProfileSet::new("default"), &[]).unwrap();
        assert_eq!(default.delivery_config().before().get("audit").len(), 0);

        let mobile = factory.create(&ProfileSet::new("mobile"), &[]).unwrap();
        assert_eq!(mobile.delivery_config().before().get("audit").len(), 1);
    }

    #[test]
    fn extended_bindings_plan_a_fresh_config() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = fixture(&hits);

        let base = factory.create(&ProfileSet::new("default"), &[]).unwrap();

        let extra_config = crate::resource::ResourceConfig::new(
            "extra",
            &std::collections::BTreeMap::new(),
            &crate::expression::ExpressionEvaluatorFactory::new(),
        )
        .unwrap();
        let extended = crate::visitor::ContentHandlerBinding::new(
            Arc::new(extra_config),
            Arc::new(CountingBefore {
                hits: Arc::clone(&hits),
            }),
        );

        let extended_runtime = factory
            .create(&ProfileSet::new("default"), &[extended])
            .unwrap();
        assert_eq!(
            extended_runtime.delivery_config().before().get("extra").len(),
            1
        );
        assert!(!Arc::ptr_eq(
            base.delivery_config(),
            extended_runtime.delivery_config()
        ));

        // The cached base config is untouched.
        let again = factory.create(&ProfileSet::new("default"), &[]).unwrap();
        assert!(Arc::ptr_eq(base.delivery_config(), again.delivery_config()));
    }

    #[test]
    fn concurrent_creates_share_one_pool_per_profile() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(fixture(&hits));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            handles.push(std::thread::spawn(move || {
                let runtime = factory.create(&ProfileSet::new("default"), &[]).unwrap();
                Arc::as_ptr(runtime.reader_pool()) as usize
            }));
        }

        let pointers: std::collections::HashSet<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(pointers.len(), 1);
    }

    #[test]
    fn global_params_seed_condition_variables() {
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let factory = fixture(&hits);
        let runtime = factory.create(&ProfileSet::new("default"), &[]).unwrap();

        let ctx = runtime.new_execution_context();
        assert_eq!(ctx.variables().get("reader-pool-size"), Some("2"));
    }
}
