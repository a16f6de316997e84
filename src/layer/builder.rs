//! Layer assembly
//!
//! [`LayerBuilder`] turns a [`ModuleList`] into one response body. Every module
//! build is started up front; outputs are then written in list order, framed by
//! the transport's contributions:
//!
//! ```text
//! BeginResponse
//!   BeginModules, (BeforeFirstModule | BeforeSubsequentModule) module AfterModule ..., EndModules
//!   BeginLayerModules, (BeforeFirstLayerModule | BeforeSubsequentLayerModule) module AfterLayerModule ..., EndLayerModules
//! EndResponse
//! [console.error(...) for each module error, debug mode only]
//! ```
//!
//! A module build may name modules to emit before and after it; those are built
//! on demand and framed like the module that requested them. A module that
//! reaches itself through before/after expansion fails the build with
//! [`AggrError::CircularModuleExpansion`].

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

use crate::core::AggrError;
use crate::deps::CompositeGraph;
use crate::formula::Features;
use crate::formula::has::split_plugin;

/// Insertion points for transport framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContributionType {
    /// Before anything else
    BeginResponse,
    /// Before the first non-required module
    BeginModules,
    /// Before the first non-required module's output
    BeforeFirstModule,
    /// Before each later non-required module's output
    BeforeSubsequentModule,
    /// After a non-required module's output
    AfterModule,
    /// After the last non-required module
    EndModules,
    /// Before the first required module
    BeginLayerModules,
    /// Before the first required module's output
    BeforeFirstLayerModule,
    /// Before each later required module's output
    BeforeSubsequentLayerModule,
    /// After a required module's output
    AfterLayerModule,
    /// After the last required module
    EndLayerModules,
    /// After everything else
    EndResponse,
}

/// Response framing supplied by the transport.
pub trait Transport: Send + Sync {
    /// Text to insert at `kind`, if any.
    ///
    /// `module` is set for the per-module insertion points; `required` lists the
    /// required modules of the layer.
    fn contribution(&self, kind: ContributionType, module: Option<&str>, required: &BTreeSet<String>) -> Option<String>;

    /// Transport inputs that change the response bytes.
    fn cache_key(&self) -> String {
        String::new()
    }
}

/// Why a module is in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    /// Requested directly
    Modules,
    /// Required by the layer, or reached from a required module by expansion
    Required,
    /// Added by another module's build as a before/after module
    BuildAdded,
}

/// One module of a [`ModuleList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleListEntry {
    /// Module id
    pub id: String,
    /// Why it is listed
    pub source: ModuleSource,
}

/// Ordered modules of a layer. Directly requested modules precede required ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleList {
    entries: Vec<ModuleListEntry>,
    required: BTreeSet<String>,
}

impl ModuleList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List for a request: `modules` as given, then each of `required` followed by
    /// its expanded dependencies under `features`. Each module is listed once.
    ///
    /// # Errors
    ///
    /// Fails if a required module is not in `graph`.
    pub fn resolve(
        graph: &CompositeGraph,
        modules: &[String],
        required: &[String],
        features: &Features,
    ) -> Result<Self, AggrError> {
        let mut list = Self::new();
        let mut seen = BTreeSet::new();
        for id in modules {
            if seen.insert(id.clone()) {
                list.push_module(id.clone())?;
            }
        }
        for id in required {
            list.add_required_name(id.clone());
            let expanded = graph.expanded_dependencies(id, features)?;
            for dep in std::iter::once(id.as_str()).chain(expanded.ids()) {
                if seen.insert(dep.to_string()) {
                    list.push_required(dep);
                }
            }
        }
        Ok(list)
    }

    /// Append a directly requested module.
    ///
    /// # Errors
    ///
    /// [`AggrError::LayerOrder`] if a required module has already been added.
    pub fn push_module(&mut self, id: impl Into<String>) -> Result<(), AggrError> {
        let id = id.into();
        if self.entries.iter().any(|e| e.source == ModuleSource::Required) {
            return Err(AggrError::LayerOrder {
                module: id,
                reason: "requested modules must precede required modules".to_string(),
            });
        }
        self.entries.push(ModuleListEntry {
            id,
            source: ModuleSource::Modules,
        });
        Ok(())
    }

    /// Append a required module (or one of its expanded dependencies).
    pub fn push_required(&mut self, id: impl Into<String>) {
        self.entries.push(ModuleListEntry {
            id: id.into(),
            source: ModuleSource::Required,
        });
    }

    /// Record `id` as one of the modules the layer was requested for.
    pub fn add_required_name(&mut self, id: impl Into<String>) {
        self.required.insert(id.into());
    }

    /// Modules the layer was requested for.
    #[must_use]
    pub const fn required_modules(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleListEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of one module build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleBuild {
    /// Built source
    pub output: String,
    /// The build's contribution to the layer cache key
    pub cache_key: Option<String>,
    /// Modules to emit before this one
    pub before: Vec<String>,
    /// Modules to emit after this one
    pub after: Vec<String>,
    /// Error message; the output then is an error module
    pub error: Option<String>,
}

/// Builds single modules.
pub trait ModuleBuildService: Send + Sync + 'static {
    /// Build `module_id`. A returned error fails the whole layer.
    fn build(&self, module_id: &str) -> BoxFuture<'static, Result<ModuleBuild>>;
}

/// Assembled layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerBuildOutput {
    /// Response body
    pub content: String,
    /// Source map, if one was produced
    pub source_map: Option<String>,
    /// Whether the result may be cached (no module reported an error)
    pub cacheable: bool,
    /// Cache key contributions of the module builds, in emission order
    pub module_keys: Vec<String>,
    /// Module error messages
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Assembly {
    out: String,
    count: usize,
    required: bool,
    module_keys: Vec<String>,
    errors: Vec<String>,
}

/// Assembles a layer from module builds.
pub struct LayerBuilder<'a> {
    transport: &'a dyn Transport,
    service: Arc<dyn ModuleBuildService>,
    debug: bool,
}

impl<'a> LayerBuilder<'a> {
    /// Builder emitting framing from `transport` and building modules with `service`.
    pub fn new(transport: &'a dyn Transport, service: Arc<dyn ModuleBuildService>) -> Self {
        Self {
            transport,
            service,
            debug: false,
        }
    }

    /// Append module errors to the response as `console.error` statements.
    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn start(&self, id: &str) -> JoinHandle<Result<ModuleBuild>> {
        tokio::spawn(self.service.build(id))
    }

    /// Build every module of `modules` and assemble the response.
    ///
    /// If the assembly fails, module builds that have not been consumed yet are
    /// aborted.
    pub async fn build(&self, modules: &ModuleList) -> Result<LayerBuildOutput> {
        let mut tasks: BuildTasks<&ModuleListEntry> = modules
            .iter()
            .map(|entry| (entry, self.start(&entry.id)))
            .collect();

        let required = modules.required_modules();
        let mut asm = Assembly::default();
        self.contribute(&mut asm, ContributionType::BeginResponse, None, required);

        while let Some((entry, joined)) = tasks.join_next().await {
            let build = module_build(&entry.id, joined)?;
            let mut chain = Vec::new();
            self.emit(&mut asm, &entry.id, entry.source, build, required, &mut chain)
                .await?;
        }

        if asm.count > 0 {
            let kind = if asm.required {
                ContributionType::EndLayerModules
            } else {
                ContributionType::EndModules
            };
            self.contribute(&mut asm, kind, None, required);
        }
        self.contribute(&mut asm, ContributionType::EndResponse, None, required);

        if self.debug {
            for error in &asm.errors {
                asm.out.push_str("\r\nconsole.error(\"");
                asm.out.push_str(&escape_js_string(error));
                asm.out.push_str("\");");
            }
        }

        if !asm.errors.is_empty() {
            tracing::debug!(
                target: "layer",
                "Layer has {} module errors and will not be cached",
                asm.errors.len()
            );
        }

        Ok(LayerBuildOutput {
            content: asm.out,
            source_map: None,
            cacheable: asm.errors.is_empty(),
            module_keys: asm.module_keys,
            errors: asm.errors,
        })
    }

    fn contribute(&self, asm: &mut Assembly, kind: ContributionType, module: Option<&str>, required: &BTreeSet<String>) {
        if let Some(text) = self.transport.contribution(kind, module, required) {
            asm.out.push_str(&text);
        }
    }

    fn emit<'b>(
        &'b self,
        asm: &'b mut Assembly,
        id: &'b str,
        source: ModuleSource,
        build: ModuleBuild,
        required: &'b BTreeSet<String>,
        chain: &'b mut Vec<String>,
    ) -> BoxFuture<'b, Result<()>> {
        async move {
            match source {
                ModuleSource::Required => {
                    if !asm.required && asm.count > 0 {
                        self.contribute(asm, ContributionType::EndModules, None, required);
                        asm.count = 0;
                    }
                    asm.required = true;
                }
                ModuleSource::Modules if asm.required => {
                    return Err(AggrError::LayerOrder {
                        module: id.to_string(),
                        reason: "requested module follows required modules".to_string(),
                    }
                    .into());
                }
                _ => {}
            }

            if chain.iter().any(|c| c == id) {
                let mut cycle = chain.clone();
                cycle.push(id.to_string());
                return Err(AggrError::CircularModuleExpansion {
                    chain: cycle.join(" -> "),
                }
                .into());
            }
            chain.push(id.to_string());

            for before in &build.before {
                let sub = self.build_added(before).await?;
                self.emit(asm, before, ModuleSource::BuildAdded, sub, required, chain)
                    .await?;
            }

            if let Some(key) = &build.cache_key {
                asm.module_keys.push(key.clone());
            }

            if asm.count == 0 {
                let kind = if asm.required {
                    ContributionType::BeginLayerModules
                } else {
                    ContributionType::BeginModules
                };
                self.contribute(asm, kind, None, required);
            }

            let kind = match (asm.count == 0, asm.required) {
                (true, true) => ContributionType::BeforeFirstLayerModule,
                (true, false) => ContributionType::BeforeFirstModule,
                (false, true) => ContributionType::BeforeSubsequentLayerModule,
                (false, false) => ContributionType::BeforeSubsequentModule,
            };
            // error modules are plain JavaScript even when the id names a plugin resource
            let framed_id = if build.error.is_some() {
                split_plugin(id).map_or(id, |(_, resource)| resource)
            } else {
                id
            };
            self.contribute(asm, kind, Some(framed_id), required);

            asm.count += 1;
            asm.out.push_str(&build.output);
            if let Some(error) = &build.error {
                tracing::warn!(target: "layer", "Module {} built with error: {}", id, error);
                asm.errors.push(error.clone());
            }

            let kind = if source == ModuleSource::Required || (source == ModuleSource::BuildAdded && asm.required) {
                ContributionType::AfterLayerModule
            } else {
                ContributionType::AfterModule
            };
            self.contribute(asm, kind, Some(framed_id), required);

            for after in &build.after {
                let sub = self.build_added(after).await?;
                self.emit(asm, after, ModuleSource::BuildAdded, sub, required, chain)
                    .await?;
            }

            chain.pop();
            Ok(())
        }
        .boxed()
    }

    async fn build_added(&self, id: &str) -> Result<ModuleBuild> {
        let mut task: BuildTasks<&str> = std::iter::once((id, self.start(id))).collect();
        let (_, joined) = task
            .join_next()
            .await
            .with_context(|| format!("Build of {id} was not started"))?;
        module_build(id, joined)
    }
}

/// Started module builds, consumed in start order.
///
/// Builds still pending when this is dropped are aborted.
struct BuildTasks<T> {
    pending: VecDeque<(T, JoinHandle<Result<ModuleBuild>>)>,
}

impl<T: Copy> BuildTasks<T> {
    async fn join_next(&mut self) -> Option<(T, Result<Result<ModuleBuild>, JoinError>)> {
        let (item, handle) = self.pending.front_mut()?;
        let item = *item;
        let joined = handle.await;
        self.pending.pop_front();
        Some((item, joined))
    }
}

impl<T> FromIterator<(T, JoinHandle<Result<ModuleBuild>>)> for BuildTasks<T> {
    fn from_iter<I: IntoIterator<Item = (T, JoinHandle<Result<ModuleBuild>>)>>(iter: I) -> Self {
        Self {
            pending: iter.into_iter().collect(),
        }
    }
}

impl<T> Drop for BuildTasks<T> {
    fn drop(&mut self) {
        for (_, handle) in &self.pending {
            handle.abort();
        }
    }
}

fn module_build(id: &str, joined: Result<Result<ModuleBuild>, JoinError>) -> Result<ModuleBuild> {
    let build = joined.with_context(|| format!("Build task for {id} panicked"))?;
    build.map_err(|e| {
        AggrError::ModuleBuildFailed {
            module: id.to_string(),
            reason: format!("{e:#}"),
        }
        .into()
    })
}

fn escape_js_string(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeModuleBuilds, TaggingTransport};
    use std::time::Duration;

    fn list(modules: &[&str], required: &[&str]) -> ModuleList {
        let mut list = ModuleList::new();
        for m in modules {
            list.push_module(*m).unwrap();
        }
        for r in required {
            list.push_required(*r);
            list.add_required_name(*r);
        }
        list
    }

    #[tokio::test]
    async fn test_framing_order() -> Result<()> {
        let builds = Arc::new(FakeModuleBuilds::new());
        let transport = TaggingTransport;
        let output = LayerBuilder::new(&transport, builds.clone())
            .build(&list(&["a", "b"], &["c"]))
            .await?;

        assert_eq!(
            output.content,
            "<BeginResponse><BeginModules><BeforeFirstModule:a>[a]<AfterModule:a>\
             <BeforeSubsequentModule:b>[b]<AfterModule:b><EndModules>\
             <BeginLayerModules><BeforeFirstLayerModule:c>[c]<AfterLayerModule:c>\
             <EndLayerModules><EndResponse>"
        );
        assert!(output.cacheable);
        assert_eq!(output.module_keys, vec!["key:a", "key:b", "key:c"]);
        assert_eq!(builds.build_count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_before_and_after_modules() -> Result<()> {
        let builds = Arc::new(
            FakeModuleBuilds::new()
                .with_before("a", &["x"])
                .with_after("a", &["y"]),
        );
        let output = LayerBuilder::new(&TaggingTransport, builds)
            .build(&list(&[], &["a"]))
            .await?;

        assert_eq!(
            output.content,
            "<BeginResponse><BeginLayerModules>\
             <BeforeFirstLayerModule:x>[x]<AfterLayerModule:x>\
             <BeforeSubsequentLayerModule:a>[a]<AfterLayerModule:a>\
             <BeforeSubsequentLayerModule:y>[y]<AfterLayerModule:y>\
             <EndLayerModules><EndResponse>"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_error_module_disables_caching() -> Result<()> {
        let builds = Arc::new(FakeModuleBuilds::new().with_error("text!b.html", "not \"found\""));
        let output = LayerBuilder::new(&TaggingTransport, builds)
            .debug(true)
            .build(&list(&["a", "text!b.html"], &[]))
            .await?;

        assert!(!output.cacheable);
        assert_eq!(output.errors, vec!["not \"found\"".to_string()]);
        assert!(output.content.contains("<BeforeSubsequentModule:b.html>"));
        assert!(output.content.ends_with("<EndResponse>\r\nconsole.error(\"not \\\"found\\\"\");"));
        Ok(())
    }

    #[tokio::test]
    async fn test_before_cycle_rejected() {
        let builds = Arc::new(
            FakeModuleBuilds::new()
                .with_before("a", &["b"])
                .with_before("b", &["a"]),
        );
        let err = LayerBuilder::new(&TaggingTransport, builds)
            .build(&list(&["a"], &[]))
            .await
            .unwrap_err();
        match err.downcast_ref::<AggrError>() {
            Some(AggrError::CircularModuleExpansion { chain }) => assert_eq!(chain, "a -> b -> a"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_module_build_fails_layer() {
        let builds = Arc::new(FakeModuleBuilds::new().with_failure("a"));
        let result = LayerBuilder::new(&TaggingTransport, builds)
            .build(&list(&["a"], &[]))
            .await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggrError>(),
            Some(AggrError::ModuleBuildFailed { module, .. }) if module == "a"
        ));
    }

    #[tokio::test]
    async fn test_failed_build_aborts_pending_builds() {
        let builds = Arc::new(
            FakeModuleBuilds::new()
                .with_failure("a")
                .with_module_delay("b", Duration::from_millis(200)),
        );
        let err = LayerBuilder::new(&TaggingTransport, builds.clone())
            .build(&list(&["a", "b"], &[]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggrError>(),
            Some(AggrError::ModuleBuildFailed { module, .. }) if module == "a"
        ));
        assert_eq!(builds.build_count(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(builds.completed_count(), 0);
    }

    #[test]
    fn test_module_list_order() {
        let mut list = ModuleList::new();
        list.push_module("a").unwrap();
        list.push_required("b");
        assert!(matches!(list.push_module("c"), Err(AggrError::LayerOrder { .. })));
        assert_eq!(list.len(), 2);
    }
}
