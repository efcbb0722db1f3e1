//! Import chain composition
//!
//! A component may import a component of another package, by local path or
//! from a published skeleton (`oci://`). Imports are followed depth-first
//! into a chain of nodes; the tail holds the actual content and every node
//! knows where its package lives relative to the head package. Composing
//! the chain yields one component with content paths rewritten against the
//! head package.
//!
//! Only the last import of a chain may be remote.

use std::collections::HashMap;
use std::path::{Component as PathPart, Path, PathBuf};
use std::sync::Arc;

use airpack_core::package::{ActionSet, ChartSpec, Constant, ManifestSpec, Variable};
use airpack_core::{Component, PACKAGE_YAML, PackageDefinition, Progress};
use airpack_oci::{
    OciCache, OciReference, OciRemote, Registry, RootManifest, identity_key, is_empty,
};

use crate::error::{PackagerError, Result};
use crate::resolver::is_url;

/// One package definition visited while following imports
#[derive(Debug, Clone)]
pub struct ImportNode {
    /// The component as declared in its own package
    pub component: Component,
    /// Location of the package, for messages
    pub origin: String,
    /// Package directory relative to the head package, computed once
    relative_to_head: PathBuf,
    variables: Vec<Variable>,
    constants: Vec<Constant>,
}

/// Ordered import chain, head first
#[derive(Debug, Clone)]
pub struct ImportChain {
    nodes: Vec<ImportNode>,
}

impl ImportChain {
    fn new(head: Component, origin: String) -> Self {
        Self {
            nodes: vec![ImportNode {
                component: head,
                origin,
                relative_to_head: PathBuf::new(),
                variables: Vec::new(),
                constants: Vec::new(),
            }],
        }
    }

    pub fn tail(&self) -> &ImportNode {
        &self.nodes[self.nodes.len() - 1]
    }

    /// Whether the chain ends in a remote import
    pub fn has_remote_import(&self) -> bool {
        self.nodes.len() >= 2 && self.nodes[self.nodes.len() - 2].component.import.is_remote()
    }

    fn push(&mut self, node: ImportNode) {
        self.nodes.push(node);
    }

    /// Human-readable chain, `web -> ./child -> ./child/grandchild`
    pub fn describe(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.origin.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Flatten the chain into one component
    ///
    /// Nodes are merged from the tail towards the head, each with its paths
    /// rewritten against the head package. Files, data injections, images,
    /// repositories and actions accumulate; charts and manifests of the same
    /// name merge into one entry. Name, description, required and only are
    /// overlaid so the head's declaration wins.
    pub fn compose(&self) -> Component {
        if self.nodes.len() == 1 {
            return self.nodes[0].component.clone();
        }

        let mut composed = Component::default();
        for node in self.nodes.iter().rev() {
            let mut c = node.component.clone();
            fix_paths(&mut c, &node.relative_to_head);
            pin_action_defaults(&mut c.actions.on_create);

            composed.name = c.name;
            if c.description.is_some() {
                composed.description = c.description;
            }
            if c.required.is_some() {
                composed.required = c.required;
            }
            if !c.only.is_empty() {
                composed.only = c.only;
            }

            composed.files.extend(c.files);
            composed.data_injections.extend(c.data_injections);
            for image in c.images {
                if !composed.images.contains(&image) {
                    composed.images.push(image);
                }
            }
            for repo in c.repos {
                if !composed.repos.contains(&repo) {
                    composed.repos.push(repo);
                }
            }
            merge_charts(&mut composed.charts, c.charts);
            merge_manifests(&mut composed.manifests, c.manifests);

            let set = &mut composed.actions.on_create;
            let from = c.actions.on_create;
            set.before.extend(from.before);
            set.after.extend(from.after);
            set.on_success.extend(from.on_success);
            set.on_failure.extend(from.on_failure);
        }
        composed
    }

    /// Variables declared by imported packages, in chain order
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.nodes[1..].iter().flat_map(|n| n.variables.iter())
    }

    pub fn constants(&self) -> impl Iterator<Item = &Constant> {
        self.nodes[1..].iter().flat_map(|n| n.constants.iter())
    }
}

/// Prefix a relative local path with the package location
fn rebase(path: &mut String, relative: &Path) {
    if path.is_empty() || is_url(path) || path.contains("://") || Path::new(path).is_absolute() {
        return;
    }
    *path = normalize(&relative.join(path.as_str()))
        .to_string_lossy()
        .replace('\\', "/");
}

fn fix_paths(component: &mut Component, relative: &Path) {
    if relative.as_os_str().is_empty() {
        return;
    }
    for file in &mut component.files {
        rebase(&mut file.source, relative);
    }
    for data in &mut component.data_injections {
        rebase(&mut data.source, relative);
    }
    for chart in &mut component.charts {
        rebase(&mut chart.local_path, relative);
        for values in &mut chart.values_files {
            rebase(values, relative);
        }
    }
    for manifest in &mut component.manifests {
        for file in &mut manifest.files {
            rebase(file, relative);
        }
        for kustomization in &mut manifest.kustomizations {
            rebase(kustomization, relative);
        }
    }

    let set = &mut component.actions.on_create;
    if set.before.is_empty()
        && set.after.is_empty()
        && set.on_success.is_empty()
        && set.on_failure.is_empty()
    {
        return;
    }
    let default_dir = match set.defaults.dir.take() {
        Some(mut dir) => {
            rebase(&mut dir, relative);
            dir
        }
        None => relative.to_string_lossy().replace('\\', "/"),
    };
    set.defaults.dir = Some(default_dir);
    for action in set
        .before
        .iter_mut()
        .chain(set.after.iter_mut())
        .chain(set.on_success.iter_mut())
        .chain(set.on_failure.iter_mut())
    {
        if let Some(dir) = &mut action.dir {
            rebase(dir, relative);
        }
    }
}

/// Fold the set defaults into every action so sets of different packages
/// can share one list
fn pin_action_defaults(set: &mut ActionSet) {
    let defaults = std::mem::take(&mut set.defaults);
    for action in set
        .before
        .iter_mut()
        .chain(set.after.iter_mut())
        .chain(set.on_success.iter_mut())
        .chain(set.on_failure.iter_mut())
    {
        if action.mute.is_none() && defaults.mute {
            action.mute = Some(true);
        }
        action.max_total_seconds = action.max_total_seconds.or(defaults.max_total_seconds);
        action.max_retries = action.max_retries.or(defaults.max_retries);
        action.dir = action.dir.take().or_else(|| defaults.dir.clone());
        action.shell = action.shell.take().or_else(|| defaults.shell.clone());
        if !defaults.env.is_empty() {
            let mut env = defaults.env.clone();
            env.append(&mut action.env);
            action.env = env;
        }
    }
}

/// Charts of the same name merge: namespace and release name are
/// overridden, values files appended
fn merge_charts(charts: &mut Vec<ChartSpec>, overlay: Vec<ChartSpec>) {
    for chart in overlay {
        match charts.iter_mut().find(|c| c.name == chart.name) {
            Some(existing) => {
                if !chart.namespace.is_empty() {
                    existing.namespace = chart.namespace;
                }
                if !chart.release_name.is_empty() {
                    existing.release_name = chart.release_name;
                }
                existing.values_files.extend(chart.values_files);
            }
            None => charts.push(chart),
        }
    }
}

fn merge_manifests(manifests: &mut Vec<ManifestSpec>, overlay: Vec<ManifestSpec>) {
    for manifest in overlay {
        match manifests.iter_mut().find(|m| m.name == manifest.name) {
            Some(existing) => {
                if !manifest.namespace.is_empty() {
                    existing.namespace = manifest.namespace;
                }
                existing.files.extend(manifest.files);
                existing.kustomizations.extend(manifest.kustomizations);
                existing.kustomize_allow_any_directory |= manifest.kustomize_allow_any_directory;
            }
            None => manifests.push(manifest),
        }
    }
}

/// Lexically resolve `.` and `..`
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            PathPart::CurDir => {}
            PathPart::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(PathPart::Normal(_)))
                    && out.pop();
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `to` relative to `from`; both absolute
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// Find the component an import points at, honoring architecture filters
fn find_component<'p>(pkg: &'p PackageDefinition, name: &str, arch: &str) -> Option<&'p Component> {
    pkg.components.iter().find(|c| {
        c.name == name
            && c.only
                .cluster_architecture
                .as_deref()
                .is_none_or(|a| a.is_empty() || a == arch)
    })
}

/// A published package fetched for imports
struct RemotePackage {
    remote: OciRemote,
    root: RootManifest,
    definition: PackageDefinition,
}

/// Registry access for remote imports
#[derive(Clone)]
pub struct RemoteImports {
    registry: Arc<dyn Registry>,
    cache: OciCache,
}

impl RemoteImports {
    pub fn new(registry: Arc<dyn Registry>, cache: OciCache) -> Self {
        Self { registry, cache }
    }
}

/// Resolves the imports of a package rooted at `base`
pub struct Composer {
    base: PathBuf,
    arch: String,
    remote: Option<RemoteImports>,
}

impl Composer {
    pub fn new(base: impl AsRef<Path>, arch: impl Into<String>) -> Result<Self> {
        let base = std::path::absolute(base.as_ref()).map_err(|e| PackagerError::io(base.as_ref(), e))?;
        Ok(Self {
            base,
            arch: arch.into(),
            remote: None,
        })
    }

    pub fn with_remote(mut self, remote: RemoteImports) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replace every importing component of `pkg` with its composed form
    ///
    /// Variables and constants of imported packages are added when the
    /// head package does not already declare them.
    pub async fn compose_package(&self, pkg: &mut PackageDefinition, progress: &dyn Progress) -> Result<()> {
        let mut remotes = HashMap::new();
        for idx in 0..pkg.components.len() {
            if pkg.components[idx].import.is_empty() {
                continue;
            }
            let chain = self.chain(&pkg.components[idx], &mut remotes, progress).await?;
            tracing::debug!(
                component = %pkg.components[idx].name,
                chain = %chain.describe(),
                remote = chain.has_remote_import(),
                "composed import chain"
            );

            for variable in chain.variables() {
                if !pkg.variables.iter().any(|v| v.name == variable.name) {
                    pkg.variables.push(variable.clone());
                }
            }
            for constant in chain.constants() {
                if !pkg.constants.iter().any(|c| c.name == constant.name) {
                    pkg.constants.push(constant.clone());
                }
            }
            pkg.components[idx] = chain.compose();
        }
        Ok(())
    }

    /// Follow the imports of `head`
    async fn chain(
        &self,
        head: &Component,
        remotes: &mut HashMap<String, RemotePackage>,
        progress: &dyn Progress,
    ) -> Result<ImportChain> {
        let mut chain = ImportChain::new(head.clone(), head.name.clone());
        let mut visited = vec![canonical(&self.base)];

        loop {
            let tail = chain.tail();
            let import = tail.component.import.clone();
            if import.is_empty() {
                break;
            }
            let name = if import.name.is_empty() {
                tail.component.name.clone()
            } else {
                import.name.clone()
            };

            if import.is_remote() {
                let node = self
                    .remote_node(&head.name, &import.url, &name, remotes, progress)
                    .await?;
                chain.push(node);
                break;
            }

            let relative = normalize(&tail.relative_to_head.join(&import.path));
            let dir = self.base.join(&relative);
            let key = canonical(&dir);
            let origin = relative.to_string_lossy().replace('\\', "/");
            if visited.contains(&key) {
                return Err(PackagerError::ImportCycle {
                    chain: format!("{} -> {}", chain.describe(), origin),
                });
            }
            visited.push(key);

            let pkg = PackageDefinition::load(dir.join(PACKAGE_YAML))?;
            pkg.validate()?;
            let component = find_component(&pkg, &name, &self.arch)
                .cloned()
                .ok_or_else(|| PackagerError::ImportedComponentNotFound {
                    name: name.clone(),
                    path: origin.clone(),
                })?;
            chain.push(ImportNode {
                component,
                origin,
                relative_to_head: relative,
                variables: pkg.variables,
                constants: pkg.constants,
            });
        }
        Ok(chain)
    }

    /// Fetch the imported component of a published package into the cache
    async fn remote_node(
        &self,
        importer: &str,
        url: &str,
        name: &str,
        remotes: &mut HashMap<String, RemotePackage>,
        progress: &dyn Progress,
    ) -> Result<ImportNode> {
        let imports = self.remote.as_ref().ok_or_else(|| {
            PackagerError::config(format!(
                "component {} imports {} but no registry is configured",
                importer, url
            ))
        })?;

        if !remotes.contains_key(url) {
            let remote = OciRemote::new(imports.registry.clone(), OciReference::parse(url)?);
            let root = remote.fetch_root().await.map_err(|e| {
                PackagerError::config(format!(
                    "published skeleton package for {} does not exist: {}",
                    url, e
                ))
            })?;
            let definition = remote.fetch_definition(&root).await?;
            definition.validate()?;
            remotes.insert(
                url.to_string(),
                RemotePackage {
                    remote,
                    root,
                    definition,
                },
            );
        }
        let package = remotes
            .get(url)
            .ok_or_else(|| PackagerError::config(format!("remote package {} was not loaded", url)))?;

        let component = find_component(&package.definition, name, &self.arch)
            .cloned()
            .ok_or_else(|| PackagerError::ImportedComponentNotFound {
                name: name.to_string(),
                path: url.to_string(),
            })?;
        if component.import.is_remote() {
            return Err(PackagerError::NestedRemoteImport {
                component: importer.to_string(),
                url: url.to_string(),
            });
        }
        if !component.import.is_empty() {
            return Err(PackagerError::config(format!(
                "component {} of {} still declares an import; republish it with its imports resolved",
                name, url
            )));
        }

        let title = format!("components/{}.tar", name);
        let descriptor = package.root.locate(&title);
        let dir = if is_empty(&descriptor) {
            tracing::debug!(url = %url, component = %name, "remote component has no packaged files");
            imports.cache.empty_dir(&identity_key(url, name))?
        } else {
            let blob = imports
                .cache
                .fetch_blob(
                    package.remote.registry().as_ref(),
                    package.remote.reference(),
                    &descriptor,
                )
                .await?;
            progress.update(&format!("Pulled {} from {}", title, url));
            imports
                .cache
                .extract_dir(&blob, &descriptor.digest, 1)?
        };

        Ok(ImportNode {
            component,
            origin: url.to_string(),
            relative_to_head: relative_path(
                &self.base,
                &std::path::absolute(&dir).map_err(|e| PackagerError::io(&dir, e))?,
            ),
            variables: package.definition.variables.clone(),
            constants: package.definition.constants.clone(),
        })
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("../x/../../y")), PathBuf::from("../../y"));
        assert_eq!(normalize(Path::new("./")), PathBuf::new());
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/work/pkg"), Path::new("/cache/oci/dirs/abc")),
            PathBuf::from("../../cache/oci/dirs/abc")
        );
        assert_eq!(
            relative_path(Path::new("/work"), Path::new("/work/child")),
            PathBuf::from("child")
        );
    }

    #[test]
    fn test_rebase_skips_urls_and_absolute_paths() {
        let rel = Path::new("../shared");
        let mut local = "files/a.txt".to_string();
        let mut url = "https://example.com/a.txt".to_string();
        let mut abs = "/etc/hosts".to_string();
        rebase(&mut local, rel);
        rebase(&mut url, rel);
        rebase(&mut abs, rel);
        assert_eq!(local, "../shared/files/a.txt");
        assert_eq!(url, "https://example.com/a.txt");
        assert_eq!(abs, "/etc/hosts");
    }

    #[test]
    fn test_compose_overlays_head_metadata() {
        let head = Component {
            name: "web".to_string(),
            required: Some(true),
            import: airpack_core::ComponentImport {
                path: "child".to_string(),
                name: "site".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut chain = ImportChain::new(head, "web".to_string());
        chain.push(ImportNode {
            component: Component {
                name: "site".to_string(),
                description: Some("the site".to_string()),
                files: vec![airpack_core::ComponentFile {
                    source: "a.txt".to_string(),
                    target: "a.txt".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            origin: "child".to_string(),
            relative_to_head: PathBuf::from("child"),
            variables: Vec::new(),
            constants: Vec::new(),
        });

        let composed = chain.compose();
        assert_eq!(composed.name, "web");
        assert_eq!(composed.required, Some(true));
        assert_eq!(composed.description.as_deref(), Some("the site"));
        assert_eq!(composed.files[0].source, "child/a.txt");
        assert!(composed.import.is_empty());
        assert!(composed.actions.on_create.defaults.dir.is_none());
    }

    #[test]
    fn test_same_named_charts_merge() {
        let mut charts = vec![ChartSpec {
            name: "podinfo".to_string(),
            namespace: "leaf".to_string(),
            values_files: vec!["../leaf/values.yaml".to_string()],
            ..Default::default()
        }];
        merge_charts(
            &mut charts,
            vec![
                ChartSpec {
                    name: "podinfo".to_string(),
                    namespace: "app".to_string(),
                    values_files: vec!["values.yaml".to_string()],
                    ..Default::default()
                },
                ChartSpec {
                    name: "redis".to_string(),
                    ..Default::default()
                },
            ],
        );

        assert_eq!(charts.len(), 2);
        assert_eq!(charts[0].namespace, "app");
        assert_eq!(charts[0].values_files, vec!["../leaf/values.yaml", "values.yaml"]);
    }

    #[test]
    fn test_pin_action_defaults() {
        let mut set = ActionSet {
            defaults: airpack_core::ActionDefaults {
                dir: Some("../leaf".to_string()),
                env: vec!["A=1".to_string()],
                ..Default::default()
            },
            before: vec![
                airpack_core::Action {
                    cmd: "make".to_string(),
                    env: vec!["B=2".to_string()],
                    ..Default::default()
                },
                airpack_core::Action {
                    cmd: "ls".to_string(),
                    dir: Some("scripts".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        pin_action_defaults(&mut set);

        assert!(set.defaults.is_empty());
        assert_eq!(set.before[0].dir.as_deref(), Some("../leaf"));
        assert_eq!(set.before[0].env, vec!["A=1", "B=2"]);
        assert_eq!(set.before[1].dir.as_deref(), Some("scripts"));
    }
}
