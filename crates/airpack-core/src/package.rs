//! Package definition and loading
//!
//! A package definition (`airpack.yaml`) lists the components whose content is
//! assembled into a single airgap-ready archive.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{CoreError, Result};

/// File name of the package definition inside a package directory
pub const PACKAGE_YAML: &str = "airpack.yaml";

/// Architecture used for skeleton packages
pub const SKELETON_ARCH: &str = "skeleton";

static COMPONENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*$").expect("valid regex"));

/// Package kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    #[default]
    AirpackPackageConfig,
    AirpackInitConfig,
}

/// A package definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDefinition {
    #[serde(default)]
    pub kind: PackageKind,

    pub metadata: PackageMetadata,

    #[serde(default)]
    pub build: BuildData,

    #[serde(default)]
    pub components: Vec<Component>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constants: Vec<Constant>,
}

/// Package metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    /// Package name (required)
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Package version. Content-addressing and differential comparisons key on it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Target architecture
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,

    /// Skip compression of the final archive
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub uncompressed: bool,

    /// SHA-256 of `checksums.txt`, filled in during output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aggregate_checksum: String,
}

/// Build information stamped into the package at create time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub terminal: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrations: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub differential: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub differential_package_version: String,

    /// Components present in the base package but absent from this differential build
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differential_missing: Vec<String>,

    /// Registry rewrites applied to image references before pulling
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub registry_overrides: IndexMap<String, String>,
}

/// A named unit of deployable content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    #[serde(default, skip_serializing_if = "ComponentOnly::is_empty")]
    pub only: ComponentOnly,

    /// Import this component from another package
    #[serde(default, skip_serializing_if = "ComponentImport::is_empty")]
    pub import: ComponentImport,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ComponentFile>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_injections: Vec<DataInjection>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<ManifestSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ChartSpec>,

    /// Git repositories, `url[@ref]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,

    #[serde(default, skip_serializing_if = "ComponentActions::is_empty")]
    pub actions: ComponentActions,
}

impl Component {
    /// Whether the component declares any content to assemble
    pub fn has_content(&self) -> bool {
        !self.files.is_empty()
            || !self.data_injections.is_empty()
            || !self.manifests.is_empty()
            || !self.charts.is_empty()
            || !self.repos.is_empty()
            || !self.images.is_empty()
    }

    /// Whether the component has anything that lands in its component directory
    pub fn has_packaged_files(&self) -> bool {
        !self.files.is_empty()
            || !self.data_injections.is_empty()
            || !self.manifests.is_empty()
            || !self.charts.is_empty()
            || !self.repos.is_empty()
    }
}

/// Filters limiting where a component applies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOnly {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_os: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_architecture: Option<String>,
}

impl ComponentOnly {
    pub fn is_empty(&self) -> bool {
        self.local_os.is_none() && self.cluster_architecture.is_none()
    }
}

/// Import directive: pull a component definition from another package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentImport {
    /// Name of the component in the imported package (defaults to this component's name)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Relative path to a local package directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// `oci://` reference to a published skeleton package
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl ComponentImport {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.path.is_empty() && self.url.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        !self.url.is_empty()
    }
}

/// A file to place into the component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentFile {
    /// Local path or http(s) URL
    pub source: String,

    /// Expected SHA-256 of the materialized file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shasum: String,

    /// Path on the target system
    pub target: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symlinks: Vec<String>,

    /// Entry to extract when the source is an archive
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extract_path: String,
}

/// Data copied into a running container at deploy time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInjection {
    pub source: String,

    pub target: DataInjectionTarget,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInjectionTarget {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub selector: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,

    pub path: String,
}

/// Raw manifests and kustomizations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kustomizations: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub kustomize_allow_any_directory: bool,
}

/// Helm chart reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Chart repository, git repository or `oci://` URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_name: String,

    /// Chart directory inside a git repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_path: String,

    /// Chart directory on disk
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_path: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,
}

/// Lifecycle actions of a component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentActions {
    #[serde(default, skip_serializing_if = "ActionSet::is_empty")]
    pub on_create: ActionSet,
}

impl ComponentActions {
    pub fn is_empty(&self) -> bool {
        self.on_create.is_empty()
    }
}

/// Actions run at the phases of one lifecycle event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSet {
    #[serde(default, skip_serializing_if = "ActionDefaults::is_empty")]
    pub defaults: ActionDefaults,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Action>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.on_success.is_empty()
            && self.on_failure.is_empty()
            && self.defaults.is_empty()
    }
}

/// Defaults applied to every action of a set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefaults {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mute: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl ActionDefaults {
    pub fn is_empty(&self) -> bool {
        *self == ActionDefaults::default()
    }
}

/// A single command action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub cmd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Package-level variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prompt: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

/// Package-level constant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constant {
    pub name: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PackageDefinition {
    /// Load a package definition from a package directory or a direct path to `airpack.yaml`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(PACKAGE_YAML)
        } else {
            path.to_path_buf()
        };

        if !file.exists() {
            return Err(CoreError::PackageNotFound {
                path: file.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(&file).map_err(|e| CoreError::io(&file, e))?;
        Self::parse(&content)
    }

    /// Parse a package definition from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let pkg: Self = serde_yaml::from_str(content)?;
        Ok(pkg)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the definition with the given Unix mode
    pub fn write(&self, path: &Path, mode: u32) -> Result<()> {
        let content = self.to_yaml()?;
        if path.exists() {
            // A previous write may have left the file read-only
            make_writable(path)?;
        }
        std::fs::write(path, content).map_err(|e| CoreError::io(path, e))?;
        set_mode(path, mode)
    }

    pub fn is_init(&self) -> bool {
        self.kind == PackageKind::AirpackInitConfig
    }

    /// Whether this definition describes a skeleton package
    pub fn is_skeleton(&self) -> bool {
        self.build.architecture == SKELETON_ARCH
    }

    /// Effective architecture: metadata first, then build info
    pub fn architecture(&self) -> &str {
        if self.metadata.architecture.is_empty() {
            &self.build.architecture
        } else {
            &self.metadata.architecture
        }
    }

    /// Find a component by name
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Validate structural invariants of the definition
    ///
    /// - metadata name present
    /// - version, when set, is SemVer
    /// - component names well-formed and unique
    /// - import directives well-formed
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(CoreError::InvalidPackage {
                message: "metadata.name is required".to_string(),
            });
        }

        if !self.metadata.version.is_empty() {
            semver::Version::parse(self.metadata.version.trim_start_matches('v')).map_err(
                |source| CoreError::InvalidVersion {
                    version: self.metadata.version.clone(),
                    source,
                },
            )?;
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            if !COMPONENT_NAME.is_match(&component.name) {
                return Err(CoreError::InvalidComponent {
                    component: component.name.clone(),
                    message: "name must be lowercase alphanumeric or '-', starting with an alphanumeric"
                        .to_string(),
                });
            }
            if !seen.insert(component.name.as_str()) {
                return Err(CoreError::DuplicateComponent {
                    name: component.name.clone(),
                });
            }
            validate_import(component)?;
        }

        Ok(())
    }
}

fn validate_import(component: &Component) -> Result<()> {
    let import = &component.import;
    if import.is_empty() {
        return Ok(());
    }

    let invalid = |message: &str| CoreError::InvalidComponent {
        component: component.name.clone(),
        message: message.to_string(),
    };

    match (import.path.is_empty(), import.url.is_empty()) {
        (true, true) => return Err(invalid("import requires either a path or a url")),
        (false, false) => return Err(invalid("import cannot set both a path and a url")),
        _ => {}
    }

    if import.is_remote() && !import.url.starts_with("oci://") {
        return Err(invalid("import url must be an oci:// reference"));
    }

    if !import.path.is_empty() && Path::new(&import.path).is_absolute() {
        return Err(invalid("import path must be relative"));
    }

    if component.has_content() {
        return Err(invalid("an imported component cannot declare its own content"));
    }

    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| CoreError::io(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn make_writable(path: &Path) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .map_err(|e| CoreError::io(path, e))?
        .permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    std::fs::set_permissions(path, perms).map_err(|e| CoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"kind: AirpackPackageConfig
metadata:
  name: podinfo
  version: 1.0.0
  architecture: amd64
components:
  - name: podinfo-files
    files:
      - source: ./a.txt
        target: /opt/a.txt
        shasum: abc
    images:
      - ghcr.io/stefanprodan/podinfo:6.4.0
  - name: imported
    import:
      path: ../other
"#;

    #[test]
    fn test_parse_package() {
        let pkg = PackageDefinition::parse(SAMPLE).unwrap();
        assert_eq!(pkg.kind, PackageKind::AirpackPackageConfig);
        assert_eq!(pkg.metadata.name, "podinfo");
        assert_eq!(pkg.components.len(), 2);
        assert_eq!(pkg.components[0].files[0].shasum, "abc");
        assert_eq!(pkg.components[1].import.path, "../other");
        assert!(pkg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_component_names() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        pkg.components[1] = pkg.components[0].clone();

        let err = pkg.validate().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateComponent { ref name } if name == "podinfo-files"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_component_name() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        pkg.components[0].name = "Bad_Name".to_string();
        assert!(matches!(
            pkg.validate(),
            Err(CoreError::InvalidComponent { .. })
        ));
    }

    #[test]
    fn test_import_requires_single_source() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        pkg.components[1].import.url = "oci://ghcr.io/org/pkg:1.0.0-skeleton".to_string();
        assert!(pkg.validate().is_err());

        pkg.components[1].import.path.clear();
        assert!(pkg.validate().is_ok());

        pkg.components[1].import.url = "https://example.com/pkg".to_string();
        assert!(pkg.validate().is_err());
    }

    #[test]
    fn test_imported_component_cannot_have_content() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        pkg.components[1].images.push("nginx".to_string());
        assert!(pkg.validate().is_err());
    }

    #[test]
    fn test_invalid_version() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        pkg.metadata.version = "not-a-version".to_string();
        assert!(matches!(
            pkg.validate(),
            Err(CoreError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_yaml_roundtrip_omits_empty_fields() {
        let pkg = PackageDefinition::parse(SAMPLE).unwrap();
        let yaml = pkg.to_yaml().unwrap();
        assert!(!yaml.contains("dataInjections"));
        assert!(!yaml.contains("aggregateChecksum"));
        assert_eq!(PackageDefinition::parse(&yaml).unwrap(), pkg);
    }

    #[test]
    fn test_architecture_fallback() {
        let mut pkg = PackageDefinition::parse(SAMPLE).unwrap();
        assert_eq!(pkg.architecture(), "amd64");
        pkg.metadata.architecture.clear();
        pkg.build.architecture = "arm64".to_string();
        assert_eq!(pkg.architecture(), "arm64");
    }
}
