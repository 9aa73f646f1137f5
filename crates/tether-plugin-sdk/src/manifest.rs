use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// On-disk `plugin.json` manifest located at the root of each plugin directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub author: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub flags: Vec<String>,
    pub api_version: u32,
    /// Backend executable relative to the plugin directory.
    pub backend: Option<String>,
}

impl PluginManifest {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn parsed_version(&self) -> Result<Option<semver::Version>> {
        self.version
            .as_deref()
            .map(|raw| {
                semver::Version::parse(raw)
                    .with_context(|| format!("invalid version `{raw}` in manifest `{}`", self.name))
            })
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("plugin manifest must declare a name");
        }
        self.parsed_version()?;
        if let Some(backend) = &self.backend {
            if backend.trim().is_empty() {
                bail!("plugin `{}` declares an empty backend path", self.name);
            }
        }
        Ok(())
    }
}
