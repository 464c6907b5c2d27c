use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::DurationString;

/// A named test artifact registered with the control plane.
///
/// Packages are configured at startup and immutable for the lifetime of the
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Unique name of the package.
    pub name: String,

    /// Filesystem location of the executable artifact served to workers.
    pub path: PathBuf,

    /// Integrity digest over the artifact, as declared by the operator.
    pub sha256sum: String,

    /// Minimum delay between two scheduler-created runs of this package.
    /// Overrides the scheduler-wide default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_delay: Option<DurationString>,

    /// The options the package's test binary accepts.
    #[serde(default)]
    pub options: Vec<PackageOption>,
}

impl Package {
    /// Materialize the package's default run arguments.
    ///
    /// Options without a default are omitted.
    pub fn default_args(&self) -> Vec<String> {
        self.options
            .iter()
            .filter_map(|opt| {
                let value = opt.default.as_deref().filter(|v| !v.is_empty())?;
                Some(
                    RunOption {
                        name: opt.name.clone(),
                        value: value.to_owned(),
                    }
                    .to_string(),
                )
            })
            .collect()
    }
}

/// A single option a package's test binary accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOption {
    pub name: String,

    /// Default value materialized into scheduled runs. `None` means the
    /// option is omitted unless explicitly set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub description: String,
}

/// An option resolved to a concrete value for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOption {
    pub name: String,
    pub value: String,
}

impl fmt::Display for RunOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}={}", self.name, self.value)
    }
}
