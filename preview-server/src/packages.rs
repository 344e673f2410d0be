//! Dependency installation and presets for `/preview/install`

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::CommandTemplate;
use crate::shell::{self, ShellError};

/// Named bundle of dependencies plus config files seeded when absent
#[derive(Debug)]
pub struct Preset {
    pub name: &'static str,
    pub packages: &'static [&'static str],
    pub configs: &'static [(&'static str, &'static str)],
}

const TAILWIND_CONFIG: &str = r#"/** @type {import('tailwindcss').Config} */
module.exports = {
  content: [
    './index.html',
    './src/**/*.{js,ts,jsx,tsx,mdx}',
    './app/**/*.{js,ts,jsx,tsx,mdx}',
    './pages/**/*.{js,ts,jsx,tsx,mdx}',
    './components/**/*.{js,ts,jsx,tsx,mdx}',
  ],
  theme: {
    extend: {},
  },
  plugins: [],
};
"#;

const POSTCSS_CONFIG: &str = r#"module.exports = {
  plugins: {
    tailwindcss: {},
    autoprefixer: {},
  },
};
"#;

const SHADCN_COMPONENTS: &str = r#"{
  "$schema": "https://ui.shadcn.com/schema.json",
  "style": "default",
  "rsc": false,
  "tsx": true,
  "tailwind": {
    "config": "tailwind.config.js",
    "css": "src/index.css",
    "baseColor": "slate",
    "cssVariables": true
  },
  "aliases": {
    "components": "@/components",
    "utils": "@/lib/utils"
  }
}
"#;

const SHADCN_UTILS: &str = r#"import { type ClassValue, clsx } from 'clsx';
import { twMerge } from 'tailwind-merge';

export function cn(...inputs: ClassValue[]) {
  return twMerge(clsx(inputs));
}
"#;

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "tailwind",
        packages: &["tailwindcss@3", "postcss", "autoprefixer"],
        configs: &[
            ("tailwind.config.js", TAILWIND_CONFIG),
            ("postcss.config.js", POSTCSS_CONFIG),
        ],
    },
    Preset {
        name: "shadcn",
        packages: &[
            "class-variance-authority",
            "clsx",
            "tailwind-merge",
            "lucide-react",
        ],
        configs: &[
            ("components.json", SHADCN_COMPONENTS),
            ("src/lib/utils.ts", SHADCN_UTILS),
        ],
    },
    Preset {
        name: "animations",
        packages: &["framer-motion"],
        configs: &[],
    },
    Preset {
        name: "forms",
        packages: &["react-hook-form", "zod", "@hookform/resolvers"],
        configs: &[],
    },
];

pub fn find_preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name == name)
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("packages or preset is required")]
    NothingToInstall,
    #[error("invalid package spec '{0}'")]
    InvalidPackage(String),
    #[error("unknown preset '{0}' (expected one of: {names})", names = preset_names())]
    UnknownPreset(String),
    #[error("failed to write {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("package install failed: {0}")]
    Install(#[from] ShellError),
}

impl PackageError {
    /// Errors caused by the request rather than the environment
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PackageError::NothingToInstall
                | PackageError::InvalidPackage(_)
                | PackageError::UnknownPreset(_)
        )
    }
}

fn preset_names() -> String {
    PRESETS.iter().map(|p| p.name).collect::<Vec<_>>().join(", ")
}

/// Validated install request
#[derive(Debug)]
pub struct InstallPlan {
    pub packages: Vec<String>,
    pub preset: Option<&'static Preset>,
}

/// Resolve the preset and merge its packages with the explicit ones.
pub fn plan(packages: &[String], preset: Option<&str>) -> Result<InstallPlan, PackageError> {
    let preset = match preset.map(str::trim).filter(|p| !p.is_empty()) {
        Some(name) => {
            Some(find_preset(name).ok_or_else(|| PackageError::UnknownPreset(name.to_string()))?)
        }
        None => None,
    };

    let mut merged: Vec<String> = Vec::new();
    let from_preset = preset.into_iter().flat_map(|p| p.packages.iter().map(|s| s.to_string()));
    for spec in from_preset.chain(packages.iter().map(|s| s.trim().to_string())) {
        validate_package_spec(&spec)?;
        if !merged.contains(&spec) {
            merged.push(spec);
        }
    }

    if merged.is_empty() {
        return Err(PackageError::NothingToInstall);
    }

    Ok(InstallPlan {
        packages: merged,
        preset,
    })
}

/// Reject specs that could be read as flags or carry shell syntax.
pub fn validate_package_spec(spec: &str) -> Result<(), PackageError> {
    let invalid = spec.is_empty()
        || spec.len() > 214
        || spec.starts_with('-')
        || spec
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || ";&|`$<>\\\"'(){}*?!#".contains(c));
    if invalid {
        return Err(PackageError::InvalidPackage(spec.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    pub installed: Vec<String>,
    pub configs_created: Vec<String>,
}

/// Install the planned packages, then seed the preset's missing config files.
pub async fn install(
    command: &CommandTemplate,
    workspace: &Path,
    plan: &InstallPlan,
    timeout: Duration,
) -> Result<InstallOutcome, PackageError> {
    let argv = command.render_with(&plan.packages);
    tracing::info!(
        workspace = %workspace.display(),
        packages = %plan.packages.join(" "),
        "Installing packages"
    );
    shell::run(&argv, workspace, &[], Some(timeout)).await?;

    let mut configs_created = Vec::new();
    if let Some(preset) = plan.preset {
        for (relative, contents) in preset.configs {
            let path = workspace.join(relative);
            if path.exists() {
                continue;
            }
            write_config(&path, contents).await?;
            configs_created.push(relative.to_string());
        }
    }

    Ok(InstallOutcome {
        installed: plan.packages.clone(),
        configs_created,
    })
}

async fn write_config(path: &Path, contents: &str) -> Result<(), PackageError> {
    let map_err = |source| PackageError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
    }
    tokio::fs::write(path, contents).await.map_err(map_err)
}
