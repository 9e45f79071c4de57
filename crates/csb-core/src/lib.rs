//! Core domain model for CSB: categories, schedule entries, tenant config.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "csb-core";

/// Closed set of schedule kinds a tenant can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Raid,
    Trial,
    Social,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Raid, Category::Trial, Category::Social];

    /// Short stable key used in state-store keys and env/CLI surfaces.
    pub fn key(self) -> &'static str {
        match self {
            Category::Raid => "raid",
            Category::Trial => "trial",
            Category::Social => "social",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Category::Raid => "Raid Schedule",
            Category::Trial => "Trial Schedule",
            Category::Social => "Community Events",
        }
    }

    /// Accent color applied when a tenant has not chosen one.
    pub fn default_color(self) -> u32 {
        match self {
            Category::Raid => 0x2a_dd77,
            Category::Trial => 0xfd_0061,
            Category::Social => 0x8b_0000,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Error)]
#[error("unknown category: {0}")]
pub struct ParseCategoryError(String);

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raid" => Ok(Category::Raid),
            "trial" => Ok(Category::Trial),
            "social" => Ok(Category::Social),
            other => Err(ParseCategoryError(other.to_string())),
        }
    }
}

/// One scheduled run as read from the source-of-truth store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub run_type: String,
    pub start_ms: i64,
    /// Subgroup key the entry is displayed under (originating community name).
    pub subgroup: String,
    pub source_id: String,
    pub reference_link: Option<String>,
}

/// Entries grouped by subgroup key. BTreeMap keeps subgroup order stable,
/// which the fingerprint and the detail-unit ordering both rely on.
pub type GroupedEntries = BTreeMap<String, Vec<ScheduleEntry>>;

/// Tri-state accent color: explicit value, explicitly no accent, or the
/// category's built-in default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccentColor {
    #[default]
    Default,
    None,
    Custom(u32),
}

impl AccentColor {
    /// Explicit value wins; `None` renders without an accent; `Default`
    /// falls back to the category color.
    pub fn resolve(self, category: Category) -> Option<u32> {
        match self {
            AccentColor::Custom(color) => Some(color),
            AccentColor::None => None,
            AccentColor::Default => Some(category.default_color()),
        }
    }
}

/// Per-tenant, per-category display configuration plus the identifiers of
/// the units currently posted for it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub channel_id: Option<String>,
    #[serde(default)]
    pub enabled_sources: Vec<String>,
    #[serde(default)]
    pub accent_color: AccentColor,
    pub overview_unit: Option<String>,
    #[serde(default)]
    pub detail_units: Vec<String>,
}

impl CategoryConfig {
    /// A category is publishable once it has a target channel and at least
    /// one enabled source; otherwise reconciliation skips it entirely.
    pub fn is_publishable(&self) -> bool {
        self.channel_id.is_some() && !self.enabled_sources.is_empty()
    }
}

/// Full configuration for one tenant. Category configs are individual
/// fields indexed through [`Category`] rather than string-keyed lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub auto_sync: bool,
    pub setup_complete: bool,
    #[serde(default)]
    pub raid: CategoryConfig,
    #[serde(default)]
    pub trial: CategoryConfig,
    #[serde(default)]
    pub social: CategoryConfig,
}

impl TenantConfig {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            auto_sync: true,
            setup_complete: false,
            raid: CategoryConfig::default(),
            trial: CategoryConfig::default(),
            social: CategoryConfig::default(),
        }
    }

    pub fn category(&self, category: Category) -> &CategoryConfig {
        match category {
            Category::Raid => &self.raid,
            Category::Trial => &self.trial,
            Category::Social => &self.social,
        }
    }

    pub fn category_mut(&mut self, category: Category) -> &mut CategoryConfig {
        match category {
            Category::Raid => &mut self.raid,
            Category::Trial => &mut self.trial,
            Category::Social => &mut self.social,
        }
    }
}
