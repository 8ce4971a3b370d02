//! Cache categories and their freshness policies
//!
//! Every cached value belongs to exactly one [`CacheCategory`]. The category
//! selects a [`CachePolicy`] from a fixed catalog; callers may adjust any
//! field of that policy with [`PolicyOverrides`].

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{CacheError, Result};

/// Named cache policy bucket
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    /// Never stale, never collected, always persisted, warmed at startup
    Static,
    /// Medium freshness window, persisted
    #[default]
    Dynamic,
    /// Short freshness window, memory only
    Realtime,
    /// Tied to a logical session, persisted
    Session,
}

impl CacheCategory {
    /// All categories in catalog order
    pub const ALL: [CacheCategory; 4] = [
        CacheCategory::Static,
        CacheCategory::Dynamic,
        CacheCategory::Realtime,
        CacheCategory::Session,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Static => "static",
            CacheCategory::Dynamic => "dynamic",
            CacheCategory::Realtime => "realtime",
            CacheCategory::Session => "session",
        }
    }

    /// Catalog defaults for this category
    pub fn defaults(&self) -> CachePolicy {
        match self {
            CacheCategory::Static => CachePolicy {
                category: *self,
                stale_after: None,
                evict_after: None,
                persist: true,
                warm: true,
            },
            CacheCategory::Dynamic => CachePolicy {
                category: *self,
                stale_after: Some(Duration::from_secs(5 * 60)),
                evict_after: Some(Duration::from_secs(60 * 60)),
                persist: true,
                warm: false,
            },
            CacheCategory::Realtime => CachePolicy {
                category: *self,
                stale_after: Some(Duration::from_secs(30)),
                evict_after: Some(Duration::from_secs(5 * 60)),
                persist: false,
                warm: false,
            },
            CacheCategory::Session => CachePolicy {
                category: *self,
                stale_after: Some(Duration::from_secs(30 * 60)),
                evict_after: Some(Duration::from_secs(24 * 60 * 60)),
                persist: true,
                warm: false,
            },
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(CacheCategory::Static),
            "dynamic" => Ok(CacheCategory::Dynamic),
            "realtime" => Ok(CacheCategory::Realtime),
            "session" => Ok(CacheCategory::Session),
            _ => Err(CacheError::UnknownCategory {
                name: s.to_string(),
            }),
        }
    }
}

/// Resolved freshness and persistence parameters for one category
///
/// `None` for `stale_after` or `evict_after` means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub category: CacheCategory,
    /// Age at which a read should trigger a background refresh
    pub stale_after: Option<Duration>,
    /// Age at which an entry must no longer be served
    pub evict_after: Option<Duration>,
    /// Whether writes reach the durable tier
    pub persist: bool,
    /// Whether entries are loaded from the durable tier at startup
    pub warm: bool,
}

impl CachePolicy {
    /// Check `stale_after <= evict_after`, treating `None` as infinity
    pub fn validate(&self) -> Result<()> {
        match (self.stale_after, self.evict_after) {
            (None, Some(evict)) => Err(CacheError::InvalidPolicy {
                category: self.category.to_string(),
                message: format!(
                    "entries never go stale but are evicted after {}ms",
                    evict.as_millis()
                ),
            }),
            (Some(stale), Some(evict)) if stale > evict => Err(CacheError::InvalidPolicy {
                category: self.category.to_string(),
                message: format!(
                    "stale_after ({}ms) exceeds evict_after ({}ms)",
                    stale.as_millis(),
                    evict.as_millis()
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// Caller-supplied adjustments; each `Some` field replaces the default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub stale_after_ms: Option<u64>,
    pub evict_after_ms: Option<u64>,
    pub persist: Option<bool>,
}

impl PolicyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_after(mut self, duration: Duration) -> Self {
        self.stale_after_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn evict_after(mut self, duration: Duration) -> Self {
        self.evict_after_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stale_after_ms.is_none() && self.evict_after_ms.is_none() && self.persist.is_none()
    }

    /// Layer `other` on top of `self`; fields set in `other` win
    pub fn merged_with(&self, other: &PolicyOverrides) -> PolicyOverrides {
        PolicyOverrides {
            stale_after_ms: other.stale_after_ms.or(self.stale_after_ms),
            evict_after_ms: other.evict_after_ms.or(self.evict_after_ms),
            persist: other.persist.or(self.persist),
        }
    }
}

/// Merge the category defaults with `overrides`, field by field
pub fn resolve(category: CacheCategory, overrides: &PolicyOverrides) -> Result<CachePolicy> {
    let mut policy = category.defaults();

    if let Some(ms) = overrides.stale_after_ms {
        policy.stale_after = Some(Duration::from_millis(ms));
    }
    if let Some(ms) = overrides.evict_after_ms {
        policy.evict_after = Some(Duration::from_millis(ms));
    }
    if let Some(persist) = overrides.persist {
        policy.persist = persist;
    }

    policy.validate()?;
    Ok(policy)
}

/// Resolve a category given by name, failing on names outside the catalog
pub fn resolve_named(name: &str, overrides: &PolicyOverrides) -> Result<CachePolicy> {
    resolve(name.parse()?, overrides)
}
