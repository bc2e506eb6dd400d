//! Client platform classification.
//!
//! The heuristic is best effort: a misclassified device only gets the other
//! delivery mechanism and scale factor, the document itself is unaffected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformClass {
    Unrestricted,
    Restricted,
}

impl PlatformClass {
    pub fn scale_factor(self, config: &PipelineConfig) -> f32 {
        match self {
            PlatformClass::Unrestricted => config.scale_unrestricted,
            PlatformClass::Restricted => config.scale_restricted,
        }
    }
}

impl fmt::Display for PlatformClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformClass::Unrestricted => f.write_str("unrestricted"),
            PlatformClass::Restricted => f.write_str("restricted"),
        }
    }
}

/// Signals reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvironment {
    pub user_agent: String,
    pub platform: String,
    pub max_touch_points: u32,
}

impl ClientEnvironment {
    pub fn new(user_agent: impl Into<String>, platform: impl Into<String>, max_touch_points: u32) -> Self {
        ClientEnvironment {
            user_agent: user_agent.into(),
            platform: platform.into(),
            max_touch_points,
        }
    }

    /// Environment of a local desktop process.
    pub fn desktop() -> Self {
        ClientEnvironment::new("invoice-docgen", std::env::consts::OS, 0)
    }
}

fn ios_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"iPad|iPhone|iPod").expect("static pattern"))
}

pub fn detect(env: &ClientEnvironment) -> PlatformClass {
    let ios_agent = ios_pattern().is_match(&env.user_agent);
    // iPadOS reports a desktop Mac unless touch support gives it away.
    let ipad_desktop_mode = env.platform == "MacIntel" && env.max_touch_points > 1;
    if ios_agent || ipad_desktop_mode {
        PlatformClass::Restricted
    } else {
        PlatformClass::Unrestricted
    }
}
