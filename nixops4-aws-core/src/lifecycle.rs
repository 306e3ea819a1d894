use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Lifecycle of a resource as recorded in state.
///
/// `Missing -> Starting -> Up` is the only forward path. `Up -> Missing` happens
/// through an explicit destroy or a provider-confirmed deletion, and any state
/// can become `Unknown` when the provider gives an ambiguous answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    #[default]
    Missing,
    Starting,
    Up,
    Unknown,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Missing => "missing",
            Lifecycle::Starting => "starting",
            Lifecycle::Up => "up",
            Lifecycle::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
