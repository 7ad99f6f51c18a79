//! Archive eligibility policy

use crate::config::{ArchiveConfig, ArchivePolicy};
use crate::error::ControllerResult;
use strand_types::{LabelSelector, Workflow};

/// Decides which finished workflows are archived
#[derive(Debug, Clone, Default)]
pub struct ArchiveGate {
    selector: LabelSelector,
}

impl ArchiveGate {
    pub fn new(selector: LabelSelector) -> Self {
        Self { selector }
    }

    pub fn everything() -> Self {
        Self::new(LabelSelector::Everything)
    }

    pub fn nothing() -> Self {
        Self::new(LabelSelector::Nothing)
    }

    /// Gate from an optional selector expression; absent means everything
    pub fn from_expression(expression: Option<&str>) -> ControllerResult<Self> {
        let selector = match expression {
            Some(expr) => LabelSelector::parse(expr)?,
            None => LabelSelector::Everything,
        };
        Ok(Self::new(selector))
    }

    /// Gate for the configured archive policy
    pub fn from_config(config: &ArchiveConfig) -> ControllerResult<Self> {
        match config.effective_policy()? {
            ArchivePolicy::Everything => Ok(Self::everything()),
            ArchivePolicy::Nothing => Ok(Self::nothing()),
            ArchivePolicy::Selector => Self::from_expression(config.label_selector.as_deref()),
        }
    }

    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }

    pub fn is_archivable(&self, wf: &Workflow) -> bool {
        self.selector.matches(&wf.metadata.labels)
    }
}
