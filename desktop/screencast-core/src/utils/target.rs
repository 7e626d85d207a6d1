use smithay::backend::drm::{CreateDrmNodeError, DrmNode, NodeType};
use std::str::FromStr;

/// Where frames are rendered: a GPU render node or the EGL software device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    Hardware(DrmNode),
    Software,
}

impl RenderTarget {
    pub fn node(&self) -> Option<DrmNode> {
        match self {
            RenderTarget::Hardware(node) => Some(*node),
            RenderTarget::Software => None,
        }
    }
}

impl FromStr for RenderTarget {
    type Err = CreateDrmNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "software" => RenderTarget::Software,
            path => {
                let node = DrmNode::from_path(path)?;
                // a primary node works too, dma-bufs are allocated on its render node
                let node = node
                    .node_with_type(NodeType::Render)
                    .and_then(Result::ok)
                    .unwrap_or(node);
                RenderTarget::Hardware(node)
            }
        })
    }
}

impl From<DrmNode> for RenderTarget {
    fn from(node: DrmNode) -> Self {
        RenderTarget::Hardware(node)
    }
}

impl From<Option<DrmNode>> for RenderTarget {
    fn from(node: Option<DrmNode>) -> Self {
        node.map_or(RenderTarget::Software, RenderTarget::Hardware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_target_has_no_node() {
        let target: RenderTarget = "software".parse().unwrap();
        assert_eq!(target, RenderTarget::Software);
        assert_eq!(target.node(), None);
    }

    #[test]
    fn missing_node_is_an_error() {
        assert!("/nonexistent/renderD128".parse::<RenderTarget>().is_err());
    }
}
