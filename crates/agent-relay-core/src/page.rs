//! Page capabilities consumed by the session manager.
//!
//! The host (a browser bridge, a headless driver, a test fake) implements
//! these; nothing here renders anything.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{Point, Rect};

/// A live element on the page.
pub trait PageElement: Send + Sync + fmt::Debug {
    /// Lowercase tag name, e.g. `li`.
    fn tag_name(&self) -> String;

    /// Name of the UI component that rendered this element, if known.
    fn component_name(&self) -> Option<String> {
        None
    }

    /// Whether the element is still attached to the document.
    fn is_connected(&self) -> bool;

    /// Current bounding rectangle.
    fn bounding_rect(&self) -> Rect;
}

/// Shared handle to a page element.
pub type ElementRef = Arc<dyn PageElement>;

/// The document the elements live in.
pub trait Page: Send + Sync {
    /// Topmost element at `point`, if any.
    fn element_at(&self, point: Point) -> Option<ElementRef>;
}

/// Produces the snippet content describing a selection.
#[async_trait]
pub trait SnippetGenerator: Send + Sync {
    /// One snippet per element, or a combined snippet, at the generator's discretion.
    async fn generate(&self, elements: &[ElementRef]) -> Vec<String>;
}
