//! DOM access for code that runs inside one loaded page.
//!
//! Element lookups are `(selector, index)` pairs resolved against the live document at call
//! time, so a handle can never outlive a re-render.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::RelayError;

#[async_trait]
pub trait Page: Send + Sync {
    /// Current location of the document.
    async fn location(&self) -> Result<String, RelayError>;

    /// Number of elements matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize, RelayError>;

    /// Trimmed text content of every element matching `selector`, in document order.
    async fn texts(&self, selector: &str) -> Result<Vec<String>, RelayError>;

    async fn attribute(
        &self,
        selector: &str,
        index: usize,
        name: &str,
    ) -> Result<Option<String>, RelayError>;

    async fn click(&self, selector: &str, index: usize) -> Result<(), RelayError>;

    /// Assigns the `value` property of an input or textarea.
    async fn set_value(&self, selector: &str, index: usize, value: &str)
        -> Result<(), RelayError>;

    /// Dispatches a bubbling DOM event of type `event`.
    async fn dispatch_event(
        &self,
        selector: &str,
        index: usize,
        event: &str,
    ) -> Result<(), RelayError>;

    /// Shows a floating notification that fades out after `duration`.
    async fn show_notification(&self, message: &str, duration: Duration)
        -> Result<(), RelayError>;
}
